//! Linear layer that can be swapped to int8 in place
//!
//! `burn::nn::Linear` keeps a float `Param`; the components here need to
//! replace their projection weights after construction (LoRA fusion, dynamic
//! quantization), so the weight is held as an enum instead.

use burn::prelude::*;

use crate::lora::LoraWeight;
use crate::quantization::{QuantConfig, QuantizedLinear};

#[derive(Debug, Clone)]
enum LinearWeight<B: Backend> {
    Float {
        /// [out_features, in_features]
        weight: Tensor<B, 2>,
        bias: Option<Tensor<B, 1>>,
    },
    Quantized(QuantizedLinear<B>),
}

/// Linear projection `y = x W^T + b`
#[derive(Debug, Clone)]
pub struct DynLinear<B: Backend> {
    inner: LinearWeight<B>,
    in_features: usize,
    out_features: usize,
}

impl<B: Backend> DynLinear<B> {
    /// Create from a `[out_features, in_features]` weight
    pub fn new(weight: Tensor<B, 2>, bias: Option<Tensor<B, 1>>) -> Self {
        let [out_features, in_features] = weight.dims();
        Self {
            inner: LinearWeight::Float { weight, bias },
            in_features,
            out_features,
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self.inner, LinearWeight::Quantized(_))
    }

    /// Float weight, if the layer has not been quantized
    pub fn weight(&self) -> Option<&Tensor<B, 2>> {
        match &self.inner {
            LinearWeight::Float { weight, .. } => Some(weight),
            LinearWeight::Quantized(_) => None,
        }
    }

    pub fn bias(&self) -> Option<&Tensor<B, 1>> {
        match &self.inner {
            LinearWeight::Float { bias, .. } => bias.as_ref(),
            LinearWeight::Quantized(q) => q.bias.as_ref(),
        }
    }

    /// Apply over the last dimension of any-rank input
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let dims = x.dims();
        let rows: usize = dims[..D - 1].iter().product();
        let x = x.reshape([rows, self.in_features]);

        let y = match &self.inner {
            LinearWeight::Float { weight, bias } => {
                let y = x.matmul(weight.clone().transpose());
                match bias {
                    Some(b) => y + b.clone().unsqueeze(),
                    None => y,
                }
            }
            LinearWeight::Quantized(q) => q.forward(x),
        };

        let mut out_dims = dims;
        out_dims[D - 1] = self.out_features;
        y.reshape(out_dims)
    }

    /// Fuse a LoRA delta into the float weight
    ///
    /// Returns `false` when the layer is already quantized or the delta
    /// shape does not match.
    pub fn fuse_lora(&mut self, lora: &LoraWeight<B>, scale: f32) -> bool {
        match &mut self.inner {
            LinearWeight::Float { weight, .. } => {
                let delta = lora.compute_delta(scale);
                if delta.dims() != weight.dims() {
                    return false;
                }
                *weight = weight.clone() + delta;
                true
            }
            LinearWeight::Quantized(_) => false,
        }
    }

    /// Convert the weight to int8; no-op if already quantized
    pub fn quantize(&mut self, config: &QuantConfig) -> bool {
        let LinearWeight::Float { weight, bias } = &self.inner else {
            return false;
        };
        self.inner = LinearWeight::Quantized(QuantizedLinear::from_weight(
            weight.clone(),
            bias.clone(),
            config,
        ));
        true
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        let inner = match self.inner {
            LinearWeight::Float { weight, bias } => LinearWeight::Float {
                weight: weight.to_device(device),
                bias: bias.map(|b| b.to_device(device)),
            },
            LinearWeight::Quantized(q) => LinearWeight::Quantized(q.to_device(device)),
        };
        Self { inner, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_forward_3d() {
        let device = Default::default();
        let weight = Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0], [0.0, 2.0], [1.0, 1.0]], &device);
        let linear = DynLinear::new(weight, None);

        let x = Tensor::<TestBackend, 3>::from_floats([[[1.0, 2.0], [3.0, 4.0]]], &device);
        let y = linear.forward(x);

        assert_eq!(y.dims(), [1, 2, 3]);
        let values: Vec<f32> = y.into_data().to_vec().unwrap();
        assert_eq!(values, vec![1.0, 4.0, 3.0, 3.0, 8.0, 7.0]);
    }

    #[test]
    fn test_quantize_in_place() {
        let device = Default::default();
        let weight = Tensor::<TestBackend, 2>::from_floats([[0.5, -0.25], [1.0, 0.75]], &device);
        let mut linear = DynLinear::new(weight, None);

        let x = Tensor::<TestBackend, 2>::from_floats([[1.0, 1.0]], &device);
        let before = linear.forward(x.clone());

        assert!(linear.quantize(&QuantConfig::int8_dynamic()));
        assert!(linear.is_quantized());
        assert!(linear.weight().is_none());
        assert!(!linear.quantize(&QuantConfig::int8_dynamic()));

        let after = linear.forward(x);
        let max_diff: f32 = (before - after).abs().max().into_scalar().elem();
        assert!(max_diff < 0.05);
    }

    #[test]
    fn test_fuse_lora_rejects_quantized() {
        let device = Default::default();
        let weight = Tensor::<TestBackend, 2>::zeros([3, 4], &device);
        let mut linear = DynLinear::new(weight, None);

        let down = Tensor::<TestBackend, 2>::ones([2, 4], &device);
        let up = Tensor::<TestBackend, 2>::ones([3, 2], &device);
        let lora = LoraWeight::new(down, up, 2.0);

        assert!(linear.fuse_lora(&lora, 1.0));
        let fused: f32 = linear.weight().unwrap().clone().sum().into_scalar().elem();
        // alpha / rank = 1, each element = rank = 2
        assert_eq!(fused, 24.0);

        linear.quantize(&QuantConfig::int8_symmetric());
        assert!(!linear.fuse_lora(&lora, 1.0));
    }
}
