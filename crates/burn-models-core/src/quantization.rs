//! 8-bit dynamic quantization of linear layers
//!
//! Weights are quantized once, per tensor, onto a symmetric int8 grid.
//! Activations are quantized on every call with a scale derived from the
//! activation itself ("dynamic" quantization), so no calibration data is
//! needed. Asymmetric grids (scale plus zero point) are available for
//! weight-only quantization.

use burn::prelude::*;

/// Bit width and grid of a quantized tensor
#[derive(Debug, Clone, PartialEq)]
pub struct QuantConfig {
    pub bits: usize,
    /// Grid centred on zero, zero point fixed at 0
    pub symmetric: bool,
    /// Quantize activations at runtime as well as weights
    pub dynamic_activations: bool,
}

impl QuantConfig {
    /// INT8 symmetric per-tensor weight quantization
    pub fn int8_symmetric() -> Self {
        Self {
            bits: 8,
            symmetric: true,
            dynamic_activations: false,
        }
    }

    /// INT8 asymmetric per-tensor weight quantization
    pub fn int8_asymmetric() -> Self {
        Self {
            bits: 8,
            symmetric: false,
            dynamic_activations: false,
        }
    }

    /// INT8 symmetric weights with activations quantized per call
    pub fn int8_dynamic() -> Self {
        Self {
            bits: 8,
            symmetric: true,
            dynamic_activations: true,
        }
    }

    /// Smallest and largest integer level on the grid
    pub fn range(&self) -> (i64, i64) {
        if self.symmetric {
            let max = (1i64 << (self.bits - 1)) - 1;
            (-max, max)
        } else {
            let max = (1i64 << self.bits) - 1;
            (0, max)
        }
    }
}

/// Scale and zero point of one quantized tensor
#[derive(Debug, Clone)]
pub struct QuantParams<B: Backend> {
    /// Scale factor, shape [1]
    pub scale: Tensor<B, 1>,
    /// Zero point, shape [1]
    pub zero_point: Tensor<B, 1>,
    pub config: QuantConfig,
}

/// Integer levels plus what maps them back to floats
#[derive(Debug, Clone)]
pub struct QuantizedTensor<B: Backend> {
    pub data: Tensor<B, 2, Int>,
    pub params: QuantParams<B>,
}

impl<B: Backend> QuantizedTensor<B> {
    pub fn dequantize(&self) -> Tensor<B, 2> {
        let scale = self.params.scale.clone().reshape([1, 1]);
        let zero_point = self.params.zero_point.clone().reshape([1, 1]);
        (self.data.clone().float() - zero_point) * scale
    }

    /// Integer values as floats, without rescaling
    pub fn levels(&self) -> Tensor<B, 2> {
        self.data.clone().float()
    }

    pub fn dims(&self) -> [usize; 2] {
        self.data.dims()
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            data: self.data.to_device(device),
            params: QuantParams {
                scale: self.params.scale.to_device(device),
                zero_point: self.params.zero_point.to_device(device),
                config: self.params.config,
            },
        }
    }
}

/// Quantize a 2D tensor per tensor
pub fn quantize<B: Backend>(tensor: Tensor<B, 2>, config: &QuantConfig) -> QuantizedTensor<B> {
    let device = tensor.device();
    let (qmin, qmax) = config.range();

    let min_val: f32 = tensor.clone().min().into_scalar().elem();
    let max_val: f32 = tensor.clone().max().into_scalar().elem();

    let (scale, zero_point) = if config.symmetric {
        let abs_max = min_val.abs().max(max_val.abs());
        let scale = if abs_max > 0.0 {
            abs_max / qmax as f32
        } else {
            1.0
        };
        (scale, 0.0f32)
    } else {
        let scale = if (max_val - min_val).abs() > 1e-10 {
            (max_val - min_val) / (qmax - qmin) as f32
        } else {
            1.0
        };
        let zero_point = qmin as f32 - min_val / scale;
        (scale, zero_point.round())
    };

    let quantized = (tensor / scale + zero_point)
        .round()
        .clamp(qmin as f32, qmax as f32)
        .int();

    QuantizedTensor {
        data: quantized,
        params: QuantParams {
            scale: Tensor::from_floats([scale], &device),
            zero_point: Tensor::from_floats([zero_point], &device),
            config: config.clone(),
        },
    }
}

/// Quantize activations on the fly
///
/// Returns the integer levels (as floats) and the per-tensor scale, shape
/// [1, 1]. The scale stays on the device so no host readback happens.
pub fn quantize_activations<B: Backend>(
    x: Tensor<B, 2>,
    config: &QuantConfig,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let (_, qmax) = config.range();
    let scale = x.clone().abs().max().reshape([1, 1]).clamp_min(1e-8) / qmax as f32;
    let levels = (x / scale.clone())
        .round()
        .clamp(-(qmax as f32), qmax as f32);
    (levels, scale)
}

/// Linear layer with an int8 weight
#[derive(Debug, Clone)]
pub struct QuantizedLinear<B: Backend> {
    /// Quantized weight, [out_features, in_features]
    pub weight: QuantizedTensor<B>,
    /// Kept in float
    pub bias: Option<Tensor<B, 1>>,
}

impl<B: Backend> QuantizedLinear<B> {
    pub fn from_weight(
        weight: Tensor<B, 2>,
        bias: Option<Tensor<B, 1>>,
        config: &QuantConfig,
    ) -> Self {
        Self {
            weight: quantize(weight, config),
            bias,
        }
    }

    /// Forward pass on `[rows, in_features]`
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let config = &self.weight.params.config;
        let out = if config.dynamic_activations && config.symmetric {
            // int8 x int8 product, rescaled once by both scales
            let (levels, x_scale) = quantize_activations(x, config);
            let w_scale = self.weight.params.scale.clone().reshape([1, 1]);
            levels.matmul(self.weight.levels().transpose()) * (x_scale * w_scale)
        } else {
            x.matmul(self.weight.dequantize().transpose())
        };

        match &self.bias {
            Some(b) => out + b.clone().unsqueeze(),
            None => out,
        }
    }

    /// Memory used relative to f32
    pub fn memory_ratio(&self) -> f32 {
        self.weight.params.config.bits as f32 / 32.0
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            weight: self.weight.to_device(device),
            bias: self.bias.map(|b| b.to_device(device)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_quant_config() {
        let config = QuantConfig::int8_symmetric();
        assert_eq!(config.bits, 8);
        assert!(config.symmetric);
        assert_eq!(config.range(), (-127, 127));

        let config = QuantConfig::int8_asymmetric();
        assert_eq!(config.range(), (0, 255));

        assert!(QuantConfig::int8_dynamic().dynamic_activations);
    }

    #[test]
    fn test_quantize_dequantize_symmetric() {
        let device = Default::default();
        let config = QuantConfig::int8_symmetric();

        let tensor = Tensor::<TestBackend, 2>::from_floats(
            [[1.0, -2.0, 3.0, -4.0], [0.5, -0.5, 1.5, -1.5]],
            &device,
        );

        let quantized = quantize(tensor.clone(), &config);
        let dequantized = quantized.dequantize();

        let max_diff: f32 = (tensor - dequantized).abs().max().into_scalar().elem();
        assert!(max_diff < 0.05, "Max diff {} too large", max_diff);
    }

    #[test]
    fn test_quantize_dequantize_asymmetric() {
        let device = Default::default();
        let config = QuantConfig::int8_asymmetric();

        let tensor = Tensor::<TestBackend, 2>::from_floats(
            [[0.0, 1.0, 2.0, 3.0], [0.5, 1.5, 2.5, 3.5]],
            &device,
        );

        let quantized = quantize(tensor.clone(), &config);
        let dequantized = quantized.dequantize();

        let max_diff: f32 = (tensor - dequantized).abs().max().into_scalar().elem();
        assert!(max_diff < 0.05, "Max diff {} too large", max_diff);
    }

    #[test]
    fn test_dynamic_linear_matches_float() {
        let device = Default::default();

        let weight = Tensor::<TestBackend, 2>::from_floats(
            [[1.0, 2.0, 3.0, 4.0], [0.1, 0.2, 0.3, 0.4], [-1.0, -2.0, -3.0, -4.0]],
            &device,
        );
        let bias = Tensor::<TestBackend, 1>::from_floats([0.5, 0.0, -0.5], &device);
        let x = Tensor::<TestBackend, 2>::from_floats([[1.0, -1.0, 0.5, 0.25]], &device);

        let expected = x.clone().matmul(weight.clone().transpose()) + bias.clone().unsqueeze();
        let linear = QuantizedLinear::from_weight(weight, Some(bias), &QuantConfig::int8_dynamic());
        let out = linear.forward(x);

        assert_eq!(out.dims(), [1, 3]);
        let max_diff: f32 = (out - expected).abs().max().into_scalar().elem();
        assert!(max_diff < 0.1, "Max diff {} too large", max_diff);
        assert!((linear.memory_ratio() - 0.25).abs() < 0.01);
    }

    #[test]
    fn test_activation_levels_in_range() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::from_floats([[10.0, -20.0], [5.0, 0.0]], &device);
        let (levels, scale) = quantize_activations(x, &QuantConfig::int8_dynamic());

        let max_level: f32 = levels.abs().max().into_scalar().elem();
        let scale: f32 = scale.into_scalar().elem();
        assert_eq!(max_level, 127.0);
        assert!((scale - 20.0 / 127.0).abs() < 1e-6);
    }
}
