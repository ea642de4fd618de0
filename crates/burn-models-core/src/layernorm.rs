//! Layer normalization over the last dimension

use burn::prelude::*;

/// Layer normalization with raw affine tensors
///
/// ```text
/// y = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias
/// ```
#[derive(Debug, Clone)]
pub struct LayerNorm<B: Backend> {
    pub weight: Tensor<B, 1>,
    pub bias: Tensor<B, 1>,
    pub eps: f64,
}

impl<B: Backend> LayerNorm<B> {
    /// Identity-initialised layer norm
    pub fn new(size: usize, device: &B::Device) -> Self {
        Self::from_parts(Tensor::ones([size], device), Tensor::zeros([size], device))
    }

    pub fn from_parts(weight: Tensor<B, 1>, bias: Tensor<B, 1>) -> Self {
        Self {
            weight,
            bias,
            eps: 1e-5,
        }
    }

    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let last_dim = D - 1;
        let mean = x.clone().mean_dim(last_dim);
        let centred = x - mean;
        // Biased variance, as in the usual definition
        let var = centred.clone().powf_scalar(2.0).mean_dim(last_dim);

        let x_norm = centred / (var + self.eps).sqrt();
        x_norm * self.weight.clone().unsqueeze() + self.bias.clone().unsqueeze()
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            weight: self.weight.to_device(device),
            bias: self.bias.to_device(device),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_layernorm_normalises_rows() {
        let device = Default::default();
        let norm = LayerNorm::<TestBackend>::new(4, &device);

        let x = Tensor::<TestBackend, 2>::from_floats([[1.0, 2.0, 3.0, 4.0], [10.0, 10.0, 10.0, 30.0]], &device);
        let y = norm.forward(x);

        let means: Vec<f32> = y.clone().mean_dim(1).into_data().to_vec().unwrap();
        let vars: Vec<f32> = y.powf_scalar(2.0).mean_dim(1).into_data().to_vec().unwrap();
        for (m, v) in means.iter().zip(&vars) {
            assert!(m.abs() < 1e-5);
            assert!((v - 1.0).abs() < 1e-3);
        }
    }
}
