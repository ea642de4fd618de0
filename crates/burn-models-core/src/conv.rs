//! 2D convolution and nearest upsampling on raw weights

use burn::prelude::*;
use burn::tensor::module::{conv2d, interpolate};
use burn::tensor::ops::{ConvOptions, InterpolateMode, InterpolateOptions};

use crate::lora::LoraConvWeight;

/// 2D convolution with square kernel, stride and padding
#[derive(Debug, Clone)]
pub struct Conv2dLayer<B: Backend> {
    /// [out_ch, in_ch, k, k]
    pub weight: Tensor<B, 4>,
    pub bias: Option<Tensor<B, 1>>,
    pub stride: usize,
    pub padding: usize,
}

impl<B: Backend> Conv2dLayer<B> {
    pub fn new(weight: Tensor<B, 4>, bias: Option<Tensor<B, 1>>, stride: usize, padding: usize) -> Self {
        Self {
            weight,
            bias,
            stride,
            padding,
        }
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let options = ConvOptions::new(
            [self.stride, self.stride],
            [self.padding, self.padding],
            [1, 1],
            1,
        );
        conv2d(x, self.weight.clone(), self.bias.clone(), options)
    }

    /// Fuse a conv LoRA delta; `false` on shape mismatch
    pub fn fuse_lora(&mut self, lora: &LoraConvWeight<B>, scale: f32) -> bool {
        let delta = lora.compute_delta(scale);
        if delta.dims() != self.weight.dims() {
            return false;
        }
        self.weight = self.weight.clone() + delta;
        true
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            weight: self.weight.to_device(device),
            bias: self.bias.map(|b| b.to_device(device)),
            ..self
        }
    }
}

/// Nearest-neighbour 2x upsampling
pub fn upsample_nearest<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    interpolate(
        x,
        [h * 2, w * 2],
        InterpolateOptions::new(InterpolateMode::Nearest),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_conv_shapes() {
        let device = Default::default();
        let weight = Tensor::<TestBackend, 4>::ones([8, 3, 3, 3], &device);
        let x = Tensor::<TestBackend, 4>::ones([1, 3, 16, 16], &device);

        let same = Conv2dLayer::new(weight.clone(), None, 1, 1);
        assert_eq!(same.forward(x.clone()).dims(), [1, 8, 16, 16]);

        let down = Conv2dLayer::new(weight, None, 2, 1);
        assert_eq!(down.forward(x).dims(), [1, 8, 8, 8]);
    }

    #[test]
    fn test_upsample_nearest() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::from_floats([[[[1.0, 2.0], [3.0, 4.0]]]], &device);
        let y = upsample_nearest(x);

        assert_eq!(y.dims(), [1, 1, 4, 4]);
        let values: Vec<f32> = y.into_data().to_vec().unwrap();
        assert_eq!(&values[0..4], &[1.0, 1.0, 2.0, 2.0]);
        assert_eq!(&values[12..16], &[3.0, 3.0, 4.0, 4.0]);
    }
}
