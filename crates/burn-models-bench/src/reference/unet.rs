//! Reference UNet denoiser
//!
//! Two resolution levels with skip connections and a self/cross-attention
//! middle block at 1/4 of the latent resolution.

use burn::prelude::*;
use burn_models_core::{AttentionConfig, Conv2dLayer, GroupNorm, LoraModel, QuantConfig};
use serde::{Deserialize, Serialize};

use super::blocks::{ResBlock, SpatialTransformer, TimestepEmbedding, Upsample, downsample, fuse_conv};
use super::weights::{LayerBuilder, WeightSource};
use crate::components::{ComputeModule, Denoiser};
use crate::error::Result;

/// Contents of `unet/config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UNetConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub model_channels: usize,
    pub norm_groups: usize,
    pub num_heads: usize,
    pub context_dim: usize,
    /// Native latent resolution
    pub sample_size: usize,
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            in_channels: 4,
            out_channels: 4,
            model_channels: 16,
            norm_groups: 4,
            num_heads: 2,
            context_dim: 32,
            sample_size: 64,
        }
    }
}

impl UNetConfig {
    /// Mid-block channel count
    pub fn mid_channels(&self) -> usize {
        self.model_channels * 2
    }

    pub fn time_embed_dim(&self) -> usize {
        self.model_channels * 4
    }
}

const DOWNSAMPLE_FACTOR: usize = 4;

#[derive(Debug, Clone)]
pub struct ReferenceUNet<B: Backend> {
    config: UNetConfig,
    time_embedding: TimestepEmbedding<B>,
    conv_in: Conv2dLayer<B>,
    down_0: ResBlock<B>,
    downsample_0: Conv2dLayer<B>,
    down_1: ResBlock<B>,
    downsample_1: Conv2dLayer<B>,
    mid_res_0: ResBlock<B>,
    mid_transformer: SpatialTransformer<B>,
    mid_res_1: ResBlock<B>,
    upsample_1: Upsample<B>,
    up_1: ResBlock<B>,
    upsample_0: Upsample<B>,
    up_0: ResBlock<B>,
    norm_out: GroupNorm<B>,
    conv_out: Conv2dLayer<B>,
    fused_kernels: bool,
    device: B::Device,
}

impl<B: Backend> ReferenceUNet<B> {
    pub fn new(config: UNetConfig, source: &mut dyn WeightSource, device: &B::Device) -> Result<Self> {
        let mut b = LayerBuilder::<B>::new(source, device);
        let c = config.model_channels;
        let mid = config.mid_channels();
        let groups = config.norm_groups;
        let temb = Some(config.time_embed_dim());

        Ok(Self {
            time_embedding: TimestepEmbedding::new(&mut b, "time_embedding", c, config.time_embed_dim())?,
            conv_in: b.conv("conv_in", config.in_channels, c, 3, 1)?,
            down_0: ResBlock::new(&mut b, "down.0.res", c, c, groups, temb)?,
            downsample_0: downsample(&mut b, "down.0.downsample", c)?,
            down_1: ResBlock::new(&mut b, "down.1.res", c, mid, groups, temb)?,
            downsample_1: downsample(&mut b, "down.1.downsample", mid)?,
            mid_res_0: ResBlock::new(&mut b, "mid.res.0", mid, mid, groups, temb)?,
            mid_transformer: SpatialTransformer::new(
                &mut b,
                "mid.transformer",
                mid,
                config.context_dim,
                groups,
                config.num_heads,
            )?,
            mid_res_1: ResBlock::new(&mut b, "mid.res.1", mid, mid, groups, temb)?,
            upsample_1: Upsample::new(&mut b, "up.1.upsample", mid)?,
            up_1: ResBlock::new(&mut b, "up.1.res", mid * 2, mid, groups, temb)?,
            upsample_0: Upsample::new(&mut b, "up.0.upsample", mid)?,
            up_0: ResBlock::new(&mut b, "up.0.res", mid + c, c, groups, temb)?,
            norm_out: b.group_norm("norm_out", groups, c)?,
            conv_out: b.conv("conv_out", c, config.out_channels, 3, 1)?,
            fused_kernels: false,
            device: device.clone(),
            config,
        })
    }

    pub fn config(&self) -> &UNetConfig {
        &self.config
    }

    fn res_blocks_mut(&mut self) -> [&mut ResBlock<B>; 6] {
        [
            &mut self.down_0,
            &mut self.down_1,
            &mut self.mid_res_0,
            &mut self.mid_res_1,
            &mut self.up_1,
            &mut self.up_0,
        ]
    }
}

impl<B: Backend> ComputeModule<B> for ReferenceUNet<B> {
    fn name(&self) -> &str {
        "unet"
    }

    fn set_attention(&mut self, config: AttentionConfig) {
        self.mid_transformer.set_attention(config);
    }

    fn attention(&self) -> AttentionConfig {
        self.mid_transformer.attention()
    }

    fn attention_candidates(&self) -> Vec<AttentionConfig> {
        vec![
            AttentionConfig::standard(),
            AttentionConfig::sliced(self.config.num_heads),
            AttentionConfig::memory_efficient(256),
            AttentionConfig::memory_efficient(1024),
        ]
    }

    fn set_fused_kernels(&mut self, enabled: bool) {
        self.fused_kernels = enabled;
    }

    fn fused_kernels(&self) -> bool {
        self.fused_kernels
    }

    fn set_graph_capture(&mut self, enabled: bool) {
        let device = self.device.clone();
        self.time_embedding.set_capture(enabled, &device);
    }

    fn quantize_dynamic(&mut self, config: &QuantConfig) -> usize {
        let mut converted = self.time_embedding.quantize(config) + self.mid_transformer.quantize(config);
        for block in self.res_blocks_mut() {
            converted += block.quantize(config);
        }
        converted
    }
}

impl<B: Backend> Denoiser<B> for ReferenceUNet<B> {
    fn forward(
        &self,
        sample: Tensor<B, 4>,
        timestep: Tensor<B, 1>,
        context: Tensor<B, 3>,
        mid_residual: Option<Tensor<B, 4>>,
    ) -> Tensor<B, 4> {
        let fused = self.fused_kernels;
        let emb = self.time_embedding.forward(timestep);
        let emb = Some(&emb);

        let h = self.conv_in.forward(sample);
        let skip_0 = self.down_0.forward(h, emb, fused);
        let h = self.downsample_0.forward(skip_0.clone());
        let skip_1 = self.down_1.forward(h, emb, fused);
        let h = self.downsample_1.forward(skip_1.clone());

        let h = self.mid_res_0.forward(h, emb, fused);
        let h = self.mid_transformer.forward(h, context);
        let mut h = self.mid_res_1.forward(h, emb, fused);
        if let Some(residual) = mid_residual {
            h = h + residual;
        }

        let h = self.upsample_1.forward(h);
        let h = self.up_1.forward(Tensor::cat(vec![h, skip_1], 1), emb, fused);
        let h = self.upsample_0.forward(h);
        let h = self.up_0.forward(Tensor::cat(vec![h, skip_0], 1), emb, fused);

        self.conv_out.forward(self.norm_out.forward_silu(h, fused))
    }

    fn in_channels(&self) -> usize {
        self.config.in_channels
    }

    fn sample_size(&self) -> usize {
        self.config.sample_size
    }

    fn downsample_factor(&self) -> usize {
        DOWNSAMPLE_FACTOR
    }

    fn context_dim(&self) -> usize {
        self.config.context_dim
    }

    fn model_channels(&self) -> usize {
        self.config.model_channels
    }

    fn fuse_lora(&mut self, lora: &LoraModel<B>) -> usize {
        let root = "unet";
        let mut fused = self.time_embedding.fuse_lora(&format!("{root}.time_embedding"), lora)
            + self.mid_transformer.fuse_lora(root, lora)
            + fuse_conv(&mut self.conv_in, &format!("{root}.conv_in"), lora)
            + fuse_conv(&mut self.conv_out, &format!("{root}.conv_out"), lora);
        for block in self.res_blocks_mut() {
            fused += block.fuse_lora(root, lora);
        }
        fused
    }

    fn to_device(self: Box<Self>, device: &B::Device) -> Box<dyn Denoiser<B>> {
        let unet = *self;
        Box::new(Self {
            time_embedding: unet.time_embedding.to_device(device),
            conv_in: unet.conv_in.to_device(device),
            down_0: unet.down_0.to_device(device),
            downsample_0: unet.downsample_0.to_device(device),
            down_1: unet.down_1.to_device(device),
            downsample_1: unet.downsample_1.to_device(device),
            mid_res_0: unet.mid_res_0.to_device(device),
            mid_transformer: unet.mid_transformer.to_device(device),
            mid_res_1: unet.mid_res_1.to_device(device),
            upsample_1: unet.upsample_1.to_device(device),
            up_1: unet.up_1.to_device(device),
            upsample_0: unet.upsample_0.to_device(device),
            up_0: unet.up_0.to_device(device),
            norm_out: unet.norm_out.to_device(device),
            conv_out: unet.conv_out.to_device(device),
            device: device.clone(),
            ..unet
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::weights::SeededWeights;
    use burn_models_core::{AttentionStrategy, PrecisionMode};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn unet() -> ReferenceUNet<TestBackend> {
        let mut source = SeededWeights::new("test-unet", PrecisionMode::Fp32);
        ReferenceUNet::new(UNetConfig::default(), &mut source, &Default::default()).unwrap()
    }

    fn inputs() -> (Tensor<TestBackend, 4>, Tensor<TestBackend, 1>, Tensor<TestBackend, 3>) {
        let device = Default::default();
        (
            Tensor::ones([2, 4, 8, 8], &device) * 0.5,
            Tensor::from_floats([999.0, 1.0], &device),
            Tensor::ones([2, 16, 32], &device) * 0.1,
        )
    }

    #[test]
    fn test_forward_shape() {
        let unet = unet();
        let (x, t, ctx) = inputs();
        let out = unet.forward(x, t, ctx, None);
        assert_eq!(out.dims(), [2, 4, 8, 8]);
    }

    #[test]
    fn test_mid_residual_changes_output() {
        let unet = unet();
        let (x, t, ctx) = inputs();
        let residual = Tensor::<TestBackend, 4>::ones([2, 32, 2, 2], &Default::default());

        let plain = unet.forward(x.clone(), t.clone(), ctx.clone(), None);
        let steered = unet.forward(x, t, ctx, Some(residual));
        let diff: f32 = (plain - steered).abs().sum().into_scalar().elem();
        assert!(diff > 0.0);
    }

    #[test]
    fn test_optimisation_hooks_preserve_output() {
        let mut unet = unet();
        let (x, t, ctx) = inputs();
        let reference = unet.forward(x.clone(), t.clone(), ctx.clone(), None);

        unet.set_fused_kernels(true);
        unet.set_graph_capture(true);
        unet.set_attention(AttentionConfig::memory_efficient(3));
        assert_eq!(unet.attention().strategy, AttentionStrategy::MemoryEfficient);
        let optimised = unet.forward(x, t, ctx, None);

        let diff: f32 = (reference - optimised).abs().max().into_scalar().elem();
        assert!(diff < 1e-3, "max diff {diff}");
    }

    #[test]
    fn test_quantize_counts_linear_layers() {
        let mut unet = unet();
        // 2 time embedding + 8 attention + 4 transformer + 6 res-block emb projections
        assert_eq!(unet.quantize_dynamic(&QuantConfig::int8_dynamic()), 20);
        assert_eq!(unet.quantize_dynamic(&QuantConfig::int8_dynamic()), 0);
    }
}
