//! Reference ControlNet
//!
//! Mirrors the denoiser's encoder half and emits a residual for its middle
//! block. A small convolutional hint encoder brings the control image down to
//! latent resolution.

use burn::prelude::*;
use burn::tensor::activation::silu;
use burn_models_core::{AttentionConfig, Conv2dLayer, QuantConfig};
use serde::{Deserialize, Serialize};

use super::blocks::{ResBlock, SpatialTransformer, TimestepEmbedding, downsample};
use super::weights::{LayerBuilder, WeightSource};
use crate::components::{ComputeModule, ConditioningAdapter};
use crate::error::Result;

/// Contents of a ControlNet `config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlNetConfig {
    pub in_channels: usize,
    pub model_channels: usize,
    pub norm_groups: usize,
    pub num_heads: usize,
    pub context_dim: usize,
    pub conditioning_channels: usize,
    /// Hint encoder widths; every entry after the first halves the resolution
    pub conditioning_embedding_channels: Vec<usize>,
}

impl Default for ControlNetConfig {
    fn default() -> Self {
        Self {
            in_channels: 4,
            model_channels: 16,
            norm_groups: 4,
            num_heads: 2,
            context_dim: 32,
            conditioning_channels: 3,
            conditioning_embedding_channels: vec![4, 8, 8, 16],
        }
    }
}

impl ControlNetConfig {
    /// Rebuild a config from tensor shapes, for single-file checkpoints
    ///
    /// Group and head counts cannot be recovered from shapes and keep their
    /// defaults.
    pub fn infer_from_shapes(shape_of: impl Fn(&str) -> Option<Vec<usize>>) -> Option<Self> {
        let conv_in = shape_of("conv_in.weight")?;
        let attn_k = shape_of("mid.transformer.attn2.to_k.weight")?;

        let mut widths = Vec::new();
        let mut conditioning_channels = None;
        while let Some(shape) = shape_of(&format!("controlnet_cond_embedding.blocks.{}.weight", widths.len())) {
            conditioning_channels.get_or_insert(shape[1]);
            widths.push(shape[0]);
        }

        Some(Self {
            in_channels: conv_in[1],
            model_channels: conv_in[0],
            context_dim: attn_k[1],
            conditioning_channels: conditioning_channels?,
            conditioning_embedding_channels: widths,
            ..Default::default()
        })
    }
}

/// Control image to latent-resolution features
#[derive(Debug, Clone)]
struct HintEncoder<B: Backend> {
    convs: Vec<Conv2dLayer<B>>,
    conv_out: Conv2dLayer<B>,
}

impl<B: Backend> HintEncoder<B> {
    fn new(builder: &mut LayerBuilder<'_, B>, config: &ControlNetConfig) -> Result<Self> {
        let widths = &config.conditioning_embedding_channels;
        let mut convs = Vec::with_capacity(widths.len());
        let mut in_channels = config.conditioning_channels;
        for (i, &width) in widths.iter().enumerate() {
            let stride = if i == 0 { 1 } else { 2 };
            let name = format!("controlnet_cond_embedding.blocks.{i}");
            convs.push(builder.conv(&name, in_channels, width, 3, stride)?);
            in_channels = width;
        }
        let conv_out = builder.conv(
            "controlnet_cond_embedding.conv_out",
            in_channels,
            config.model_channels,
            3,
            1,
        )?;
        Ok(Self { convs, conv_out })
    }

    fn forward(&self, control: Tensor<B, 4>) -> Tensor<B, 4> {
        let h = self
            .convs
            .iter()
            .fold(control, |h, conv| silu(conv.forward(h)));
        self.conv_out.forward(h)
    }

    fn to_device(self, device: &B::Device) -> Self {
        Self {
            convs: self.convs.into_iter().map(|c| c.to_device(device)).collect(),
            conv_out: self.conv_out.to_device(device),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceControlNet<B: Backend> {
    config: ControlNetConfig,
    time_embedding: TimestepEmbedding<B>,
    hint: HintEncoder<B>,
    conv_in: Conv2dLayer<B>,
    down_0: ResBlock<B>,
    downsample_0: Conv2dLayer<B>,
    down_1: ResBlock<B>,
    downsample_1: Conv2dLayer<B>,
    mid_res: ResBlock<B>,
    mid_transformer: SpatialTransformer<B>,
    mid_out: Conv2dLayer<B>,
    fused_kernels: bool,
    device: B::Device,
}

impl<B: Backend> ReferenceControlNet<B> {
    pub fn new(config: ControlNetConfig, source: &mut dyn WeightSource, device: &B::Device) -> Result<Self> {
        let mut b = LayerBuilder::<B>::new(source, device);
        let c = config.model_channels;
        let mid = c * 2;
        let groups = config.norm_groups;
        let temb = Some(c * 4);

        Ok(Self {
            time_embedding: TimestepEmbedding::new(&mut b, "time_embedding", c, c * 4)?,
            hint: HintEncoder::new(&mut b, &config)?,
            conv_in: b.conv("conv_in", config.in_channels, c, 3, 1)?,
            down_0: ResBlock::new(&mut b, "down.0.res", c, c, groups, temb)?,
            downsample_0: downsample(&mut b, "down.0.downsample", c)?,
            down_1: ResBlock::new(&mut b, "down.1.res", c, mid, groups, temb)?,
            downsample_1: downsample(&mut b, "down.1.downsample", mid)?,
            mid_res: ResBlock::new(&mut b, "mid.res.0", mid, mid, groups, temb)?,
            mid_transformer: SpatialTransformer::new(
                &mut b,
                "mid.transformer",
                mid,
                config.context_dim,
                groups,
                config.num_heads,
            )?,
            mid_out: b.conv("controlnet_mid_block", mid, mid, 1, 1)?,
            fused_kernels: false,
            device: device.clone(),
            config,
        })
    }

    pub fn config(&self) -> &ControlNetConfig {
        &self.config
    }
}

impl<B: Backend> ComputeModule<B> for ReferenceControlNet<B> {
    fn name(&self) -> &str {
        "controlnet"
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
        self.time_embedding.quantize(config)
            + self.mid_transformer.quantize(config)
            + self.down_0.quantize(config)
            + self.down_1.quantize(config)
            + self.mid_res.quantize(config)
    }
}

impl<B: Backend> ConditioningAdapter<B> for ReferenceControlNet<B> {
    fn forward(
        &self,
        sample: Tensor<B, 4>,
        timestep: Tensor<B, 1>,
        context: Tensor<B, 3>,
        control: Tensor<B, 4>,
        scale: f32,
    ) -> Tensor<B, 4> {
        let fused = self.fused_kernels;
        let emb = self.time_embedding.forward(timestep);
        let emb = Some(&emb);

        let h = self.conv_in.forward(sample) + self.hint.forward(control);
        let h = self.down_0.forward(h, emb, fused);
        let h = self.downsample_0.forward(h);
        let h = self.down_1.forward(h, emb, fused);
        let h = self.downsample_1.forward(h);
        let h = self.mid_res.forward(h, emb, fused);
        let h = self.mid_transformer.forward(h, context);

        self.mid_out.forward(h) * scale
    }

    fn in_channels(&self) -> usize {
        self.config.in_channels
    }

    fn model_channels(&self) -> usize {
        self.config.model_channels
    }

    fn context_dim(&self) -> usize {
        self.config.context_dim
    }

    fn to_device(self: Box<Self>, device: &B::Device) -> Box<dyn ConditioningAdapter<B>> {
        let net = *self;
        Box::new(Self {
            time_embedding: net.time_embedding.to_device(device),
            hint: net.hint.to_device(device),
            conv_in: net.conv_in.to_device(device),
            down_0: net.down_0.to_device(device),
            downsample_0: net.downsample_0.to_device(device),
            down_1: net.down_1.to_device(device),
            downsample_1: net.downsample_1.to_device(device),
            mid_res: net.mid_res.to_device(device),
            mid_transformer: net.mid_transformer.to_device(device),
            mid_out: net.mid_out.to_device(device),
            device: device.clone(),
            ..net
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::weights::{RecordingWeights, SeededWeights};
    use burn_models_core::PrecisionMode;
    use burn_ndarray::NdArray;
    use std::collections::HashMap;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_residual_shape_and_scale() {
        let device = Default::default();
        let mut source = SeededWeights::new("test-controlnet", PrecisionMode::Fp32);
        let net = ReferenceControlNet::<TestBackend>::new(ControlNetConfig::default(), &mut source, &device).unwrap();

        let sample = Tensor::<TestBackend, 4>::ones([1, 4, 8, 8], &device);
        let t = Tensor::from_floats([500.0], &device);
        let ctx = Tensor::<TestBackend, 3>::ones([1, 16, 32], &device);
        let control = Tensor::<TestBackend, 4>::ones([1, 3, 64, 64], &device);

        let full = net.forward(sample.clone(), t.clone(), ctx.clone(), control.clone(), 1.0);
        assert_eq!(full.dims(), [1, 32, 2, 2]);

        let off = net.forward(sample, t, ctx, control, 0.0);
        let total: f32 = off.abs().sum().into_scalar().elem();
        assert_eq!(total, 0.0);
    }

    #[test]
    fn test_infer_config_from_shapes() {
        let device = Default::default();
        let config = ControlNetConfig {
            context_dim: 24,
            ..Default::default()
        };
        let mut source = RecordingWeights::new(SeededWeights::new("infer", PrecisionMode::Fp32));
        ReferenceControlNet::<TestBackend>::new(config.clone(), &mut source, &device).unwrap();

        let shapes: HashMap<String, Vec<usize>> = source
            .into_entries()
            .into_iter()
            .map(|e| (e.name, e.shape))
            .collect();
        let inferred = ControlNetConfig::infer_from_shapes(|name| shapes.get(name).cloned());
        assert_eq!(inferred, Some(config));
    }
}
