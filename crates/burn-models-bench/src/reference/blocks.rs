//! Blocks shared by the reference networks

use burn::prelude::*;
use burn::tensor::activation::{gelu, silu};
use burn_models_core::{
    Attention, AttentionConfig, Conv2dLayer, DynLinear, GroupNorm, LayerNorm, LoraModel, QuantConfig,
    upsample_nearest,
};

use super::weights::LayerBuilder;
use crate::error::Result;

pub(crate) fn fuse_linear<B: Backend>(layer: &mut DynLinear<B>, name: &str, lora: &LoraModel<B>) -> usize {
    lora.linear(name)
        .map_or(0, |weight| usize::from(layer.fuse_lora(weight, lora.scale)))
}

pub(crate) fn fuse_conv<B: Backend>(layer: &mut Conv2dLayer<B>, name: &str, lora: &LoraModel<B>) -> usize {
    lora.conv(name)
        .map_or(0, |weight| usize::from(layer.fuse_lora(weight, lora.scale)))
}

/// Sinusoidal frequency table for `channels`-wide timestep embeddings
pub(crate) fn timestep_frequencies<B: Backend>(channels: usize, device: &B::Device) -> Tensor<B, 1> {
    let half = channels / 2;
    let freqs: Vec<f32> = (0..half)
        .map(|i| (-(10000f32.ln()) * i as f32 / half as f32).exp())
        .collect();
    Tensor::from_data(TensorData::new(freqs, [half]), device)
}

/// Sinusoidal projection followed by a two-layer MLP
#[derive(Debug, Clone)]
pub(crate) struct TimestepEmbedding<B: Backend> {
    linear_1: DynLinear<B>,
    linear_2: DynLinear<B>,
    channels: usize,
    /// Resident frequency table while graph capture is on
    frequencies: Option<Tensor<B, 1>>,
}

impl<B: Backend> TimestepEmbedding<B> {
    pub fn new(builder: &mut LayerBuilder<'_, B>, prefix: &str, channels: usize, embed_dim: usize) -> Result<Self> {
        Ok(Self {
            linear_1: builder.linear(&format!("{prefix}.linear_1"), channels, embed_dim, true)?,
            linear_2: builder.linear(&format!("{prefix}.linear_2"), embed_dim, embed_dim, true)?,
            channels,
            frequencies: None,
        })
    }

    /// `timestep`: [batch] -> [batch, embed_dim]
    pub fn forward(&self, timestep: Tensor<B, 1>) -> Tensor<B, 2> {
        let frequencies = match &self.frequencies {
            Some(freqs) => freqs.clone(),
            None => timestep_frequencies(self.channels, &timestep.device()),
        };
        let args = timestep.unsqueeze_dim::<2>(1) * frequencies.unsqueeze_dim::<2>(0);
        let emb = Tensor::cat(vec![args.clone().cos(), args.sin()], 1);
        self.linear_2.forward(silu(self.linear_1.forward(emb)))
    }

    pub fn set_capture(&mut self, enabled: bool, device: &B::Device) {
        self.frequencies = enabled.then(|| timestep_frequencies(self.channels, device));
    }

    pub fn fuse_lora(&mut self, prefix: &str, lora: &LoraModel<B>) -> usize {
        fuse_linear(&mut self.linear_1, &format!("{prefix}.linear_1"), lora)
            + fuse_linear(&mut self.linear_2, &format!("{prefix}.linear_2"), lora)
    }

    pub fn quantize(&mut self, config: &QuantConfig) -> usize {
        usize::from(self.linear_1.quantize(config)) + usize::from(self.linear_2.quantize(config))
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            linear_1: self.linear_1.to_device(device),
            linear_2: self.linear_2.to_device(device),
            frequencies: self.frequencies.map(|f| f.to_device(device)),
            ..self
        }
    }
}

/// Residual block with optional timestep conditioning
#[derive(Debug, Clone)]
pub(crate) struct ResBlock<B: Backend> {
    prefix: String,
    norm1: GroupNorm<B>,
    conv1: Conv2dLayer<B>,
    emb_proj: Option<DynLinear<B>>,
    norm2: GroupNorm<B>,
    conv2: Conv2dLayer<B>,
    skip: Option<Conv2dLayer<B>>,
}

impl<B: Backend> ResBlock<B> {
    pub fn new(
        builder: &mut LayerBuilder<'_, B>,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        groups: usize,
        embed_dim: Option<usize>,
    ) -> Result<Self> {
        let emb_proj = match embed_dim {
            Some(dim) => Some(builder.linear(&format!("{prefix}.emb_proj"), dim, out_channels, true)?),
            None => None,
        };
        let skip = if in_channels != out_channels {
            Some(builder.conv(&format!("{prefix}.skip"), in_channels, out_channels, 1, 1)?)
        } else {
            None
        };

        Ok(Self {
            prefix: prefix.to_string(),
            norm1: builder.group_norm(&format!("{prefix}.norm1"), groups, in_channels)?,
            conv1: builder.conv(&format!("{prefix}.conv1"), in_channels, out_channels, 3, 1)?,
            emb_proj,
            norm2: builder.group_norm(&format!("{prefix}.norm2"), groups, out_channels)?,
            conv2: builder.conv(&format!("{prefix}.conv2"), out_channels, out_channels, 3, 1)?,
            skip,
        })
    }

    pub fn forward(&self, x: Tensor<B, 4>, emb: Option<&Tensor<B, 2>>, fused: bool) -> Tensor<B, 4> {
        let h = self.conv1.forward(self.norm1.forward_silu(x.clone(), fused));
        let h = match (&self.emb_proj, emb) {
            (Some(proj), Some(emb)) => {
                let [batch, channels, _, _] = h.dims();
                h + proj
                    .forward(silu(emb.clone()))
                    .reshape([batch, channels, 1, 1])
            }
            _ => h,
        };
        let h = self.conv2.forward(self.norm2.forward_silu(h, fused));

        let residual = match &self.skip {
            Some(skip) => skip.forward(x),
            None => x,
        };
        h + residual
    }

    pub fn fuse_lora(&mut self, root: &str, lora: &LoraModel<B>) -> usize {
        let prefix = format!("{root}.{}", self.prefix);
        let mut fused = fuse_conv(&mut self.conv1, &format!("{prefix}.conv1"), lora)
            + fuse_conv(&mut self.conv2, &format!("{prefix}.conv2"), lora);
        if let Some(proj) = &mut self.emb_proj {
            fused += fuse_linear(proj, &format!("{prefix}.emb_proj"), lora);
        }
        fused
    }

    pub fn quantize(&mut self, config: &QuantConfig) -> usize {
        self.emb_proj
            .as_mut()
            .map_or(0, |proj| usize::from(proj.quantize(config)))
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            norm1: self.norm1.to_device(device),
            conv1: self.conv1.to_device(device),
            emb_proj: self.emb_proj.map(|p| p.to_device(device)),
            norm2: self.norm2.to_device(device),
            conv2: self.conv2.to_device(device),
            skip: self.skip.map(|s| s.to_device(device)),
            ..self
        }
    }
}

/// Stride-2 convolution
pub(crate) fn downsample<B: Backend>(builder: &mut LayerBuilder<'_, B>, prefix: &str, channels: usize) -> Result<Conv2dLayer<B>> {
    builder.conv(prefix, channels, channels, 3, 2)
}

/// Nearest 2x upsampling followed by a 3x3 convolution
#[derive(Debug, Clone)]
pub(crate) struct Upsample<B: Backend> {
    conv: Conv2dLayer<B>,
}

impl<B: Backend> Upsample<B> {
    pub fn new(builder: &mut LayerBuilder<'_, B>, prefix: &str, channels: usize) -> Result<Self> {
        Ok(Self {
            conv: builder.conv(&format!("{prefix}.conv"), channels, channels, 3, 1)?,
        })
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(upsample_nearest(x))
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            conv: self.conv.to_device(device),
        }
    }
}

fn to_tokens<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 3> {
    let [batch, channels, height, width] = x.dims();
    x.reshape([batch, channels, height * width]).swap_dims(1, 2)
}

fn from_tokens<B: Backend>(x: Tensor<B, 3>, height: usize, width: usize) -> Tensor<B, 4> {
    let [batch, _, channels] = x.dims();
    x.swap_dims(1, 2).reshape([batch, channels, height, width])
}

/// Self-attention, cross-attention and feed-forward over spatial tokens
#[derive(Debug, Clone)]
pub(crate) struct SpatialTransformer<B: Backend> {
    prefix: String,
    norm: GroupNorm<B>,
    proj_in: DynLinear<B>,
    norm1: LayerNorm<B>,
    attn1: Attention<B>,
    norm2: LayerNorm<B>,
    attn2: Attention<B>,
    norm3: LayerNorm<B>,
    ff_1: DynLinear<B>,
    ff_2: DynLinear<B>,
    proj_out: DynLinear<B>,
}

impl<B: Backend> SpatialTransformer<B> {
    pub fn new(
        builder: &mut LayerBuilder<'_, B>,
        prefix: &str,
        channels: usize,
        context_dim: usize,
        groups: usize,
        heads: usize,
    ) -> Result<Self> {
        Ok(Self {
            prefix: prefix.to_string(),
            norm: builder.group_norm(&format!("{prefix}.norm"), groups, channels)?,
            proj_in: builder.linear(&format!("{prefix}.proj_in"), channels, channels, true)?,
            norm1: builder.layer_norm(&format!("{prefix}.norm1"), channels)?,
            attn1: builder.attention(&format!("{prefix}.attn1"), channels, channels, heads)?,
            norm2: builder.layer_norm(&format!("{prefix}.norm2"), channels)?,
            attn2: builder.attention(&format!("{prefix}.attn2"), channels, context_dim, heads)?,
            norm3: builder.layer_norm(&format!("{prefix}.norm3"), channels)?,
            ff_1: builder.linear(&format!("{prefix}.ff.linear_1"), channels, channels * 4, true)?,
            ff_2: builder.linear(&format!("{prefix}.ff.linear_2"), channels * 4, channels, true)?,
            proj_out: builder.linear(&format!("{prefix}.proj_out"), channels, channels, true)?,
        })
    }

    pub fn forward(&self, x: Tensor<B, 4>, context: Tensor<B, 3>) -> Tensor<B, 4> {
        let [_, _, height, width] = x.dims();

        let h = self.proj_in.forward(to_tokens(self.norm.forward(x.clone())));
        let h = h.clone() + self.attn1.forward(self.norm1.forward(h), None);
        let h = h.clone() + self.attn2.forward(self.norm2.forward(h), Some(context));
        let h = h.clone() + self.ff_2.forward(gelu(self.ff_1.forward(self.norm3.forward(h))));
        let h = self.proj_out.forward(h);

        x + from_tokens(h, height, width)
    }

    pub fn attention(&self) -> AttentionConfig {
        self.attn1.config
    }

    pub fn set_attention(&mut self, config: AttentionConfig) {
        self.attn1.config = config;
        self.attn2.config = config;
    }

    pub fn fuse_lora(&mut self, root: &str, lora: &LoraModel<B>) -> usize {
        let prefix = format!("{root}.{}", self.prefix);
        self.attn1.fuse_lora(&format!("{prefix}.attn1"), lora)
            + self.attn2.fuse_lora(&format!("{prefix}.attn2"), lora)
            + fuse_linear(&mut self.proj_in, &format!("{prefix}.proj_in"), lora)
            + fuse_linear(&mut self.ff_1, &format!("{prefix}.ff.linear_1"), lora)
            + fuse_linear(&mut self.ff_2, &format!("{prefix}.ff.linear_2"), lora)
            + fuse_linear(&mut self.proj_out, &format!("{prefix}.proj_out"), lora)
    }

    pub fn quantize(&mut self, config: &QuantConfig) -> usize {
        let mut converted = self.attn1.quantize(config) + self.attn2.quantize(config);
        for layer in [&mut self.proj_in, &mut self.ff_1, &mut self.ff_2, &mut self.proj_out] {
            converted += usize::from(layer.quantize(config));
        }
        converted
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            norm: self.norm.to_device(device),
            proj_in: self.proj_in.to_device(device),
            norm1: self.norm1.to_device(device),
            attn1: self.attn1.to_device(device),
            norm2: self.norm2.to_device(device),
            attn2: self.attn2.to_device(device),
            norm3: self.norm3.to_device(device),
            ff_1: self.ff_1.to_device(device),
            ff_2: self.ff_2.to_device(device),
            proj_out: self.proj_out.to_device(device),
            ..self
        }
    }
}

/// Single-head self-attention over spatial tokens, as in the VAE middle block
#[derive(Debug, Clone)]
pub(crate) struct AttnBlock<B: Backend> {
    norm: GroupNorm<B>,
    attn: Attention<B>,
}

impl<B: Backend> AttnBlock<B> {
    pub fn new(builder: &mut LayerBuilder<'_, B>, prefix: &str, channels: usize, groups: usize) -> Result<Self> {
        Ok(Self {
            norm: builder.group_norm(&format!("{prefix}.norm"), groups, channels)?,
            attn: builder.attention(&format!("{prefix}.attn"), channels, channels, 1)?,
        })
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = x.dims();
        let h = self.attn.forward(to_tokens(self.norm.forward(x.clone())), None);
        x + from_tokens(h, height, width)
    }

    pub fn attention(&self) -> AttentionConfig {
        self.attn.config
    }

    pub fn set_attention(&mut self, config: AttentionConfig) {
        self.attn.config = config;
    }

    pub fn quantize(&mut self, config: &QuantConfig) -> usize {
        self.attn.quantize(config)
    }

    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            norm: self.norm.to_device(device),
            attn: self.attn.to_device(device),
        }
    }
}
