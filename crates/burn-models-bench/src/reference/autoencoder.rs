//! Reference KL autoencoder

use burn::prelude::*;
use burn_models_core::{AttentionConfig, Conv2dLayer, GroupNorm, QuantConfig};
use serde::{Deserialize, Serialize};

use super::blocks::{AttnBlock, ResBlock, Upsample};
use super::weights::{LayerBuilder, WeightSource};
use crate::components::{Autoencoder, ComputeModule};
use crate::error::Result;

/// Contents of `vae/config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoencoderConfig {
    pub in_channels: usize,
    pub latent_channels: usize,
    /// Decoder widths, deepest first; each step after the first doubles the
    /// resolution
    pub block_out_channels: Vec<usize>,
    pub norm_groups: usize,
    pub scaling_factor: f32,
}

impl Default for AutoencoderConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            latent_channels: 4,
            block_out_channels: vec![16, 8, 8, 4],
            norm_groups: 4,
            scaling_factor: 0.18215,
        }
    }
}

impl AutoencoderConfig {
    pub fn scale_factor(&self) -> usize {
        1 << self.block_out_channels.len().saturating_sub(1)
    }
}

#[derive(Debug, Clone)]
struct EncoderHalf<B: Backend> {
    conv_in: Conv2dLayer<B>,
    downs: Vec<Conv2dLayer<B>>,
    mid: ResBlock<B>,
    norm_out: GroupNorm<B>,
    conv_out: Conv2dLayer<B>,
    quant_conv: Conv2dLayer<B>,
}

#[derive(Debug, Clone)]
struct UpBlock<B: Backend> {
    res: ResBlock<B>,
    upsample: Upsample<B>,
}

#[derive(Debug, Clone)]
struct DecoderHalf<B: Backend> {
    post_quant_conv: Conv2dLayer<B>,
    conv_in: Conv2dLayer<B>,
    mid_res_0: ResBlock<B>,
    mid_attn: AttnBlock<B>,
    mid_res_1: ResBlock<B>,
    ups: Vec<UpBlock<B>>,
    norm_out: GroupNorm<B>,
    conv_out: Conv2dLayer<B>,
}

#[derive(Debug, Clone)]
pub struct ReferenceAutoencoder<B: Backend> {
    config: AutoencoderConfig,
    encoder: EncoderHalf<B>,
    decoder: DecoderHalf<B>,
    fused_kernels: bool,
}

impl<B: Backend> ReferenceAutoencoder<B> {
    pub fn new(config: AutoencoderConfig, source: &mut dyn WeightSource, device: &B::Device) -> Result<Self> {
        let mut b = LayerBuilder::<B>::new(source, device);
        let groups = config.norm_groups;
        let latent = config.latent_channels;
        let widths = &config.block_out_channels;
        let deepest = widths[0];
        let shallowest = widths[widths.len() - 1];

        // Encoder runs the decoder widths in reverse
        let mut downs = Vec::new();
        let mut channels = shallowest;
        for (i, &width) in widths.iter().rev().skip(1).enumerate() {
            downs.push(b.conv(&format!("encoder.down.{i}"), channels, width, 3, 2)?);
            channels = width;
        }
        let encoder = EncoderHalf {
            conv_in: b.conv("encoder.conv_in", config.in_channels, shallowest, 3, 1)?,
            downs,
            mid: ResBlock::new(&mut b, "encoder.mid.res", deepest, deepest, groups, None)?,
            norm_out: b.group_norm("encoder.norm_out", groups, deepest)?,
            conv_out: b.conv("encoder.conv_out", deepest, latent * 2, 3, 1)?,
            quant_conv: b.conv("quant_conv", latent * 2, latent * 2, 1, 1)?,
        };

        let mut ups = Vec::new();
        for (i, pair) in widths.windows(2).enumerate() {
            ups.push(UpBlock {
                res: ResBlock::new(&mut b, &format!("decoder.up.{i}.res"), pair[0], pair[1], groups, None)?,
                upsample: Upsample::new(&mut b, &format!("decoder.up.{i}.upsample"), pair[1])?,
            });
        }
        let decoder = DecoderHalf {
            post_quant_conv: b.conv("post_quant_conv", latent, latent, 1, 1)?,
            conv_in: b.conv("decoder.conv_in", latent, deepest, 3, 1)?,
            mid_res_0: ResBlock::new(&mut b, "decoder.mid.res.0", deepest, deepest, groups, None)?,
            mid_attn: AttnBlock::new(&mut b, "decoder.mid.attn", deepest, groups)?,
            mid_res_1: ResBlock::new(&mut b, "decoder.mid.res.1", deepest, deepest, groups, None)?,
            ups,
            norm_out: b.group_norm("decoder.norm_out", groups, shallowest)?,
            conv_out: b.conv("decoder.conv_out", shallowest, config.in_channels, 3, 1)?,
        };

        Ok(Self {
            config,
            encoder,
            decoder,
            fused_kernels: false,
        })
    }

    pub fn config(&self) -> &AutoencoderConfig {
        &self.config
    }
}

impl<B: Backend> ComputeModule<B> for ReferenceAutoencoder<B> {
    fn name(&self) -> &str {
        "vae"
    }

    fn set_attention(&mut self, config: AttentionConfig) {
        self.decoder.mid_attn.set_attention(config);
    }

    fn attention(&self) -> AttentionConfig {
        self.decoder.mid_attn.attention()
    }

    fn attention_candidates(&self) -> Vec<AttentionConfig> {
        vec![
            AttentionConfig::standard(),
            AttentionConfig::memory_efficient(1024),
            AttentionConfig::memory_efficient(4096),
        ]
    }

    fn set_fused_kernels(&mut self, enabled: bool) {
        self.fused_kernels = enabled;
    }

    fn fused_kernels(&self) -> bool {
        self.fused_kernels
    }

    // Nothing is rebuilt per call
    fn set_graph_capture(&mut self, _enabled: bool) {}

    fn quantize_dynamic(&mut self, config: &QuantConfig) -> usize {
        self.decoder.mid_attn.quantize(config)
    }
}

impl<B: Backend> Autoencoder<B> for ReferenceAutoencoder<B> {
    fn encode(&self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        let fused = self.fused_kernels;
        let enc = &self.encoder;

        let h = enc.conv_in.forward(image);
        let h = enc.downs.iter().fold(h, |h, conv| conv.forward(h));
        let h = enc.mid.forward(h, None, fused);
        let h = enc.conv_out.forward(enc.norm_out.forward_silu(h, fused));
        let moments = enc.quant_conv.forward(h);

        // Mean half of the diagonal Gaussian
        let [batch, _, height, width] = moments.dims();
        moments.slice([0..batch, 0..self.config.latent_channels, 0..height, 0..width])
    }

    fn decode(&self, latent: Tensor<B, 4>) -> Tensor<B, 4> {
        let fused = self.fused_kernels;
        let dec = &self.decoder;

        let h = dec.conv_in.forward(dec.post_quant_conv.forward(latent));
        let h = dec.mid_res_0.forward(h, None, fused);
        let h = dec.mid_attn.forward(h);
        let h = dec.mid_res_1.forward(h, None, fused);
        let h = dec
            .ups
            .iter()
            .fold(h, |h, up| up.upsample.forward(up.res.forward(h, None, fused)));

        dec.conv_out.forward(dec.norm_out.forward_silu(h, fused)).tanh()
    }

    fn scale_factor(&self) -> usize {
        self.config.scale_factor()
    }

    fn latent_channels(&self) -> usize {
        self.config.latent_channels
    }

    fn scaling_factor(&self) -> f32 {
        self.config.scaling_factor
    }

    fn to_device(self: Box<Self>, device: &B::Device) -> Box<dyn Autoencoder<B>> {
        let vae = *self;
        let enc = vae.encoder;
        let dec = vae.decoder;
        Box::new(Self {
            encoder: EncoderHalf {
                conv_in: enc.conv_in.to_device(device),
                downs: enc.downs.into_iter().map(|c| c.to_device(device)).collect(),
                mid: enc.mid.to_device(device),
                norm_out: enc.norm_out.to_device(device),
                conv_out: enc.conv_out.to_device(device),
                quant_conv: enc.quant_conv.to_device(device),
            },
            decoder: DecoderHalf {
                post_quant_conv: dec.post_quant_conv.to_device(device),
                conv_in: dec.conv_in.to_device(device),
                mid_res_0: dec.mid_res_0.to_device(device),
                mid_attn: dec.mid_attn.to_device(device),
                mid_res_1: dec.mid_res_1.to_device(device),
                ups: dec
                    .ups
                    .into_iter()
                    .map(|up| UpBlock {
                        res: up.res.to_device(device),
                        upsample: up.upsample.to_device(device),
                    })
                    .collect(),
                norm_out: dec.norm_out.to_device(device),
                conv_out: dec.conv_out.to_device(device),
            },
            ..vae
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::weights::SeededWeights;
    use burn_models_core::PrecisionMode;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_encode_decode_shapes() {
        let device = Default::default();
        let mut source = SeededWeights::new("test-vae", PrecisionMode::Fp32);
        let vae = ReferenceAutoencoder::<TestBackend>::new(AutoencoderConfig::default(), &mut source, &device).unwrap();
        assert_eq!(vae.scale_factor(), 8);

        let image = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 48], &device);
        let latent = vae.encode(image);
        assert_eq!(latent.dims(), [1, 4, 4, 6]);

        let decoded = vae.decode(latent);
        assert_eq!(decoded.dims(), [1, 3, 32, 48]);
        let max: f32 = decoded.abs().max().into_scalar().elem();
        assert!(max <= 1.0);
    }
}
