//! Built-in reference models
//!
//! Each built-in is a fixed set of configs plus seeded weights, so it
//! resolves without any files on disk. `export` writes the same models out in
//! the directory layout a repository would have.

use burn_models_convert::TensorEntry;
use burn_models_core::PrecisionMode;
use burn_models_samplers::SchedulerConfig;

use super::autoencoder::AutoencoderConfig;
use super::controlnet::ControlNetConfig;
use super::text_encoder::TextEncoderConfig;
use super::unet::UNetConfig;
use super::weights::{Init, SeededWeights, WeightSource};
use crate::error::Result;

pub const REFERENCE_SD: &str = "burn-models/reference-sd";
pub const REFERENCE_SDXL: &str = "burn-models/reference-sdxl";
pub const REFERENCE_VAE: &str = "burn-models/reference-vae";
pub const REFERENCE_CONTROLNET: &str = "burn-models/reference-controlnet";
pub const REFERENCE_LCM_LORA: &str = "burn-models/reference-lcm-lora";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    /// Full text-to-image pipeline
    Pipeline,
    Autoencoder,
    ControlNet,
    Lora,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Builtin {
    pub name: &'static str,
    pub kind: BuiltinKind,
    pub description: &'static str,
}

pub const BUILTINS: &[Builtin] = &[
    Builtin {
        name: REFERENCE_SD,
        kind: BuiltinKind::Pipeline,
        description: "reference latent diffusion pipeline, 512x512 native",
    },
    Builtin {
        name: REFERENCE_SDXL,
        kind: BuiltinKind::Pipeline,
        description: "reference latent diffusion pipeline, 1024x1024 native",
    },
    Builtin {
        name: REFERENCE_VAE,
        kind: BuiltinKind::Autoencoder,
        description: "standalone reference autoencoder",
    },
    Builtin {
        name: REFERENCE_CONTROLNET,
        kind: BuiltinKind::ControlNet,
        description: "reference ControlNet for the reference pipelines",
    },
    Builtin {
        name: REFERENCE_LCM_LORA,
        kind: BuiltinKind::Lora,
        description: "Kohya-format LoRA for the reference UNet and text encoder",
    },
];

pub fn find_builtin(name: &str) -> Option<&'static Builtin> {
    BUILTINS.iter().find(|builtin| builtin.name == name.trim())
}

/// Configs of every component in a pipeline repository
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfigs {
    /// `_class_name` of `model_index.json`
    pub class_name: String,
    pub unet: UNetConfig,
    pub vae: AutoencoderConfig,
    pub text_encoder: TextEncoderConfig,
    pub scheduler_class: String,
    pub scheduler: SchedulerConfig,
    pub safety_checker: bool,
}

const LORA_RANK: usize = 4;

impl Builtin {
    pub fn pipeline_configs(&self) -> Option<PipelineConfigs> {
        match self.name {
            REFERENCE_SD => Some(PipelineConfigs {
                class_name: "StableDiffusionPipeline".into(),
                unet: UNetConfig::default(),
                vae: AutoencoderConfig::default(),
                text_encoder: TextEncoderConfig::default(),
                scheduler_class: "DDIMScheduler".into(),
                scheduler: SchedulerConfig::default(),
                safety_checker: true,
            }),
            REFERENCE_SDXL => Some(PipelineConfigs {
                class_name: "StableDiffusionXLPipeline".into(),
                unet: UNetConfig {
                    sample_size: 128,
                    ..Default::default()
                },
                vae: AutoencoderConfig {
                    scaling_factor: 0.13025,
                    ..Default::default()
                },
                text_encoder: TextEncoderConfig::default(),
                scheduler_class: "EulerDiscreteScheduler".into(),
                scheduler: SchedulerConfig::default(),
                safety_checker: false,
            }),
            _ => None,
        }
    }

    pub fn autoencoder_config(&self) -> Option<AutoencoderConfig> {
        (self.kind == BuiltinKind::Autoencoder).then(AutoencoderConfig::default)
    }

    pub fn controlnet_config(&self) -> Option<ControlNetConfig> {
        (self.kind == BuiltinKind::ControlNet).then(ControlNetConfig::default)
    }

    /// Seeded weights of one component
    pub fn weights(&self, component: &str, precision: PrecisionMode) -> SeededWeights {
        SeededWeights::new(&format!("{}/{component}", self.name), precision)
    }

    /// Tensors of the built-in LoRA file, Kohya naming
    pub fn lora_entries(&self) -> Result<Option<Vec<TensorEntry>>> {
        if self.kind != BuiltinKind::Lora {
            return Ok(None);
        }

        let unet = UNetConfig::default();
        let text = TextEncoderConfig::default();
        let mid = unet.mid_channels();
        let c = unet.model_channels;

        let mut linear = vec![("lora_unet_time_embedding_linear_1".to_string(), c, unet.time_embed_dim())];
        for attn in ["attn1", "attn2"] {
            for proj in ["to_q", "to_k", "to_v", "to_out"] {
                let in_features = if attn == "attn2" && matches!(proj, "to_k" | "to_v") {
                    unet.context_dim
                } else {
                    mid
                };
                linear.push((format!("lora_unet_mid_transformer_{attn}_{proj}"), in_features, mid));
            }
        }
        linear.push(("lora_te_encoder_fc1".to_string(), text.hidden_size, text.hidden_size * 4));
        linear.push(("lora_te_proj".to_string(), text.hidden_size, text.context_dim));

        let mut source = self.weights("lora", PrecisionMode::Fp32);
        let mut entries = Vec::new();
        for (layer, in_features, out_features) in linear {
            let down = [LORA_RANK, in_features];
            let up = [out_features, LORA_RANK];
            entries.push(lora_entry(&mut source, &layer, "lora_down.weight", &down, in_features)?);
            entries.push(lora_entry(&mut source, &layer, "lora_up.weight", &up, LORA_RANK)?);
            entries.push(TensorEntry::new(format!("{layer}.alpha"), vec![], vec![LORA_RANK as f32]));
        }

        let conv_down = [LORA_RANK, unet.in_channels, 3, 3];
        let conv_up = [c, LORA_RANK, 1, 1];
        entries.push(lora_entry(&mut source, "lora_unet_conv_in", "lora_down.weight", &conv_down, unet.in_channels * 9)?);
        entries.push(lora_entry(&mut source, "lora_unet_conv_in", "lora_up.weight", &conv_up, LORA_RANK)?);

        Ok(Some(entries))
    }
}

fn lora_entry(source: &mut SeededWeights, layer: &str, part: &str, shape: &[usize], fan_in: usize) -> Result<TensorEntry> {
    let name = format!("{layer}.{part}");
    let values = source.values(&name, shape, Init::Uniform { fan_in })?;
    Ok(TensorEntry::new(name, shape.to_vec(), values))
}
