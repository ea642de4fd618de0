//! LoRA weight loading from safetensors files
//!
//! Kohya (`lora_unet_*`, `lora_te_*`) and diffusers/PEFT key layouts are both
//! read into a [`LoraModel`] keyed by dotted layer path.

use std::collections::BTreeMap;
use std::path::Path;

use burn::prelude::*;
use thiserror::Error;

use crate::loader::{LoadError, SafeTensorFile};
use burn_models_core::lora::{LoraConvWeight, LoraModel, LoraWeight};

/// LoRA file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoraFormat {
    /// Kohya-style LoRA (lora_unet_*, lora_te_*)
    Kohya,
    /// Diffusers-style LoRA, including PEFT `lora_A`/`lora_B` keys
    Diffusers,
    /// Auto-detect format
    Auto,
}

#[derive(Error, Debug)]
pub enum LoraLoadError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("LoRA file contains no complete down/up pairs")]
    Empty,

    #[error("LoRA layer {layer} has unsupported rank-{rank} weights")]
    UnsupportedRank { layer: String, rank: usize },

    #[error("LoRA layer {layer} is missing its {missing} projection")]
    IncompletePair { layer: String, missing: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Down,
    Up,
    Alpha,
}

const PART_SUFFIXES: &[(&str, Part)] = &[
    (".lora_down.weight", Part::Down),
    (".lora_up.weight", Part::Up),
    (".lora.down.weight", Part::Down),
    (".lora.up.weight", Part::Up),
    (".lora_A.weight", Part::Down),
    (".lora_B.weight", Part::Up),
    (".alpha", Part::Alpha),
];

/// Underscore-joined identifiers that Kohya flattening would otherwise split
const COMPOUND_SEGMENTS: &[&str] = &[
    "to_q",
    "to_k",
    "to_v",
    "to_out",
    "linear_1",
    "linear_2",
    "time_embedding",
    "down_blocks",
    "up_blocks",
    "mid_block",
    "transformer_blocks",
    "proj_in",
    "proj_out",
    "conv_in",
    "conv_out",
    "text_model",
    "self_attn",
    "q_proj",
    "k_proj",
    "v_proj",
    "out_proj",
];

#[derive(Default)]
struct KeyGroup {
    down: Option<String>,
    up: Option<String>,
    alpha: Option<String>,
}

fn split_key(key: &str) -> Option<(&str, Part)> {
    PART_SUFFIXES
        .iter()
        .find_map(|(suffix, part)| key.strip_suffix(suffix).map(|base| (base, *part)))
}

/// Detects the LoRA format from tensor key names
fn detect_format(names: &[&str]) -> LoraFormat {
    let kohya = names
        .iter()
        .any(|k| k.starts_with("lora_unet_") || k.starts_with("lora_te"));

    if kohya {
        LoraFormat::Kohya
    } else {
        LoraFormat::Diffusers
    }
}

/// Convert a Kohya-style layer name to a dotted layer path
pub fn kohya_to_internal_name(kohya_name: &str) -> String {
    let (prefix, rest) = if let Some(rest) = kohya_name.strip_prefix("lora_unet_") {
        ("unet.", rest)
    } else if let Some(rest) = kohya_name.strip_prefix("lora_te2_") {
        ("text_encoder_2.", rest)
    } else if let Some(rest) = kohya_name.strip_prefix("lora_te1_") {
        ("text_encoder.", rest)
    } else if let Some(rest) = kohya_name.strip_prefix("lora_te_") {
        ("text_encoder.", rest)
    } else {
        ("", kohya_name)
    };

    let mut dotted = rest.replace('_', ".");
    for segment in COMPOUND_SEGMENTS {
        dotted = dotted.replace(&segment.replace('_', "."), segment);
    }
    format!("{prefix}{dotted}")
}

fn read_alpha(file: &SafeTensorFile, key: Option<&str>) -> Result<Option<f32>, LoadError> {
    match key {
        Some(key) => Ok(file.read_f32(key)?.first().copied()),
        None => Ok(None),
    }
}

/// Load a LoRA model from a safetensors file
///
/// Layers without an `alpha` tensor use `alpha = rank`, so their delta is
/// unscaled.
pub fn load_lora<B: Backend>(
    path: impl AsRef<Path>,
    scale: f32,
    format: LoraFormat,
    device: &B::Device,
) -> Result<LoraModel<B>, LoraLoadError> {
    let file = SafeTensorFile::open(path.as_ref())?;
    let names = file.names();

    let format = match format {
        LoraFormat::Auto => detect_format(&names),
        other => other,
    };

    let mut groups: BTreeMap<String, KeyGroup> = BTreeMap::new();
    for key in &names {
        let Some((base, part)) = split_key(key) else {
            continue;
        };
        let layer = match format {
            LoraFormat::Kohya => kohya_to_internal_name(base),
            _ => base.to_string(),
        };
        let group = groups.entry(layer).or_default();
        match part {
            Part::Down => group.down = Some(key.to_string()),
            Part::Up => group.up = Some(key.to_string()),
            Part::Alpha => group.alpha = Some(key.to_string()),
        }
    }

    let mut model = LoraModel::new(scale);
    for (layer, group) in groups {
        let (down_key, up_key) = match (group.down, group.up) {
            (Some(d), Some(u)) => (d, u),
            (None, Some(_)) => return Err(LoraLoadError::IncompletePair { layer, missing: "down" }),
            (Some(_), None) => return Err(LoraLoadError::IncompletePair { layer, missing: "up" }),
            // alpha with no weights
            (None, None) => continue,
        };

        let rank = file.shape(&down_key).map(|s| s.len()).unwrap_or(0);
        match rank {
            2 => {
                let down = file.load_f32::<B, 2>(&down_key, device)?;
                let up = file.load_f32::<B, 2>(&up_key, device)?;
                let alpha = read_alpha(&file, group.alpha.as_deref())?.unwrap_or(down.dims()[0] as f32);
                model.add_linear(layer, LoraWeight::new(down, up, alpha));
            }
            4 => {
                let down = file.load_f32::<B, 4>(&down_key, device)?;
                let up = file.load_f32::<B, 4>(&up_key, device)?;
                let alpha = read_alpha(&file, group.alpha.as_deref())?.unwrap_or(down.dims()[0] as f32);
                model.add_conv(layer, LoraConvWeight::new(down, up, alpha));
            }
            rank => return Err(LoraLoadError::UnsupportedRank { layer, rank }),
        }
    }

    if model.is_empty() {
        return Err(LoraLoadError::Empty);
    }
    Ok(model)
}
