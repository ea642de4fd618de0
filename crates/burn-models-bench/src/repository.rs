//! Diffusers-style repository layout
//!
//! ```text
//! model_index.json
//! scheduler/scheduler_config.json
//! text_encoder/config.json   text_encoder/model[.variant].safetensors
//! unet/config.json           unet/diffusion_pytorch_model[.variant].safetensors
//! vae/config.json            vae/diffusion_pytorch_model[.variant].safetensors
//! ```
//!
//! Standalone autoencoder and ControlNet repositories keep `config.json` and
//! the weights file at their root. LoRA repositories hold a single
//! `pytorch_lora_weights.safetensors`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn_models_convert::{StorageDtype, TensorEntry, write_safetensors};
use burn_models_core::PrecisionMode;
use burn_models_samplers::SchedulerConfig;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::info;

use crate::error::{BenchError, Result};
use crate::reference::{
    Builtin, BuiltinKind, PipelineConfigs, RecordingWeights, ReferenceAutoencoder, ReferenceControlNet,
    ReferenceTextEncoder, ReferenceUNet,
};

pub const MODEL_INDEX: &str = "model_index.json";
pub const CONFIG: &str = "config.json";
pub const SCHEDULER_CONFIG: &str = "scheduler/scheduler_config.json";
pub const MODEL_WEIGHTS: &str = "diffusion_pytorch_model";
pub const TEXT_ENCODER_WEIGHTS: &str = "model";
pub const LORA_WEIGHTS: &str = "pytorch_lora_weights.safetensors";

const LIBRARY: &str = "burn_models_bench";

/// `<stem>[.<variant>].safetensors` inside `dir`
pub fn weights_file(dir: &Path, stem: &str, variant: Option<&str>) -> Result<PathBuf> {
    let file_name = match variant {
        Some(variant) => format!("{stem}.{variant}.safetensors"),
        None => format!("{stem}.safetensors"),
    };
    let path = dir.join(file_name);
    if path.is_file() {
        Ok(path)
    } else {
        let reason = match variant {
            Some(variant) => format!("no '{variant}' variant of {stem}"),
            None => format!("missing {stem}.safetensors"),
        };
        Err(BenchError::model_config(dir, reason))
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).map_err(|e| BenchError::model_config(path, e))?;
    serde_json::from_str(&text).map_err(|e| BenchError::model_config(path, e))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(value).map_err(|e| BenchError::model_config(path, e))?;
    fs::write(path, text + "\n")?;
    Ok(())
}

/// Whether `dir` looks like a full pipeline repository
pub fn is_pipeline_dir(dir: &Path) -> bool {
    dir.join(MODEL_INDEX).is_file()
}

pub fn read_pipeline_configs(dir: &Path) -> Result<PipelineConfigs> {
    let index_path = dir.join(MODEL_INDEX);
    let index: Value = read_json(&index_path)?;
    let class_name = index
        .get("_class_name")
        .and_then(Value::as_str)
        .ok_or_else(|| BenchError::model_config(&index_path, "missing _class_name"))?
        .to_string();
    let safety_checker = index.get("safety_checker").is_some_and(|entry| !entry.is_null());

    let scheduler_path = dir.join(SCHEDULER_CONFIG);
    let scheduler: Value = read_json(&scheduler_path)?;
    let scheduler_class = scheduler
        .get("_class_name")
        .and_then(Value::as_str)
        .ok_or_else(|| BenchError::model_config(&scheduler_path, "missing _class_name"))?
        .to_string();
    let scheduler: SchedulerConfig =
        serde_json::from_value(scheduler).map_err(|e| BenchError::model_config(&scheduler_path, e))?;
    scheduler
        .validate()
        .map_err(|reason| BenchError::model_config(&scheduler_path, reason))?;

    Ok(PipelineConfigs {
        class_name,
        unet: read_json(&dir.join("unet").join(CONFIG))?,
        vae: read_json(&dir.join("vae").join(CONFIG))?,
        text_encoder: read_json(&dir.join("text_encoder").join(CONFIG))?,
        scheduler_class,
        scheduler,
        safety_checker,
    })
}

/// How `export` stores weights
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Weight files are named `<stem>.<variant>.safetensors`
    pub variant: Option<String>,
    pub dtype: StorageDtype,
}

struct Exporter<'a> {
    dir: &'a Path,
    options: &'a ExportOptions,
    written: Vec<PathBuf>,
}

impl Exporter<'_> {
    fn weights(&mut self, subdir: &str, stem: &str, entries: Vec<TensorEntry>) -> Result<()> {
        let dir = self.dir.join(subdir);
        fs::create_dir_all(&dir)?;
        let file_name = match &self.options.variant {
            Some(variant) => format!("{stem}.{variant}.safetensors"),
            None => format!("{stem}.safetensors"),
        };
        let path = dir.join(file_name);
        let metadata = BTreeMap::from([("format".to_string(), "pt".to_string())]);
        write_safetensors(&path, &entries, self.options.dtype, Some(&metadata))?;
        self.written.push(path);
        Ok(())
    }

    fn json<T: Serialize>(&mut self, relative: &str, value: &T) -> Result<()> {
        let path = self.dir.join(relative);
        write_json(&path, value)?;
        self.written.push(path);
        Ok(())
    }
}

fn scheduler_json(class_name: &str, config: &SchedulerConfig) -> Result<Value> {
    let mut value = serde_json::to_value(config).map_err(|e| BenchError::model_config(SCHEDULER_CONFIG, e))?;
    if let Value::Object(map) = &mut value {
        map.insert("_class_name".into(), Value::String(class_name.to_string()));
    }
    Ok(value)
}

/// Write a built-in model to `dir`, returning the files written
pub fn export_builtin<B: Backend>(
    builtin: &Builtin,
    dir: &Path,
    options: &ExportOptions,
    device: &B::Device,
) -> Result<Vec<PathBuf>> {
    let mut out = Exporter {
        dir,
        options,
        written: Vec::new(),
    };
    let precision = PrecisionMode::Fp32;

    match builtin.kind {
        BuiltinKind::Pipeline => {
            let configs = builtin
                .pipeline_configs()
                .ok_or_else(|| BenchError::model_config(dir, format!("{} has no pipeline configs", builtin.name)))?;

            let mut source = RecordingWeights::new(builtin.weights("unet", precision));
            ReferenceUNet::<B>::new(configs.unet.clone(), &mut source, device)?;
            out.weights("unet", MODEL_WEIGHTS, source.into_entries())?;
            out.json("unet/config.json", &configs.unet)?;

            let mut source = RecordingWeights::new(builtin.weights("vae", precision));
            ReferenceAutoencoder::<B>::new(configs.vae.clone(), &mut source, device)?;
            out.weights("vae", MODEL_WEIGHTS, source.into_entries())?;
            out.json("vae/config.json", &configs.vae)?;

            let mut source = RecordingWeights::new(builtin.weights("text_encoder", precision));
            ReferenceTextEncoder::<B>::new(configs.text_encoder.clone(), &mut source, device)?;
            out.weights("text_encoder", TEXT_ENCODER_WEIGHTS, source.into_entries())?;
            out.json("text_encoder/config.json", &configs.text_encoder)?;

            out.json(SCHEDULER_CONFIG, &scheduler_json(&configs.scheduler_class, &configs.scheduler)?)?;

            let safety_checker = if configs.safety_checker {
                json!([LIBRARY, "LuminanceChecker"])
            } else {
                Value::Null
            };
            let index = json!({
                "_class_name": configs.class_name,
                "_burn_models_version": env!("CARGO_PKG_VERSION"),
                "scheduler": ["burn_models_samplers", configs.scheduler_class],
                "text_encoder": [LIBRARY, "ReferenceTextEncoder"],
                "unet": [LIBRARY, "ReferenceUNet"],
                "vae": [LIBRARY, "ReferenceAutoencoder"],
                "safety_checker": safety_checker,
            });
            out.json(MODEL_INDEX, &index)?;
        }
        BuiltinKind::Autoencoder => {
            let config = builtin.autoencoder_config().unwrap_or_default();
            let mut source = RecordingWeights::new(builtin.weights("vae", precision));
            ReferenceAutoencoder::<B>::new(config.clone(), &mut source, device)?;
            out.weights("", MODEL_WEIGHTS, source.into_entries())?;
            out.json(CONFIG, &config)?;
        }
        BuiltinKind::ControlNet => {
            let config = builtin.controlnet_config().unwrap_or_default();
            let mut source = RecordingWeights::new(builtin.weights("controlnet", precision));
            ReferenceControlNet::<B>::new(config.clone(), &mut source, device)?;
            out.weights("", MODEL_WEIGHTS, source.into_entries())?;
            out.json(CONFIG, &config)?;
        }
        BuiltinKind::Lora => {
            let entries = builtin.lora_entries()?.unwrap_or_default();
            fs::create_dir_all(dir)?;
            let path = dir.join(LORA_WEIGHTS);
            write_safetensors(&path, &entries, options.dtype, None)?;
            out.written.push(path);
        }
    }

    info!(model = builtin.name, dir = %dir.display(), files = out.written.len(), "exported");
    Ok(out.written)
}
