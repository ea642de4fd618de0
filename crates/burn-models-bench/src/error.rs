//! Harness errors

use std::path::PathBuf;

use burn_models_convert::{LoadError, LoraLoadError, WriteError};
use thiserror::Error;

use crate::runner::RunPhase;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("cannot resolve model '{0}': not a directory, file, built-in or cached repository")]
    UnresolvableModel(String),

    #[error("unsupported scheduler '{name}', expected one of: {available}")]
    UnsupportedScheduler { name: String, available: String },

    #[error(
        "unknown compiler '{0}', expected one of: none, graph-compile, trace-compile, trace-compile-autotune"
    )]
    UnknownCompiler(String),

    #[error("quantization requires an active adapter-fusion backend")]
    QuantizationPrecondition,

    #[error("LoRA weights require the adapter-fusion backend, which is not available")]
    AdapterBackendUnavailable,

    #[error("incompatible {component}: {reason}")]
    IncompatibleComponent {
        component: &'static str,
        reason: String,
    },

    #[error("invalid call arguments: {0}")]
    InvalidArguments(String),

    #[error("invalid extra call arguments: {0}")]
    ExtraArguments(String),

    #[error("cannot {action} while the benchmark is {phase}")]
    InvalidPhase {
        action: &'static str,
        phase: RunPhase,
    },

    #[error("invalid model config {}: {reason}", .path.display())]
    ModelConfig { path: PathBuf, reason: String },

    #[error("tensor readback failed: {0}")]
    Tensor(String),

    #[error("model download failed: {0}")]
    Hub(String),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Lora(#[from] LoraLoadError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = BenchError> = std::result::Result<T, E>;

impl BenchError {
    pub(crate) fn model_config(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        BenchError::ModelConfig {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
