//! Benchmark request types
//!
//! [`PipelineConfig`] says what to assemble and how to compile it;
//! [`GenerationConfig`] says what to generate. Both are plain data filled in
//! by the CLI presets and never mutated once assembly starts.

use burn_models_core::PrecisionMode;

use crate::compile::CompilerStrategy;
use crate::pipeline::PipelineKind;

pub const DEFAULT_PROMPT: &str = "best quality, realistic, unreal engine, 4K, a beautiful girl";

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Base model identity: directory, built-in name or Hub repository
    pub model: String,
    /// Weight file variant, e.g. `fp16`
    pub variant: Option<String>,
    /// Custom pipeline tag, recorded on the pipeline
    pub custom_pipeline: Option<String>,
    /// Scheduler override, by registry name
    pub scheduler: Option<String>,
    /// LoRA weights fused into the denoiser and text encoder
    pub lora: Option<String>,
    pub lora_scale: f32,
    /// Conditioning adapter: repository identity or a `.safetensors` file
    pub controlnet: Option<String>,
    /// Autoencoder override
    pub vae: Option<String>,
    pub kind: PipelineKind,
    pub precision: PrecisionMode,
    pub compiler: CompilerStrategy,
    pub quantize: bool,
    pub disable_fusion: bool,
}

impl PipelineConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            variant: None,
            custom_pipeline: None,
            scheduler: None,
            lora: None,
            lora_scale: 1.0,
            controlnet: None,
            vae: None,
            kind: PipelineKind::TextToImage,
            precision: PrecisionMode::Fp16,
            compiler: CompilerStrategy::None,
            quantize: false,
            disable_fusion: false,
        }
    }

    pub fn with_scheduler(mut self, scheduler: impl Into<String>) -> Self {
        self.scheduler = Some(scheduler.into());
        self
    }

    pub fn with_controlnet(mut self, controlnet: impl Into<String>) -> Self {
        self.controlnet = Some(controlnet.into());
        self
    }

    pub fn with_vae(mut self, vae: impl Into<String>) -> Self {
        self.vae = Some(vae.into());
        self
    }

    pub fn with_lora(mut self, lora: impl Into<String>) -> Self {
        self.lora = Some(lora.into());
        self
    }

    pub fn with_compiler(mut self, compiler: CompilerStrategy) -> Self {
        self.compiler = compiler;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub steps: usize,
    /// Images per prompt
    pub batch: usize,
    /// Defaults to the denoiser's native resolution
    pub height: Option<usize>,
    pub width: Option<usize>,
    pub seed: Option<u64>,
    /// Input image path or `file://` URI; selects image-to-image
    pub input_image: Option<String>,
    pub control_image: Option<String>,
    /// JSON object merged into the call arguments last
    pub extra_call_kwargs: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            negative_prompt: None,
            steps: 20,
            batch: 1,
            height: None,
            width: None,
            seed: None,
            input_image: None,
            control_image: None,
            extra_call_kwargs: None,
        }
    }
}

impl GenerationConfig {
    /// Pipeline kind implied by the inputs
    pub fn pipeline_kind(&self) -> PipelineKind {
        if self.input_image.is_some() {
            PipelineKind::ImageToImage
        } else {
            PipelineKind::TextToImage
        }
    }
}
