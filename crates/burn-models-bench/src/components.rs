//! Component slots of a diffusion pipeline
//!
//! Every compute-heavy component implements [`ComputeModule`], the set of
//! hooks the compiler and quantizer drive. The slot traits add the forward
//! passes the pipeline calls.

use burn::prelude::*;
use burn_models_core::{AttentionConfig, LoraModel, QuantConfig};
use image::RgbImage;

use crate::compile::CompileStats;

/// Optimisation hooks shared by denoiser, conditioning adapter and autoencoder
pub trait ComputeModule<B: Backend> {
    fn name(&self) -> &str;

    /// Attention kernel used by every attention layer of the module
    fn set_attention(&mut self, config: AttentionConfig);

    fn attention(&self) -> AttentionConfig;

    /// Attention kernels worth trying when autotuning
    fn attention_candidates(&self) -> Vec<AttentionConfig> {
        vec![self.attention()]
    }

    /// Switch GroupNorm + SiLU pairs to their fused form
    fn set_fused_kernels(&mut self, enabled: bool);

    fn fused_kernels(&self) -> bool;

    /// Keep per-call constants resident on device instead of rebuilding them
    fn set_graph_capture(&mut self, enabled: bool);

    /// Convert linear layers to int8 dynamic quantization, returning how many
    /// were converted
    fn quantize_dynamic(&mut self, config: &QuantConfig) -> usize;

    /// Present once the module has been compiled
    fn compile_stats(&self) -> Option<CompileStats> {
        None
    }
}

/// Noise-prediction network
pub trait Denoiser<B: Backend>: ComputeModule<B> {
    /// `sample`: [batch, in_channels, h, w], `timestep`: [batch],
    /// `context`: [batch, seq, context_dim]. `mid_residual` is added after the
    /// middle block.
    fn forward(
        &self,
        sample: Tensor<B, 4>,
        timestep: Tensor<B, 1>,
        context: Tensor<B, 3>,
        mid_residual: Option<Tensor<B, 4>>,
    ) -> Tensor<B, 4>;

    fn in_channels(&self) -> usize;

    /// Native latent resolution
    fn sample_size(&self) -> usize;

    /// Spatial reduction between the latent and the middle block
    fn downsample_factor(&self) -> usize;

    fn context_dim(&self) -> usize;

    fn model_channels(&self) -> usize;

    /// Fuse LoRA weights in place, returning the number of fused layers
    fn fuse_lora(&mut self, lora: &LoraModel<B>) -> usize;

    fn to_device(self: Box<Self>, device: &B::Device) -> Box<dyn Denoiser<B>>;
}

/// ControlNet-style network producing a residual for the denoiser
pub trait ConditioningAdapter<B: Backend>: ComputeModule<B> {
    /// `control`: [batch, 3, height, width] image in [0, 1]. Returns the
    /// middle-block residual scaled by `scale`.
    fn forward(
        &self,
        sample: Tensor<B, 4>,
        timestep: Tensor<B, 1>,
        context: Tensor<B, 3>,
        control: Tensor<B, 4>,
        scale: f32,
    ) -> Tensor<B, 4>;

    fn in_channels(&self) -> usize;

    fn model_channels(&self) -> usize;

    fn context_dim(&self) -> usize;

    fn to_device(self: Box<Self>, device: &B::Device) -> Box<dyn ConditioningAdapter<B>>;
}

/// Latent autoencoder
pub trait Autoencoder<B: Backend>: ComputeModule<B> {
    /// Image in [-1, 1] to unscaled latent mean
    fn encode(&self, image: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Unscaled latent to image in [-1, 1]
    fn decode(&self, latent: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Spatial upscale from latent to image
    fn scale_factor(&self) -> usize;

    fn latent_channels(&self) -> usize;

    /// Multiplier applied to latents before denoising
    fn scaling_factor(&self) -> f32;

    fn to_device(self: Box<Self>, device: &B::Device) -> Box<dyn Autoencoder<B>>;
}

/// Prompt encoder (tokenizer included)
pub trait TextEncoder<B: Backend> {
    /// Returns [prompts.len(), seq, context_dim]
    fn encode(&self, prompts: &[String]) -> Tensor<B, 3>;

    fn context_dim(&self) -> usize;

    fn fuse_lora(&mut self, lora: &LoraModel<B>) -> usize;

    fn to_device(self: Box<Self>, device: &B::Device) -> Box<dyn TextEncoder<B>>;
}

/// Post-decode content filter
pub trait SafetyChecker {
    /// One flag per image; flagged images are blanked in place
    fn check(&self, images: &mut [RgbImage]) -> Vec<bool>;
}

/// Passed to [`StepCallback::on_step_end`] after each scheduler step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepEvent {
    pub step: usize,
    pub total_steps: usize,
    pub timestep: usize,
}

/// Per-step hook of a pipeline call
pub trait StepCallback<B: Backend> {
    fn on_step_end(&mut self, event: &StepEvent, device: &B::Device);
}
