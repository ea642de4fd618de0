//! Core Building Blocks for Diffusion Components
//!
//! Shared layers used by the denoiser, conditioning adapter and autoencoder
//! implementations in the burn-models ecosystem.
//!
//! # Modules
//!
//! - [`attention`] - Multi-head attention with standard, memory-efficient and sliced strategies
//! - [`groupnorm`] - Group normalization, with a fused GroupNorm + SiLU path
//! - [`layernorm`] - Layer normalization
//! - [`conv`] - Raw-weight 2D convolution and nearest upsampling
//! - [`linear`] - Linear layer that can be quantized or LoRA-fused in place
//! - [`quantization`] - INT8 weight and dynamic activation quantization
//! - [`lora`] - LoRA adapter weights
//! - [`precision`] - Weight precision modes
//!
//! # Example
//!
//! ```ignore
//! use burn_models_core::linear::DynLinear;
//! use burn_models_core::quantization::QuantConfig;
//!
//! let mut proj = DynLinear::new(weight, Some(bias));
//! proj.quantize(&QuantConfig::int8_dynamic());
//! let y = proj.forward(x);
//! ```

pub mod attention;
pub mod conv;
pub mod groupnorm;
pub mod layernorm;
pub mod linear;
pub mod lora;
pub mod precision;
pub mod quantization;

pub use attention::{Attention, AttentionConfig, AttentionStrategy, compute_attention};
pub use conv::{Conv2dLayer, upsample_nearest};
pub use groupnorm::GroupNorm;
pub use layernorm::LayerNorm;
pub use linear::DynLinear;
pub use lora::{LoraConvWeight, LoraModel, LoraWeight, LoraWeightType};
pub use precision::PrecisionMode;
pub use quantization::{QuantConfig, QuantizedLinear, QuantizedTensor, quantize};
