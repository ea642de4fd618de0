//! Weight loading and writing
//!
//! Reads safetensors files (f32, f16 and bf16) through a memory map, writes
//! them back out, and parses LoRA adapter files.
//!
//! ```ignore
//! use burn_models_convert::SafeTensorFile;
//!
//! let file = SafeTensorFile::open("diffusion_pytorch_model.safetensors")?;
//! let weight = file.load_f32::<B, 4>("conv_in.weight", &device)?;
//! ```
//!
//! # Specialized Loaders
//!
//! - [`load_lora`] - Load LoRA weights (Kohya, Diffusers formats)
//! - [`write_safetensors`] - Write named tensors in f32, f16 or bf16

pub mod loader;
pub mod lora_loader;
pub mod writer;

pub use loader::{LoadError, SafeTensorFile};
pub use lora_loader::{LoraFormat, LoraLoadError, kohya_to_internal_name, load_lora};
pub use writer::{StorageDtype, TensorEntry, WriteError, write_safetensors};
