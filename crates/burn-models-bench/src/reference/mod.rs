//! Reference latent-diffusion model family
//!
//! Small networks with the same component boundaries as a Stable Diffusion
//! checkpoint. They are what built-in names and exported directories load
//! into.

pub mod autoencoder;
pub(crate) mod blocks;
pub mod builtin;
pub mod controlnet;
pub mod safety;
pub mod text_encoder;
pub mod unet;
pub mod weights;

pub use autoencoder::{AutoencoderConfig, ReferenceAutoencoder};
pub use builtin::{
    BUILTINS, Builtin, BuiltinKind, PipelineConfigs, REFERENCE_CONTROLNET, REFERENCE_LCM_LORA, REFERENCE_SD,
    REFERENCE_SDXL, REFERENCE_VAE, find_builtin,
};
pub use controlnet::{ControlNetConfig, ReferenceControlNet};
pub use safety::LuminanceChecker;
pub use text_encoder::{ReferenceTextEncoder, TextEncoderConfig};
pub use unet::{ReferenceUNet, UNetConfig};
pub use weights::{FileWeights, Init, RecordingWeights, SeededWeights, WeightSource};
