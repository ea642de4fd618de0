//! Diffusion pipeline benchmarking on burn
//!
//! Assembles a text-to-image or image-to-image pipeline from a base model and
//! optional ControlNet, autoencoder, scheduler and LoRA overrides, applies a
//! compilation strategy, then times warmup calls and one profiled call.
//!
//! # Flow
//!
//! 1. [`loader::assemble`] resolves and loads every component
//! 2. [`compile::compile`] quantizes and compiles the compute-heavy modules
//! 3. [`inputs::prepare_inputs`] builds the call arguments shared by every call
//! 4. [`runner::run`] warms up, then measures one call with an
//!    [`profiler::IterationProfiler`]
//! 5. [`output::save_images`] writes the result
//!
//! # Example
//!
//! ```ignore
//! use burn_models_bench::{PipelineConfig, GenerationConfig, assemble, compile, prepare_inputs, run};
//!
//! let config = PipelineConfig::new("burn-models/reference-sd");
//! let pipeline = assemble::<MyBackend>(&config, &device)?;
//! let pipeline = compile(pipeline, config.compiler, config.quantize, config.disable_fusion)?;
//! let args = prepare_inputs(&GenerationConfig::default(), &pipeline)?;
//! let measurement = run(&pipeline, &args, 3)?;
//! println!("{:?} it/s", measurement.iterations_per_second());
//! ```

pub mod backends;
pub mod capabilities;
pub mod compile;
pub mod components;
pub mod config;
pub mod error;
pub mod hub;
pub mod inputs;
pub mod loader;
pub mod output;
pub mod pipeline;
pub mod profiler;
pub mod reference;
pub mod repository;
pub mod runner;
pub mod runtime;

pub use capabilities::{BackendTag, Capabilities};
pub use compile::{CompilationConfig, CompileStats, Compiler, CompilerStrategy, compile};
pub use components::{
    Autoencoder, ComputeModule, ConditioningAdapter, Denoiser, SafetyChecker, StepCallback, StepEvent, TextEncoder,
};
pub use config::{DEFAULT_PROMPT, GenerationConfig, PipelineConfig};
pub use error::{BenchError, Result};
pub use inputs::{CallArguments, prepare_inputs};
pub use loader::{assemble, assemble_with};
pub use output::{output_paths, save_images};
pub use pipeline::{DiffusionPipeline, PipelineKind, PipelineOutput};
pub use profiler::{DeviceClock, DeviceEvent, IterationProfiler, ProfilerState, SyncClock};
pub use runner::{Benchmark, Measurement, RunPhase, WarmupReport, run};
pub use runtime::RuntimeOptions;
