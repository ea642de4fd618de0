//! burn-bench
//!
//! Benchmarks diffusion pipelines built on burn: assembles a pipeline from
//! the given components, compiles it, warms it up and times one call.
//!
//! Two presets are provided:
//! - `run`: SDXL-sized pipeline with a ControlNet, custom autoencoder,
//!   quantization and graph compilation
//! - `lcm-lora`: SD-sized pipeline with the LCM scheduler and LCM-LoRA at
//!   four steps
//!
//! Every preset value can be overridden; pass `none` to drop a preset
//! component.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use burn_models_bench::backends::{DefaultBackend, compiled_backends, default_device};
use burn_models_bench::reference::{BUILTINS, find_builtin};
use burn_models_bench::repository::{ExportOptions, export_builtin};
use burn_models_bench::{
    Benchmark, Capabilities, CompilerStrategy, GenerationConfig, PipelineConfig, assemble, compile, prepare_inputs,
    save_images,
};
use burn_models_convert::StorageDtype;
use burn_models_core::PrecisionMode;
use burn_models_samplers::SCHEDULER_NAMES;
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod preview;

#[derive(Parser)]
#[command(name = "burn-bench")]
#[command(about = "Diffusion pipeline benchmarks in pure Rust")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Benchmark a large pipeline with ControlNet, custom VAE and quantization
    Run(BenchArgs),

    /// Benchmark a small pipeline with LCM-LoRA at four steps
    LcmLora(BenchArgs),

    /// Write a built-in model to a directory
    Export {
        /// Built-in model name (see `info`)
        model: String,

        /// Output directory
        dir: PathBuf,

        /// Weight file variant, e.g. fp16
        #[arg(long)]
        variant: Option<String>,

        /// Storage dtype of the weight files
        #[arg(long, value_enum, default_value = "f32")]
        dtype: ExportDtype,
    },

    /// Show compiled backends, capabilities, schedulers and built-in models
    Info,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExportDtype {
    F32,
    F16,
    Bf16,
}

impl From<ExportDtype> for StorageDtype {
    fn from(dtype: ExportDtype) -> Self {
        match dtype {
            ExportDtype::F32 => StorageDtype::F32,
            ExportDtype::F16 => StorageDtype::F16,
            ExportDtype::Bf16 => StorageDtype::BF16,
        }
    }
}

/// Benchmark options; unset values come from the preset
#[derive(Args, Debug, Default)]
struct BenchArgs {
    /// Base model: directory, built-in name or Hub repository
    #[arg(long)]
    model: Option<String>,

    /// Weight file variant, e.g. fp16
    #[arg(long)]
    variant: Option<String>,

    /// Custom pipeline tag
    #[arg(long)]
    custom_pipeline: Option<String>,

    /// Scheduler override, or `none`
    #[arg(long)]
    scheduler: Option<String>,

    /// LoRA weights to fuse, or `none`
    #[arg(long)]
    lora: Option<String>,

    /// LoRA fusion scale
    #[arg(long, default_value = "1.0")]
    lora_scale: f32,

    /// ControlNet model or `.safetensors` file, or `none`
    #[arg(long)]
    controlnet: Option<String>,

    /// Autoencoder override, or `none`
    #[arg(long)]
    vae: Option<String>,

    /// Number of inference steps
    #[arg(long)]
    steps: Option<usize>,

    #[arg(long)]
    prompt: Option<String>,

    #[arg(long)]
    negative_prompt: Option<String>,

    #[arg(long)]
    seed: Option<u64>,

    /// Calls made before the measured one
    #[arg(long)]
    warmups: Option<usize>,

    /// Images per prompt
    #[arg(long)]
    batch: Option<usize>,

    /// Image height (default: preset size)
    #[arg(long)]
    height: Option<usize>,

    /// Image width (default: preset size)
    #[arg(long)]
    width: Option<usize>,

    /// JSON object of extra call arguments, applied last
    #[arg(long)]
    extra_call_kwargs: Option<String>,

    /// Input image path or file:// URI; selects image-to-image
    #[arg(long)]
    input_image: Option<String>,

    /// Control image path or file:// URI
    #[arg(long)]
    control_image: Option<String>,

    /// Where to save the generated images
    #[arg(long)]
    output_image: Option<PathBuf>,

    /// none, graph-compile, trace-compile or trace-compile-autotune
    #[arg(long)]
    compiler: Option<String>,

    /// Quantize linear layers to int8
    #[arg(long, conflicts_with = "no_quantize")]
    quantize: bool,

    #[arg(long)]
    no_quantize: bool,

    /// Turn off automatic operator fusion for the whole process
    #[arg(long)]
    disable_fusion: bool,

    /// Print the generated images to the terminal
    #[arg(long)]
    print_image: bool,

    /// Load precision: fp32, fp16 or bf16
    #[arg(long, default_value = "fp16")]
    precision: String,
}

/// Defaults of a benchmark subcommand
struct Preset {
    model: &'static str,
    vae: Option<&'static str>,
    scheduler: Option<&'static str>,
    controlnet: Option<&'static str>,
    lora: Option<&'static str>,
    steps: usize,
    size: usize,
    warmups: usize,
    extra_call_kwargs: Option<&'static str>,
    quantize: bool,
    compiler: CompilerStrategy,
}

const RUN_PRESET: Preset = Preset {
    model: "burn-models/reference-sdxl",
    vae: Some("burn-models/reference-vae"),
    scheduler: Some("EulerAncestralDiscreteScheduler"),
    controlnet: Some("burn-models/reference-controlnet"),
    lora: None,
    steps: 20,
    size: 1024,
    warmups: 3,
    extra_call_kwargs: None,
    quantize: true,
    compiler: CompilerStrategy::GraphCompile,
};

const LCM_LORA_PRESET: Preset = Preset {
    model: "burn-models/reference-sd",
    vae: None,
    scheduler: Some("LCMScheduler"),
    controlnet: None,
    lora: Some("burn-models/reference-lcm-lora"),
    steps: 4,
    size: 512,
    warmups: 3,
    extra_call_kwargs: Some(r#"{"guidance_scale": 0.0}"#),
    quantize: false,
    compiler: CompilerStrategy::GraphCompile,
};

/// An explicit value wins over the preset; `none` drops the component
fn component(arg: &Option<String>, preset: Option<&str>) -> Option<String> {
    match arg.as_deref() {
        Some(value) if value.eq_ignore_ascii_case("none") => None,
        Some(value) => Some(value.to_string()),
        None => preset.map(str::to_string),
    }
}

impl BenchArgs {
    fn generation_config(&self, preset: &Preset) -> GenerationConfig {
        GenerationConfig {
            prompt: self.prompt.clone().unwrap_or_else(|| GenerationConfig::default().prompt),
            negative_prompt: self.negative_prompt.clone(),
            steps: self.steps.unwrap_or(preset.steps),
            batch: self.batch.unwrap_or(1),
            height: self.height.or(Some(preset.size)),
            width: self.width.or(Some(preset.size)),
            seed: self.seed,
            input_image: self.input_image.clone(),
            control_image: self.control_image.clone(),
            extra_call_kwargs: component(&self.extra_call_kwargs, preset.extra_call_kwargs),
        }
    }

    fn pipeline_config(&self, preset: &Preset, generation: &GenerationConfig) -> Result<PipelineConfig> {
        let compiler = match &self.compiler {
            Some(name) => name.parse::<CompilerStrategy>()?,
            None => preset.compiler,
        };
        let precision = self.precision.parse::<PrecisionMode>().map_err(|e| anyhow!(e))?;
        let quantize = if self.quantize {
            true
        } else if self.no_quantize {
            false
        } else {
            preset.quantize
        };

        let mut config = PipelineConfig::new(self.model.as_deref().unwrap_or(preset.model));
        config.variant = self.variant.clone();
        config.custom_pipeline = self.custom_pipeline.clone();
        config.scheduler = component(&self.scheduler, preset.scheduler);
        config.lora = component(&self.lora, preset.lora);
        config.lora_scale = self.lora_scale;
        config.controlnet = component(&self.controlnet, preset.controlnet);
        config.vae = component(&self.vae, preset.vae);
        config.kind = generation.pipeline_kind();
        config.precision = precision;
        config.compiler = compiler;
        config.quantize = quantize;
        config.disable_fusion = self.disable_fusion;
        Ok(config)
    }
}

fn bench(args: BenchArgs, preset: &Preset) -> Result<()> {
    let generation = args.generation_config(preset);
    let config = args.pipeline_config(preset, &generation)?;
    let warmups = args.warmups.unwrap_or(preset.warmups);
    let device = default_device();
    debug!(?config, ?generation, warmups, "resolved preset");

    println!("burn-bench: {}\n", config.model);
    println!("Configuration:");
    println!("  Backends: {}", compiled_backends().join(", "));
    println!("  Precision: {}", config.precision);
    println!("  Compiler: {}", config.compiler);
    println!("  Quantize: {}", config.quantize);
    for (label, value) in [
        ("Scheduler", &config.scheduler),
        ("LoRA", &config.lora),
        ("ControlNet", &config.controlnet),
        ("VAE", &config.vae),
    ] {
        if let Some(value) = value {
            println!("  {label}: {value}");
        }
    }
    println!();

    let begin_prep = Instant::now();
    let pipeline = assemble::<DefaultBackend>(&config, &device)
        .with_context(|| format!("Failed to assemble {}", config.model))?;
    let pipeline = compile(pipeline, config.compiler, config.quantize, config.disable_fusion)?;
    let args_bundle = prepare_inputs(&generation, &pipeline)?;
    println!("Model preparation time: {:.3}s", begin_prep.elapsed().as_secs_f64());

    let mut benchmark = Benchmark::new(&pipeline, &args_bundle);
    if warmups > 0 {
        println!("Begin warmup");
        let pb = ProgressBar::new(warmups as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                .progress_chars("#>-"),
        );
        let report = benchmark.warmup_with(warmups, |i, elapsed| {
            pb.set_message(format!("{:.3}s", elapsed.as_secs_f64()));
            pb.set_position(i as u64 + 1);
        })?;
        pb.finish_and_clear();
        println!("End warmup");
        println!(
            "Warmup time ({} times): {:.3}s",
            report.iterations,
            report.elapsed.as_secs_f64()
        );
    }

    println!("Call arguments:");
    println!("{args_bundle}");

    let measurement = benchmark.measure()?;
    println!("Inference time: {:.3}s", measurement.elapsed.as_secs_f64());
    if let Some(rate) = measurement.iterations_per_second() {
        println!("Iterations per second: {rate:.3}");
    }

    if let Some(path) = &args.output_image {
        let written = save_images(&measurement.images, path)?;
        println!();
        for path in written {
            println!("Saved to: {}", path.display());
        }
    }

    if args.print_image {
        for image in &measurement.images {
            preview::print_image(image, preview::MAX_WIDTH);
        }
    }

    Ok(())
}

fn export(model: &str, dir: &Path, variant: Option<String>, dtype: ExportDtype) -> Result<()> {
    let builtin = find_builtin(model).ok_or_else(|| anyhow!("Unknown built-in model: {model}"))?;
    let options = ExportOptions {
        variant,
        dtype: dtype.into(),
    };

    let start = Instant::now();
    let written = export_builtin::<DefaultBackend>(builtin, dir, &options, &default_device())
        .with_context(|| format!("Failed to export {model}"))?;
    for path in &written {
        println!("  {}", path.display());
    }
    println!(
        "\nExported {} ({} files) in {:.3}s",
        builtin.name,
        written.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn info() {
    println!("burn-bench: diffusion pipeline benchmarks in pure Rust\n");

    println!("Compiled backends:");
    for name in compiled_backends() {
        println!("  - {name}");
    }

    let caps = Capabilities::global();
    println!("\nOptional backends:");
    if caps.is_empty() {
        println!("  (none)");
    }
    for tag in caps.tags() {
        println!("  - {tag}");
    }

    println!("\nCompilers:");
    for strategy in CompilerStrategy::ALL {
        println!("  - {strategy}");
    }

    println!("\nSchedulers:");
    for name in SCHEDULER_NAMES {
        println!("  - {name}");
    }

    println!("\nBuilt-in models:");
    for builtin in BUILTINS {
        println!("  - {} ({:?}): {}", builtin.name, builtin.kind, builtin.description);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => bench(args, &RUN_PRESET),
        Commands::LcmLora(args) => bench(args, &LCM_LORA_PRESET),
        Commands::Export {
            model,
            dir,
            variant,
            dtype,
        } => {
            if dir.exists() && dir.read_dir()?.next().is_some() {
                bail!("{} is not empty", dir.display());
            }
            export(&model, &dir, variant, dtype)
        }
        Commands::Info => {
            info();
            Ok(())
        }
    }
}
