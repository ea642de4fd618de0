//! Pipeline assembly
//!
//! Resolves every component of a [`PipelineConfig`], loads it at the
//! configured precision and wires it into a [`DiffusionPipeline`]. Components
//! are built on the host device and moved to the target device last.

use std::path::{Path, PathBuf};

use burn::prelude::*;
use burn_models_convert::{LoraFormat, load_lora};
use burn_models_core::PrecisionMode;
use burn_models_samplers::{SCHEDULER_NAMES, create_scheduler};
use tracing::{debug, info, warn};

use crate::capabilities::{BackendTag, Capabilities};
use crate::components::{Autoencoder, ConditioningAdapter, Denoiser};
use crate::config::PipelineConfig;
use crate::error::{BenchError, Result};
use crate::hub::{ModelSource, resolve};
use crate::pipeline::DiffusionPipeline;
use crate::reference::{
    AutoencoderConfig, Builtin, BuiltinKind, ControlNetConfig, FileWeights, LuminanceChecker, PipelineConfigs,
    ReferenceAutoencoder, ReferenceControlNet, ReferenceTextEncoder, ReferenceUNet, WeightSource,
};
use crate::repository::{
    self, CONFIG, ExportOptions, LORA_WEIGHTS, MODEL_WEIGHTS, TEXT_ENCODER_WEIGHTS, export_builtin, read_json,
    weights_file,
};

/// Assemble with the process-wide capability registry
pub fn assemble<B: Backend>(config: &PipelineConfig, device: &B::Device) -> Result<DiffusionPipeline<B>> {
    assemble_with(config, Capabilities::global(), device)
}

pub fn assemble_with<B: Backend>(
    config: &PipelineConfig,
    capabilities: &Capabilities,
    device: &B::Device,
) -> Result<DiffusionPipeline<B>> {
    let host = B::Device::default();
    let precision = config.precision;
    let variant = config.variant.as_deref();

    info!(kind = %config.kind, model = %config.model, ?precision, "loading base pipeline");
    let base = resolve(&config.model, variant)?;
    let mut pipeline = load_base::<B>(config, &base, &host)?;

    if let Some(identity) = &config.controlnet {
        info!(controlnet = %identity, "loading ControlNet");
        let controlnet = load_controlnet::<B>(identity, precision, &host)?;
        check_controlnet(pipeline.denoiser(), controlnet.as_ref())?;
        pipeline.set_controlnet(Some(controlnet));
    }

    if let Some(identity) = &config.vae {
        info!(vae = %identity, "loading autoencoder");
        let vae = load_autoencoder::<B>(identity, precision, &host)?;
        check_autoencoder(pipeline.denoiser(), vae.as_ref())?;
        pipeline.set_vae(vae);
    }

    if let Some(name) = &config.scheduler {
        let scheduler = create_scheduler::<B>(name, pipeline.scheduler().config()).ok_or_else(|| {
            BenchError::UnsupportedScheduler {
                name: name.clone(),
                available: SCHEDULER_NAMES.join(", "),
            }
        })?;
        info!(scheduler = scheduler.name(), "replacing scheduler");
        pipeline.set_scheduler(scheduler);
    }

    if let Some(identity) = &config.lora {
        if !capabilities.has(BackendTag::AdapterFusion) {
            return Err(BenchError::AdapterBackendUnavailable);
        }
        info!(lora = %identity, scale = config.lora_scale, "fusing LoRA weights");
        fuse_lora(&mut pipeline, identity, config.lora_scale, &host)?;
    }

    if pipeline.safety_checker().is_some() {
        info!("disabling safety checker");
        pipeline.set_safety_checker(None);
    }

    pipeline.set_custom_pipeline(config.custom_pipeline.clone());
    pipeline.set_adapter_backend_active(capabilities.has(BackendTag::AdapterFusion));

    debug!(device = ?device, "moving pipeline to device");
    Ok(pipeline.to_device(device))
}

/// Where each component's weights come from
enum Weights<'a> {
    Seeded(&'a Builtin),
    Files { dir: &'a Path, variant: Option<&'a str> },
}

impl Weights<'_> {
    fn source(&self, component: &str, stem: &str, precision: PrecisionMode) -> Result<Box<dyn WeightSource>> {
        Ok(match self {
            Weights::Seeded(builtin) => Box::new(builtin.weights(component, precision)),
            Weights::Files { dir, variant } => {
                let path = weights_file(&dir.join(component), stem, *variant)?;
                debug!(component, path = %path.display(), "reading weights");
                Box::new(FileWeights::open(path, precision)?)
            }
        })
    }
}

fn not_a(component: &'static str, source: &ModelSource) -> BenchError {
    BenchError::IncompatibleComponent {
        component,
        reason: format!("{} is not a {component}", source.describe()),
    }
}

fn load_base<B: Backend>(
    config: &PipelineConfig,
    source: &ModelSource,
    device: &B::Device,
) -> Result<DiffusionPipeline<B>> {
    let (configs, weights): (PipelineConfigs, Weights<'_>) = match source {
        ModelSource::Builtin(builtin) if builtin.kind == BuiltinKind::Pipeline => {
            let configs = builtin.pipeline_configs().ok_or_else(|| not_a("pipeline", source))?;
            (configs, Weights::Seeded(builtin))
        }
        ModelSource::Directory(dir) if repository::is_pipeline_dir(dir) => {
            let configs = repository::read_pipeline_configs(dir)?;
            let weights = Weights::Files {
                dir,
                variant: config.variant.as_deref(),
            };
            (configs, weights)
        }
        _ => return Err(not_a("pipeline", source)),
    };
    debug!(class = %configs.class_name, scheduler = %configs.scheduler_class, "pipeline configs");

    let precision = config.precision;
    let text_encoder = ReferenceTextEncoder::<B>::new(
        configs.text_encoder.clone(),
        weights.source("text_encoder", TEXT_ENCODER_WEIGHTS, precision)?.as_mut(),
        device,
    )?;
    let unet = ReferenceUNet::<B>::new(
        configs.unet.clone(),
        weights.source("unet", MODEL_WEIGHTS, precision)?.as_mut(),
        device,
    )?;
    let vae = ReferenceAutoencoder::<B>::new(
        configs.vae.clone(),
        weights.source("vae", MODEL_WEIGHTS, precision)?.as_mut(),
        device,
    )?;

    if configs.text_encoder.context_dim != configs.unet.context_dim {
        return Err(BenchError::model_config(
            config.model.as_str(),
            format!(
                "text encoder context {} does not match UNet context {}",
                configs.text_encoder.context_dim, configs.unet.context_dim
            ),
        ));
    }
    check_autoencoder(&unet, &vae)?;

    let scheduler = create_scheduler::<B>(&configs.scheduler_class, &configs.scheduler).ok_or_else(|| {
        BenchError::UnsupportedScheduler {
            name: configs.scheduler_class.clone(),
            available: SCHEDULER_NAMES.join(", "),
        }
    })?;

    let mut pipeline = DiffusionPipeline::new(
        config.kind,
        Box::new(text_encoder),
        Box::new(unet),
        Box::new(vae),
        scheduler,
        device,
    );
    if configs.safety_checker {
        pipeline.set_safety_checker(Some(Box::new(LuminanceChecker::default())));
    }
    Ok(pipeline)
}

/// Load a ControlNet from a single `.safetensors` file, a repository
/// directory or a built-in
fn load_controlnet<B: Backend>(
    identity: &str,
    precision: PrecisionMode,
    device: &B::Device,
) -> Result<Box<dyn ConditioningAdapter<B>>> {
    let source = resolve(identity, None)?;
    let (config, mut weights): (ControlNetConfig, Box<dyn WeightSource>) = match &source {
        ModelSource::File(path) if is_safetensors(path) => {
            let weights = FileWeights::open(path, precision)?;
            let config = ControlNetConfig::infer_from_shapes(|name| weights.file().shape(name).map(<[usize]>::to_vec))
                .ok_or_else(|| BenchError::model_config(path, "not a ControlNet checkpoint"))?;
            debug!(?config, "inferred ControlNet config from tensor shapes");
            (config, Box::new(weights))
        }
        ModelSource::Directory(dir) => {
            let config = read_json(&dir.join(CONFIG))?;
            let weights = FileWeights::open(weights_file(dir, MODEL_WEIGHTS, None)?, precision)?;
            (config, Box::new(weights))
        }
        ModelSource::Builtin(builtin) if builtin.kind == BuiltinKind::ControlNet => {
            let config = builtin.controlnet_config().unwrap_or_default();
            (config, Box::new(builtin.weights("controlnet", precision)))
        }
        _ => return Err(not_a("ControlNet", &source)),
    };
    Ok(Box::new(ReferenceControlNet::<B>::new(config, weights.as_mut(), device)?))
}

fn load_autoencoder<B: Backend>(
    identity: &str,
    precision: PrecisionMode,
    device: &B::Device,
) -> Result<Box<dyn Autoencoder<B>>> {
    let source = resolve(identity, None)?;
    let (config, mut weights): (AutoencoderConfig, Box<dyn WeightSource>) = match &source {
        ModelSource::Directory(dir) => {
            let config = read_json(&dir.join(CONFIG))?;
            let weights = FileWeights::open(weights_file(dir, MODEL_WEIGHTS, None)?, precision)?;
            (config, Box::new(weights))
        }
        ModelSource::Builtin(builtin) if builtin.kind == BuiltinKind::Autoencoder => {
            let config = builtin.autoencoder_config().unwrap_or_default();
            (config, Box::new(builtin.weights("vae", precision)))
        }
        _ => return Err(not_a("autoencoder", &source)),
    };
    Ok(Box::new(ReferenceAutoencoder::<B>::new(config, weights.as_mut(), device)?))
}

fn is_safetensors(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"))
}

fn check_controlnet<B: Backend>(
    denoiser: &dyn Denoiser<B>,
    controlnet: &dyn ConditioningAdapter<B>,
) -> Result<()> {
    let mismatch = |what: &str, expected: usize, actual: usize| BenchError::IncompatibleComponent {
        component: "ControlNet",
        reason: format!("{what} is {actual}, the denoiser expects {expected}"),
    };
    if controlnet.in_channels() != denoiser.in_channels() {
        return Err(mismatch("input channels", denoiser.in_channels(), controlnet.in_channels()));
    }
    if controlnet.model_channels() != denoiser.model_channels() {
        return Err(mismatch("model channels", denoiser.model_channels(), controlnet.model_channels()));
    }
    if controlnet.context_dim() != denoiser.context_dim() {
        return Err(mismatch("context dim", denoiser.context_dim(), controlnet.context_dim()));
    }
    Ok(())
}

fn check_autoencoder<B: Backend>(denoiser: &dyn Denoiser<B>, vae: &dyn Autoencoder<B>) -> Result<()> {
    if vae.latent_channels() != denoiser.in_channels() {
        return Err(BenchError::IncompatibleComponent {
            component: "autoencoder",
            reason: format!(
                "{} latent channels, the denoiser expects {}",
                vae.latent_channels(),
                denoiser.in_channels()
            ),
        });
    }
    Ok(())
}

fn fuse_lora<B: Backend>(
    pipeline: &mut DiffusionPipeline<B>,
    identity: &str,
    scale: f32,
    device: &B::Device,
) -> Result<()> {
    let source = resolve(identity, None)?;
    // keeps an exported built-in alive until it has been read
    let mut scratch = None;
    let path: PathBuf = match &source {
        ModelSource::File(path) => path.clone(),
        ModelSource::Directory(dir) => dir.join(LORA_WEIGHTS),
        ModelSource::Builtin(builtin) if builtin.kind == BuiltinKind::Lora => {
            let dir = tempfile::tempdir()?;
            export_builtin::<B>(builtin, dir.path(), &ExportOptions::default(), device)?;
            let path = dir.path().join(LORA_WEIGHTS);
            scratch = Some(dir);
            path
        }
        _ => return Err(not_a("LoRA", &source)),
    };

    let lora = load_lora::<B>(&path, scale, LoraFormat::Auto, device)?;
    drop(scratch);

    let denoiser = pipeline.denoiser_mut().fuse_lora(&lora);
    let text_encoder = pipeline.text_encoder_mut().fuse_lora(&lora);
    if denoiser + text_encoder == 0 {
        warn!(lora = identity, layers = lora.len(), "no LoRA layer matched the pipeline");
    } else {
        info!(denoiser, text_encoder, "fused LoRA layers");
    }
    Ok(())
}
