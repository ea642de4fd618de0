//! Assembled diffusion pipeline
//!
//! A struct of named component slots. The loader fills the slots, the
//! compiler and quantizer replace them in place, and [`DiffusionPipeline::call`]
//! runs text-to-image or image-to-image generation over whatever the slots
//! currently hold.

use std::fmt;

use burn::prelude::*;
use burn_models_core::QuantConfig;
use burn_models_samplers::{Generator, Scheduler};
use image::RgbImage;
use tracing::{debug, warn};

use crate::components::{
    Autoencoder, ConditioningAdapter, Denoiser, SafetyChecker, StepCallback, StepEvent, TextEncoder,
};
use crate::error::{BenchError, Result};
use crate::inputs::CallArguments;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineKind {
    #[default]
    TextToImage,
    ImageToImage,
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineKind::TextToImage => write!(f, "text-to-image"),
            PipelineKind::ImageToImage => write!(f, "image-to-image"),
        }
    }
}

/// Result of a pipeline call
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub images: Vec<RgbImage>,
    /// Present when a safety checker ran
    pub nsfw_content_detected: Option<Vec<bool>>,
}

pub struct DiffusionPipeline<B: Backend> {
    kind: PipelineKind,
    text_encoder: Box<dyn TextEncoder<B>>,
    denoiser: Box<dyn Denoiser<B>>,
    controlnet: Option<Box<dyn ConditioningAdapter<B>>>,
    vae: Box<dyn Autoencoder<B>>,
    scheduler: Box<dyn Scheduler<B>>,
    safety_checker: Option<Box<dyn SafetyChecker>>,
    custom_pipeline: Option<String>,
    adapter_backend_active: bool,
    device: B::Device,
}

impl<B: Backend> DiffusionPipeline<B> {
    pub fn new(
        kind: PipelineKind,
        text_encoder: Box<dyn TextEncoder<B>>,
        denoiser: Box<dyn Denoiser<B>>,
        vae: Box<dyn Autoencoder<B>>,
        scheduler: Box<dyn Scheduler<B>>,
        device: &B::Device,
    ) -> Self {
        Self {
            kind,
            text_encoder,
            denoiser,
            controlnet: None,
            vae,
            scheduler,
            safety_checker: None,
            custom_pipeline: None,
            adapter_backend_active: false,
            device: device.clone(),
        }
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn denoiser(&self) -> &dyn Denoiser<B> {
        self.denoiser.as_ref()
    }

    pub fn denoiser_mut(&mut self) -> &mut dyn Denoiser<B> {
        self.denoiser.as_mut()
    }

    pub fn controlnet(&self) -> Option<&dyn ConditioningAdapter<B>> {
        self.controlnet.as_deref()
    }

    pub fn vae(&self) -> &dyn Autoencoder<B> {
        self.vae.as_ref()
    }

    pub fn scheduler(&self) -> &dyn Scheduler<B> {
        self.scheduler.as_ref()
    }

    pub fn text_encoder_mut(&mut self) -> &mut dyn TextEncoder<B> {
        self.text_encoder.as_mut()
    }

    pub fn safety_checker(&self) -> Option<&dyn SafetyChecker> {
        self.safety_checker.as_deref()
    }

    pub fn custom_pipeline(&self) -> Option<&str> {
        self.custom_pipeline.as_deref()
    }

    pub fn set_denoiser(&mut self, denoiser: Box<dyn Denoiser<B>>) {
        self.denoiser = denoiser;
    }

    pub fn set_controlnet(&mut self, controlnet: Option<Box<dyn ConditioningAdapter<B>>>) {
        self.controlnet = controlnet;
    }

    pub fn set_vae(&mut self, vae: Box<dyn Autoencoder<B>>) {
        self.vae = vae;
    }

    pub fn set_scheduler(&mut self, scheduler: Box<dyn Scheduler<B>>) {
        self.scheduler = scheduler;
    }

    pub fn set_safety_checker(&mut self, checker: Option<Box<dyn SafetyChecker>>) {
        self.safety_checker = checker;
    }

    pub fn set_custom_pipeline(&mut self, tag: Option<String>) {
        self.custom_pipeline = tag;
    }

    /// Whether LoRA weights were fused through the adapter backend
    pub fn adapter_backend_active(&self) -> bool {
        self.adapter_backend_active
    }

    pub fn set_adapter_backend_active(&mut self, active: bool) {
        self.adapter_backend_active = active;
    }

    /// Replace the denoiser with a transformed version of itself
    pub fn map_denoiser(self, f: impl FnOnce(Box<dyn Denoiser<B>>) -> Box<dyn Denoiser<B>>) -> Self {
        Self {
            denoiser: f(self.denoiser),
            ..self
        }
    }

    pub fn map_controlnet(
        self,
        f: impl FnOnce(Box<dyn ConditioningAdapter<B>>) -> Box<dyn ConditioningAdapter<B>>,
    ) -> Self {
        Self {
            controlnet: self.controlnet.map(f),
            ..self
        }
    }

    pub fn map_vae(self, f: impl FnOnce(Box<dyn Autoencoder<B>>) -> Box<dyn Autoencoder<B>>) -> Self {
        Self {
            vae: f(self.vae),
            ..self
        }
    }

    /// Move every component to `device`
    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            text_encoder: self.text_encoder.to_device(device),
            denoiser: self.denoiser.to_device(device),
            controlnet: self.controlnet.map(|c| c.to_device(device)),
            vae: self.vae.to_device(device),
            device: device.clone(),
            ..self
        }
    }

    /// Dynamic int8 quantization of the denoiser, conditioning adapter and
    /// autoencoder; returns the number of converted layers
    pub fn quantize_dynamic(&mut self, config: &QuantConfig) -> usize {
        let mut converted = self.denoiser.quantize_dynamic(config) + self.vae.quantize_dynamic(config);
        if let Some(controlnet) = &mut self.controlnet {
            converted += controlnet.quantize_dynamic(config);
        }
        converted
    }

    /// Custom pipeline loops do not advertise a per-step callback
    pub fn accepts_step_callback(&self) -> bool {
        self.custom_pipeline.is_none()
    }

    /// Height and width must be multiples of this
    pub fn resolution_multiple(&self) -> usize {
        self.vae.scale_factor() * self.denoiser.downsample_factor()
    }

    /// Native output resolution of the denoiser
    pub fn native_resolution(&self) -> usize {
        self.denoiser.sample_size() * self.vae.scale_factor()
    }

    fn validate(&self, args: &CallArguments, has_callback: bool) -> Result<()> {
        let multiple = self.resolution_multiple();
        if args.height == 0 || args.width == 0 || args.height % multiple != 0 || args.width % multiple != 0 {
            return Err(BenchError::InvalidArguments(format!(
                "height and width must be positive multiples of {multiple}, got {}x{}",
                args.width, args.height
            )));
        }
        if args.num_inference_steps == 0 || args.num_images_per_prompt == 0 {
            return Err(BenchError::InvalidArguments(
                "num_inference_steps and num_images_per_prompt must be at least 1".into(),
            ));
        }
        let expected = (args.width as u32, args.height as u32);
        for (slot, image) in [("image", &args.image), ("control_image", &args.control_image)] {
            if let Some(image) = image.as_ref().filter(|image| image.dimensions() != expected) {
                return Err(BenchError::InvalidArguments(format!(
                    "{slot} is {}x{} but the call asks for {}x{}",
                    image.width(),
                    image.height(),
                    args.width,
                    args.height
                )));
            }
        }
        if self.kind == PipelineKind::ImageToImage && args.image.is_none() {
            return Err(BenchError::InvalidArguments("image-to-image requires an input image".into()));
        }
        if self.controlnet.is_some() && self.control_image(args).is_none() {
            return Err(BenchError::InvalidArguments("a ControlNet requires a control image".into()));
        }
        if has_callback && !self.accepts_step_callback() {
            return Err(BenchError::InvalidArguments(
                "custom pipelines do not accept a step callback".into(),
            ));
        }
        Ok(())
    }

    fn control_image<'a>(&self, args: &'a CallArguments) -> Option<&'a RgbImage> {
        match self.kind {
            PipelineKind::TextToImage => args.image.as_ref(),
            PipelineKind::ImageToImage => args.control_image.as_ref(),
        }
    }

    /// Prompt embeddings, unconditional rows first when guidance is on
    fn encode_prompt(&self, args: &CallArguments, guidance: bool) -> Tensor<B, 3> {
        let batch = args.num_images_per_prompt;
        let mut prompts = Vec::with_capacity(batch * 2);
        if guidance {
            let negative = args.negative_prompt.clone().unwrap_or_default();
            prompts.extend(std::iter::repeat_n(negative, batch));
        }
        prompts.extend(std::iter::repeat_n(args.prompt.clone(), batch));
        self.text_encoder.encode(&prompts)
    }

    /// Generate images
    ///
    /// The generator in `args` is cloned, so repeated calls with the same
    /// arguments draw the same noise.
    pub fn call(
        &self,
        args: &CallArguments,
        mut callback: Option<&mut dyn StepCallback<B>>,
    ) -> Result<PipelineOutput> {
        self.validate(args, callback.is_some())?;
        if !args.extra.is_empty() {
            let keys: Vec<&str> = args.extra.keys().map(String::as_str).collect();
            warn!(?keys, "ignoring call arguments the pipeline does not use");
        }

        let device = &self.device;
        let batch = args.num_images_per_prompt;
        let guidance = args.guidance_scale > 1.0;
        let mut generator = args.generator.clone().unwrap_or_else(Generator::from_entropy);

        let context = self.encode_prompt(args, guidance);
        let plan = self.scheduler.timesteps(args.num_inference_steps);
        let scale = self.vae.scale_factor();
        let latent_shape = [
            batch,
            self.denoiser.in_channels(),
            args.height / scale,
            args.width / scale,
        ];

        let (mut latent, start) = match (self.kind, &args.image) {
            (PipelineKind::ImageToImage, Some(image)) => {
                let start = plan.start_index(args.strength as f64);
                let pixels = image_to_tensor::<B>(image, device) * 2.0 - 1.0;
                let encoded = (self.vae.encode(pixels) * self.vae.scaling_factor()).repeat_dim(0, batch);
                let latent = if start < plan.len() {
                    let noise = generator.randn::<B, 4>(latent_shape, device);
                    self.scheduler.add_noise(encoded, noise, &plan, start)
                } else {
                    encoded
                };
                (latent, start)
            }
            _ => {
                let noise = generator.randn::<B, 4>(latent_shape, device);
                (noise * self.scheduler.init_noise_sigma(&plan), 0)
            }
        };
        debug!(kind = %self.kind, steps = plan.len() - start.min(plan.len()), guidance, "sampling");

        let control = self.control_image(args).map(|image| {
            let control = image_to_tensor::<B>(image, device);
            control.repeat_dim(0, if guidance { batch * 2 } else { batch })
        });

        for step in start..plan.len() {
            let timestep = plan.timesteps[step];
            let model_input = if guidance {
                Tensor::cat(vec![latent.clone(), latent.clone()], 0)
            } else {
                latent.clone()
            };
            let model_input = self.scheduler.scale_model_input(model_input, &plan, step);
            let rows = model_input.dims()[0];
            let t = Tensor::<B, 1>::from_data(TensorData::new(vec![timestep as f32; rows], [rows]), device);

            let mid_residual = match (&self.controlnet, &control) {
                (Some(controlnet), Some(control)) => Some(controlnet.forward(
                    model_input.clone(),
                    t.clone(),
                    context.clone(),
                    control.clone(),
                    args.controlnet_conditioning_scale,
                )),
                _ => None,
            };
            let noise_pred = self.denoiser.forward(model_input, t, context.clone(), mid_residual);

            let noise_pred = if guidance {
                let mut halves = noise_pred.chunk(2, 0).into_iter();
                match (halves.next(), halves.next()) {
                    (Some(uncond), Some(cond)) => uncond.clone() + (cond - uncond) * args.guidance_scale,
                    _ => return Err(BenchError::Tensor("guidance batch did not split in two".into())),
                }
            } else {
                noise_pred
            };

            latent = self.scheduler.step(noise_pred, &plan, step, latent, &mut generator);

            if let Some(callback) = callback.as_deref_mut() {
                let event = StepEvent {
                    step,
                    total_steps: plan.len(),
                    timestep,
                };
                callback.on_step_end(&event, device);
            }
        }

        let latent = latent / self.vae.scaling_factor();
        let [_, channels, height, width] = latent.dims();
        let mut images = Vec::with_capacity(batch);
        for i in 0..batch {
            let decoded = self
                .vae
                .decode(latent.clone().slice([i..i + 1, 0..channels, 0..height, 0..width]));
            images.extend(tensor_to_images(decoded)?);
        }

        let nsfw_content_detected = self
            .safety_checker
            .as_ref()
            .map(|checker| checker.check(&mut images));

        Ok(PipelineOutput {
            images,
            nsfw_content_detected,
        })
    }
}

/// `[1, 3, h, w]` tensor in [0, 1]
pub fn image_to_tensor<B: Backend>(image: &RgbImage, device: &B::Device) -> Tensor<B, 4> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let mut data = vec![0.0f32; 3 * height * width];
    for (x, y, pixel) in image.enumerate_pixels() {
        let idx = y as usize * width + x as usize;
        for c in 0..3 {
            data[c * height * width + idx] = pixel.0[c] as f32 / 255.0;
        }
    }
    Tensor::from_data(TensorData::new(data, [1, 3, height, width]), device)
}

/// Images in [-1, 1] to 8-bit RGB
pub fn tensor_to_images<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<RgbImage>> {
    let [batch, _, height, width] = tensor.dims();
    let scaled = ((tensor + 1.0) * 127.5).clamp(0.0, 255.0);
    let floats: Vec<f32> = scaled
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| BenchError::Tensor(format!("{e:?}")))?;

    let plane = height * width;
    let mut images = Vec::with_capacity(batch);
    for b in 0..batch {
        let base = b * 3 * plane;
        let mut rgb = Vec::with_capacity(plane * 3);
        for idx in 0..plane {
            for c in 0..3 {
                rgb.push(floats[base + c * plane + idx].round() as u8);
            }
        }
        let image = RgbImage::from_raw(width as u32, height as u32, rgb)
            .ok_or_else(|| BenchError::Tensor("decoded buffer has the wrong size".into()))?;
        images.push(image);
    }
    Ok(images)
}
