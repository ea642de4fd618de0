//! Call-argument preparation
//!
//! Builds the argument bundle every warmup call and the measured call
//! share: resolved resolution, loaded or synthesised conditioning images, the
//! seeded generator and any extra arguments from JSON.

use std::fmt;
use std::path::PathBuf;

use burn::prelude::*;
use burn_models_samplers::Generator;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::GenerationConfig;
use crate::error::{BenchError, Result};
use crate::pipeline::{DiffusionPipeline, PipelineKind};

pub const DEFAULT_GUIDANCE_SCALE: f32 = 7.5;
pub const DEFAULT_STRENGTH: f32 = 0.8;
pub const DEFAULT_CONTROLNET_SCALE: f32 = 1.0;

/// Keyword arguments of a pipeline call
#[derive(Debug, Clone)]
pub struct CallArguments {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub height: usize,
    pub width: usize,
    pub num_inference_steps: usize,
    pub num_images_per_prompt: usize,
    /// Cloned on every call
    pub generator: Option<Generator>,
    /// Input image for image-to-image, or the control image for text-to-image
    pub image: Option<RgbImage>,
    /// Control image when `image` holds the image-to-image input
    pub control_image: Option<RgbImage>,
    pub guidance_scale: f32,
    pub strength: f32,
    pub controlnet_conditioning_scale: f32,
    /// Extra arguments the pipeline does not know
    pub extra: Map<String, Value>,
}

impl CallArguments {
    pub fn new(prompt: impl Into<String>, height: usize, width: usize, num_inference_steps: usize) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            height,
            width,
            num_inference_steps,
            num_images_per_prompt: 1,
            generator: None,
            image: None,
            control_image: None,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            strength: DEFAULT_STRENGTH,
            controlnet_conditioning_scale: DEFAULT_CONTROLNET_SCALE,
            extra: Map::new(),
        }
    }

    /// Apply a JSON object of overrides
    ///
    /// Known keys must have the right type; unknown keys are kept in `extra`.
    pub fn merge_extra(&mut self, extra: &str) -> Result<()> {
        let value: Value = serde_json::from_str(extra).map_err(|e| BenchError::ExtraArguments(e.to_string()))?;
        let Value::Object(map) = value else {
            return Err(BenchError::ExtraArguments("expected a JSON object".into()));
        };

        for (key, value) in map {
            match key.as_str() {
                "prompt" => self.prompt = expect_string(&key, &value)?,
                "negative_prompt" => {
                    self.negative_prompt = match value {
                        Value::Null => None,
                        _ => Some(expect_string(&key, &value)?),
                    }
                }
                "height" => self.height = expect_usize(&key, &value)?,
                "width" => self.width = expect_usize(&key, &value)?,
                "num_inference_steps" => self.num_inference_steps = expect_usize(&key, &value)?,
                "num_images_per_prompt" => self.num_images_per_prompt = expect_usize(&key, &value)?,
                "guidance_scale" => self.guidance_scale = expect_f32(&key, &value)?,
                "strength" => self.strength = expect_f32(&key, &value)?,
                "controlnet_conditioning_scale" => self.controlnet_conditioning_scale = expect_f32(&key, &value)?,
                _ => {
                    self.extra.insert(key, value);
                }
            }
        }
        Ok(())
    }
}

fn type_error(key: &str, expected: &str, value: &Value) -> BenchError {
    BenchError::ExtraArguments(format!("'{key}' must be {expected}, got {value}"))
}

fn expect_string(key: &str, value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| type_error(key, "a string", value))
}

fn expect_usize(key: &str, value: &Value) -> Result<usize> {
    value
        .as_u64()
        .map(|v| v as usize)
        .ok_or_else(|| type_error(key, "a non-negative integer", value))
}

fn expect_f32(key: &str, value: &Value) -> Result<f32> {
    value
        .as_f64()
        .map(|v| v as f32)
        .ok_or_else(|| type_error(key, "a number", value))
}

fn describe_image(image: &Option<RgbImage>) -> String {
    match image {
        Some(image) => format!("<RGB image {}x{}>", image.width(), image.height()),
        None => "None".into(),
    }
}

impl fmt::Display for CallArguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  prompt: {:?}", self.prompt)?;
        writeln!(f, "  negative_prompt: {:?}", self.negative_prompt)?;
        writeln!(f, "  height: {}", self.height)?;
        writeln!(f, "  width: {}", self.width)?;
        writeln!(f, "  num_inference_steps: {}", self.num_inference_steps)?;
        writeln!(f, "  num_images_per_prompt: {}", self.num_images_per_prompt)?;
        match self.generator.as_ref().and_then(Generator::seed) {
            Some(seed) => writeln!(f, "  generator: <seeded {seed}>")?,
            None => writeln!(f, "  generator: None")?,
        }
        writeln!(f, "  guidance_scale: {}", self.guidance_scale)?;
        writeln!(f, "  strength: {}", self.strength)?;
        writeln!(f, "  controlnet_conditioning_scale: {}", self.controlnet_conditioning_scale)?;
        writeln!(f, "  image: {}", describe_image(&self.image))?;
        write!(f, "  control_image: {}", describe_image(&self.control_image))?;
        for (key, value) in &self.extra {
            write!(f, "\n  {key}: {value}")?;
        }
        Ok(())
    }
}

/// Local path of an image reference: a filesystem path or a `file://` URI
pub fn image_path(reference: &str) -> Result<PathBuf> {
    if let Some(path) = reference.strip_prefix("file://") {
        return Ok(PathBuf::from(path));
    }
    if reference.contains("://") {
        return Err(BenchError::InvalidArguments(format!(
            "unsupported image URI '{reference}', expected a path or file:// URI"
        )));
    }
    Ok(PathBuf::from(reference))
}

/// Load an image and resize it to exactly `width` x `height` with Lanczos
/// resampling
pub fn load_image(reference: &str, width: usize, height: usize) -> Result<RgbImage> {
    let path = image_path(reference)?;
    let image = image::open(&path)?.to_rgb8();
    debug!(path = %path.display(), from = ?image.dimensions(), to = ?(width, height), "resizing image");
    Ok(imageops::resize(&image, width as u32, height as u32, FilterType::Lanczos3))
}

/// Black image with a white filled ellipse spanning the middle half of each
/// axis
pub fn placeholder_control_image(width: usize, height: usize) -> RgbImage {
    let (x0, x1) = ((width / 4) as f32, (width / 4 * 3) as f32);
    let (y0, y1) = ((height / 4) as f32, (height / 4 * 3) as f32);
    let (cx, cy) = ((x0 + x1) / 2.0, (y0 + y1) / 2.0);
    let (rx, ry) = (((x1 - x0) / 2.0).max(0.5), ((y1 - y0) / 2.0).max(0.5));

    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let dx = (x as f32 + 0.5 - cx) / rx;
        let dy = (y as f32 + 0.5 - cy) / ry;
        if dx * dx + dy * dy <= 1.0 {
            Rgb([255, 255, 255])
        } else {
            Rgb([0, 0, 0])
        }
    })
}

/// Build the call arguments for `pipeline`
///
/// Explicit height and width win over the pipeline's native resolution, and
/// extras win over both. Images are loaded or synthesised at the final
/// resolution. When a ConditioningAdapter is attached and no control image is
/// given, the placeholder ellipse stands in.
pub fn prepare_inputs<B: Backend>(config: &GenerationConfig, pipeline: &DiffusionPipeline<B>) -> Result<CallArguments> {
    let kind = config.pipeline_kind();
    if kind != pipeline.kind() {
        return Err(BenchError::InvalidArguments(format!(
            "the inputs call for a {kind} pipeline but a {} pipeline was assembled",
            pipeline.kind()
        )));
    }

    let native = pipeline.native_resolution();
    let height = config.height.unwrap_or(native);
    let width = config.width.unwrap_or(native);

    let mut args = CallArguments::new(config.prompt.clone(), height, width, config.steps);
    args.negative_prompt = config.negative_prompt.clone();
    args.num_images_per_prompt = config.batch;
    args.generator = config.seed.map(Generator::seeded);
    if let Some(extra) = config.extra_call_kwargs.as_deref() {
        args.merge_extra(extra)?;
    }
    let (width, height) = (args.width, args.height);

    let control_image = match config.control_image.as_deref() {
        Some(reference) => Some(load_image(reference, width, height)?),
        None if pipeline.controlnet().is_some() => Some(placeholder_control_image(width, height)),
        None => None,
    };

    match kind {
        PipelineKind::ImageToImage => {
            let input = config
                .input_image
                .as_deref()
                .map(|reference| load_image(reference, width, height))
                .transpose()?;
            args.image = input;
            args.control_image = control_image;
        }
        PipelineKind::TextToImage => args.image = control_image,
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capabilities;
    use crate::config::PipelineConfig;
    use crate::loader::assemble_with;
    use crate::reference::{REFERENCE_CONTROLNET, REFERENCE_SD};
    use burn_ndarray::NdArray;

    #[test]
    fn test_placeholder_ellipse() {
        let image = placeholder_control_image(64, 32);
        assert_eq!(image.dimensions(), (64, 32));
        assert_eq!(image.get_pixel(32, 16).0, [255, 255, 255]);
        assert_eq!(image.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(image.get_pixel(10, 16).0, [0, 0, 0]);
        assert_eq!(image.get_pixel(32, 5).0, [0, 0, 0]);
        assert_eq!(image, placeholder_control_image(64, 32));
    }

    #[test]
    fn test_merge_extra() {
        let mut args = CallArguments::new("a cat", 512, 512, 4);
        args.merge_extra(r#"{"guidance_scale": 0.0, "height": 256, "eta": 0.3, "negative_prompt": "blurry"}"#)
            .unwrap();
        assert_eq!(args.guidance_scale, 0.0);
        assert_eq!(args.height, 256);
        assert_eq!(args.negative_prompt.as_deref(), Some("blurry"));
        assert_eq!(args.extra.get("eta"), Some(&serde_json::json!(0.3)));

        let err = args.merge_extra(r#"{"num_inference_steps": "four"}"#).unwrap_err();
        assert!(matches!(err, BenchError::ExtraArguments(_)));
        assert!(matches!(args.merge_extra("[1, 2]"), Err(BenchError::ExtraArguments(_))));
    }

    #[test]
    fn test_image_references() {
        assert_eq!(image_path("file:///tmp/a.png").unwrap(), PathBuf::from("/tmp/a.png"));
        assert_eq!(image_path("input.png").unwrap(), PathBuf::from("input.png"));
        assert!(image_path("https://example.com/a.png").is_err());
    }

    #[test]
    fn test_load_image_resizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.png");
        RgbImage::from_pixel(10, 6, Rgb([10, 200, 30])).save(&path).unwrap();

        let uri = format!("file://{}", path.display());
        let image = load_image(&uri, 32, 16).unwrap();
        assert_eq!(image.dimensions(), (32, 16));
    }

    fn assemble_reference(config: &PipelineConfig) -> DiffusionPipeline<NdArray<f32>> {
        assemble_with(config, &Capabilities::all(), &Default::default()).unwrap()
    }

    fn sized(size: usize) -> GenerationConfig {
        GenerationConfig {
            height: Some(size),
            width: Some(size),
            ..Default::default()
        }
    }

    #[test]
    fn test_extra_resolution_sizes_images() {
        let pipeline = assemble_reference(&PipelineConfig::new(REFERENCE_SD).with_controlnet(REFERENCE_CONTROLNET));
        let mut generation = sized(256);
        generation.extra_call_kwargs = Some(r#"{"height": 128, "width": 128}"#.into());

        let args = prepare_inputs(&generation, &pipeline).unwrap();
        assert_eq!((args.width, args.height), (128, 128));
        assert_eq!(args.image.as_ref().map(RgbImage::dimensions), Some((128, 128)));

        let dir = tempfile::tempdir().unwrap();
        let control = dir.path().join("control.png");
        RgbImage::from_pixel(300, 200, Rgb([9, 9, 9])).save(&control).unwrap();
        generation.control_image = Some(control.to_string_lossy().into_owned());
        generation.extra_call_kwargs = Some(r#"{"width": 64}"#.into());

        let args = prepare_inputs(&generation, &pipeline).unwrap();
        assert_eq!(args.image.as_ref().map(RgbImage::dimensions), Some((64, 256)));
    }

    #[test]
    fn test_input_image_requires_image_to_image_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.png");
        RgbImage::from_pixel(32, 32, Rgb([200, 10, 10])).save(&input).unwrap();

        let mut generation = sized(256);
        generation.input_image = Some(input.to_string_lossy().into_owned());

        let config = PipelineConfig::new(REFERENCE_SD).with_controlnet(REFERENCE_CONTROLNET);
        let text_to_image = assemble_reference(&config);
        let err = prepare_inputs(&generation, &text_to_image).unwrap_err();
        assert!(matches!(err, BenchError::InvalidArguments(_)), "{err}");

        let mut config = config;
        config.kind = PipelineKind::ImageToImage;
        let image_to_image = assemble_reference(&config);
        let args = prepare_inputs(&generation, &image_to_image).unwrap();
        let [r, g, _] = args.image.as_ref().unwrap().get_pixel(0, 0).0;
        assert!(r > 190 && g < 20);
        assert_eq!(args.control_image.as_ref().map(|i| i.get_pixel(128, 128).0), Some([255, 255, 255]));

        // image-to-image without an input image is just as mismatched
        let err = prepare_inputs(&sized(256), &image_to_image).unwrap_err();
        assert!(matches!(err, BenchError::InvalidArguments(_)));
    }

    #[test]
    fn test_display_summary() {
        let mut args = CallArguments::new("a cat", 512, 512, 4);
        args.generator = Some(Generator::seeded(7));
        let summary = args.to_string();
        assert!(summary.contains("prompt: \"a cat\""));
        assert!(summary.contains("generator: <seeded 7>"));
        assert!(summary.contains("control_image: None"));
    }
}
