//! Assemble, compile and run the reference pipelines end to end

use burn::prelude::*;
use burn_models_bench::reference::{REFERENCE_CONTROLNET, REFERENCE_LCM_LORA, REFERENCE_SD, find_builtin};
use burn_models_bench::repository::{ExportOptions, MODEL_WEIGHTS, export_builtin};
use burn_models_bench::{
    BackendTag, BenchError, Benchmark, Capabilities, Compiler, CompilerStrategy, ComputeModule, DiffusionPipeline,
    GenerationConfig, PipelineConfig, PipelineKind, RunPhase, RuntimeOptions, assemble_with, prepare_inputs, run,
};
use burn_models_convert::StorageDtype;
use burn_ndarray::NdArray;
use image::{Rgb, RgbImage};

type TestBackend = NdArray<f32>;

fn generation(size: usize, steps: usize) -> GenerationConfig {
    GenerationConfig {
        steps,
        height: Some(size),
        width: Some(size),
        seed: Some(42),
        ..Default::default()
    }
}

fn assemble(config: &PipelineConfig) -> DiffusionPipeline<TestBackend> {
    assemble_with::<TestBackend>(config, &Capabilities::all(), &Default::default()).unwrap()
}

#[test]
fn test_launch_defaults_produce_requested_image() {
    let pipeline = assemble(&PipelineConfig::new(REFERENCE_SD));
    let args = prepare_inputs(&generation(512, 4), &pipeline).unwrap();

    let measurement = run(&pipeline, &args, 3).unwrap();
    assert_eq!(measurement.images.len(), 1);
    assert_eq!(measurement.images[0].dimensions(), (512, 512));
    assert_eq!(measurement.warmup.map(|w| w.iterations), Some(3));
    assert!(measurement.elapsed.as_secs_f64() > 0.0);

    // one callback per step, the first only sets the start marker
    assert_eq!(measurement.profiler.num_iterations, 3);
    let rate = measurement.iterations_per_second().unwrap();
    assert!(rate > 0.0);
    let elapsed = measurement.profiler.elapsed().unwrap().as_secs_f64();
    assert!((rate - 3.0 / elapsed).abs() < 1e-6 * rate);
}

#[test]
fn test_uncompiled_runs_are_bit_identical() {
    let pipeline = assemble(&PipelineConfig::new(REFERENCE_SD));
    let args = prepare_inputs(&generation(256, 3), &pipeline).unwrap();

    let first = run(&pipeline, &args, 0).unwrap();
    let second = run(&pipeline, &args, 1).unwrap();
    assert_eq!(first.images, second.images);
}

#[test]
fn test_trace_compile_replays_after_first_call() {
    let caps = Capabilities::all();
    let runtime = RuntimeOptions::new();
    let pipeline = assemble(&PipelineConfig::new(REFERENCE_SD));
    let pipeline = Compiler::new(&caps, &runtime)
        .compile(pipeline, CompilerStrategy::TraceCompile, false, false)
        .unwrap();
    assert!(runtime.is_sealed());

    let args = prepare_inputs(&generation(256, 2), &pipeline).unwrap();
    let measurement = run(&pipeline, &args, 2).unwrap();
    assert_eq!(measurement.images[0].dimensions(), (256, 256));

    // 3 calls of 2 steps, one input signature
    let unet = pipeline.denoiser().compile_stats().unwrap();
    assert_eq!((unet.traces, unet.replays), (1, 5));
    let vae = pipeline.vae().compile_stats().unwrap();
    assert_eq!((vae.traces, vae.replays), (1, 2));
}

#[test]
fn test_graph_compile_enables_available_backends() {
    let caps = Capabilities::from_tags([BackendTag::MemoryEfficientAttention, BackendTag::AdapterFusion]);
    let runtime = RuntimeOptions::new();
    let pipeline = assemble(&PipelineConfig::new(REFERENCE_SD));
    let pipeline = Compiler::new(&caps, &runtime)
        .compile(pipeline, CompilerStrategy::GraphCompile, false, false)
        .unwrap();

    let denoiser = pipeline.denoiser();
    assert_eq!(denoiser.attention().strategy, burn_models_core::AttentionStrategy::MemoryEfficient);
    assert!(!denoiser.fused_kernels());
    assert!(denoiser.compile_stats().is_some());

    let args = prepare_inputs(&generation(256, 2), &pipeline).unwrap();
    assert_eq!(run(&pipeline, &args, 0).unwrap().images.len(), 1);
}

#[test]
fn test_autotune_compiles_every_module() {
    let caps = Capabilities::all();
    let runtime = RuntimeOptions::new();
    let pipeline = assemble(&PipelineConfig::new(REFERENCE_SD).with_controlnet(REFERENCE_CONTROLNET));
    let pipeline = Compiler::new(&caps, &runtime)
        .compile(pipeline, CompilerStrategy::TraceCompileAutotune, false, false)
        .unwrap();

    let args = prepare_inputs(&generation(256, 2), &pipeline).unwrap();
    run(&pipeline, &args, 1).unwrap();

    let controlnet = pipeline.controlnet().and_then(|c| c.compile_stats()).unwrap();
    assert_eq!(controlnet.autotuned, 1);
    assert_eq!(pipeline.denoiser().compile_stats().unwrap().autotuned, 1);
}

#[test]
fn test_quantize_requires_adapter_backend() {
    let runtime = RuntimeOptions::new();
    let without = Capabilities::from_tags([BackendTag::MemoryEfficientAttention]);
    let pipeline =
        assemble_with::<TestBackend>(&PipelineConfig::new(REFERENCE_SD), &without, &Default::default()).unwrap();
    assert!(!pipeline.adapter_backend_active());

    let err = Compiler::new(&without, &runtime)
        .compile(pipeline, CompilerStrategy::GraphCompile, true, false)
        .err()
        .unwrap();
    assert!(matches!(err, BenchError::QuantizationPrecondition));
    assert!(!runtime.is_sealed());

    let caps = Capabilities::all();
    let pipeline = assemble(&PipelineConfig::new(REFERENCE_SD));
    let pipeline = Compiler::new(&caps, &runtime)
        .compile(pipeline, CompilerStrategy::None, true, false)
        .unwrap();
    let args = prepare_inputs(&generation(256, 2), &pipeline).unwrap();
    assert_eq!(run(&pipeline, &args, 0).unwrap().images.len(), 1);
}

#[test]
fn test_placeholder_control_image_only_with_controlnet() {
    let plain = assemble(&PipelineConfig::new(REFERENCE_SD));
    let args = prepare_inputs(&generation(256, 2), &plain).unwrap();
    assert!(args.image.is_none());
    assert!(args.control_image.is_none());

    let controlled = assemble(&PipelineConfig::new(REFERENCE_SD).with_controlnet(REFERENCE_CONTROLNET));
    let args = prepare_inputs(&generation(256, 2), &controlled).unwrap();
    let control = args.image.as_ref().unwrap();
    assert_eq!(control.dimensions(), (256, 256));
    assert_eq!(control.get_pixel(128, 128).0, [255, 255, 255]);
    assert_eq!(control.get_pixel(2, 2).0, [0, 0, 0]);
    assert!(args.control_image.is_none());

    let measurement = run(&controlled, &args, 0).unwrap();
    assert_eq!(measurement.images[0].dimensions(), (256, 256));
}

#[test]
fn test_image_to_image_with_controlnet() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.png");
    RgbImage::from_fn(100, 60, |x, y| Rgb([(x * 2) as u8, (y * 4) as u8, 128]))
        .save(&input)
        .unwrap();

    let mut generation = generation(256, 3);
    generation.input_image = Some(input.to_string_lossy().into_owned());

    let mut config = PipelineConfig::new(REFERENCE_SD).with_controlnet(REFERENCE_CONTROLNET);
    config.kind = generation.pipeline_kind();
    assert_eq!(config.kind, PipelineKind::ImageToImage);

    let pipeline = assemble(&config);
    let args = prepare_inputs(&generation, &pipeline).unwrap();
    assert_eq!(args.image.as_ref().map(|i| i.dimensions()), Some((256, 256)));
    assert_eq!(args.control_image.as_ref().map(|i| i.dimensions()), Some((256, 256)));

    let measurement = run(&pipeline, &args, 1).unwrap();
    assert_eq!(measurement.images[0].dimensions(), (256, 256));
}

#[test]
fn test_exported_directory_with_variant() {
    let dir = tempfile::tempdir().unwrap();
    let options = ExportOptions {
        variant: Some("fp16".into()),
        dtype: StorageDtype::F16,
    };
    let builtin = find_builtin(REFERENCE_SD).unwrap();
    export_builtin::<TestBackend>(builtin, dir.path(), &options, &Default::default()).unwrap();

    let mut config = PipelineConfig::new(dir.path().to_string_lossy());
    config.variant = Some("fp16".into());
    let pipeline = assemble(&config);
    assert_eq!(pipeline.native_resolution(), 512);
    assert_eq!(pipeline.scheduler().name(), "DDIMScheduler");
    assert!(pipeline.safety_checker().is_none());

    config.variant = Some("bf16".into());
    let err = assemble_with::<TestBackend>(&config, &Capabilities::all(), &Default::default())
        .err()
        .unwrap();
    assert!(matches!(err, BenchError::ModelConfig { .. }), "{err}");
}

#[test]
fn test_controlnet_from_single_file_and_directory() {
    let dir = tempfile::tempdir().unwrap();
    let builtin = find_builtin(REFERENCE_CONTROLNET).unwrap();
    export_builtin::<TestBackend>(builtin, dir.path(), &ExportOptions::default(), &Default::default()).unwrap();

    let file = dir.path().join(format!("{MODEL_WEIGHTS}.safetensors"));
    let pipeline = assemble(&PipelineConfig::new(REFERENCE_SD).with_controlnet(file.to_string_lossy()));
    assert_eq!(pipeline.controlnet().map(|c| c.model_channels()), Some(16));

    let pipeline = assemble(&PipelineConfig::new(REFERENCE_SD).with_controlnet(dir.path().to_string_lossy()));
    assert!(pipeline.controlnet().is_some());

    let err = assemble_with::<TestBackend>(
        &PipelineConfig::new(REFERENCE_SD).with_controlnet(REFERENCE_SD),
        &Capabilities::all(),
        &Default::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, BenchError::IncompatibleComponent { .. }));
}

#[test]
fn test_lora_is_fused_into_denoiser() {
    let device = Default::default();
    let plain = assemble(&PipelineConfig::new(REFERENCE_SD));
    let fused = assemble(&PipelineConfig::new(REFERENCE_SD).with_lora(REFERENCE_LCM_LORA));
    assert!(fused.adapter_backend_active());

    let sample = Tensor::<TestBackend, 4>::ones([1, 4, 8, 8], &device) * 0.3;
    let timestep = Tensor::<TestBackend, 1>::full([1], 500.0, &device);
    let context = Tensor::<TestBackend, 3>::ones([1, 16, 32], &device) * 0.1;

    let a = plain.denoiser().forward(sample.clone(), timestep.clone(), context.clone(), None);
    let b = fused.denoiser().forward(sample, timestep, context, None);
    let diff: f32 = (a - b).abs().max().into_scalar().elem();
    assert!(diff > 0.0);

    let without = Capabilities::from_tags([BackendTag::MemoryEfficientAttention]);
    let err = assemble_with::<TestBackend>(
        &PipelineConfig::new(REFERENCE_SD).with_lora(REFERENCE_LCM_LORA),
        &without,
        &device,
    )
    .err()
    .unwrap();
    assert!(matches!(err, BenchError::AdapterBackendUnavailable));
}

#[test]
fn test_scheduler_override() {
    let pipeline = assemble(&PipelineConfig::new(REFERENCE_SD).with_scheduler("lcm"));
    assert_eq!(pipeline.scheduler().name(), "LCMScheduler");

    let err = assemble_with::<TestBackend>(
        &PipelineConfig::new(REFERENCE_SD).with_scheduler("PNDMScheduler"),
        &Capabilities::all(),
        &Default::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, BenchError::UnsupportedScheduler { ref name, .. } if name == "PNDMScheduler"));
}

#[test]
fn test_unresolvable_model() {
    let err = assemble_with::<TestBackend>(
        &PipelineConfig::new("no-such-model-anywhere"),
        &Capabilities::all(),
        &Default::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, BenchError::UnresolvableModel(_)));
}

#[test]
fn test_benchmark_phases() {
    let pipeline = assemble(&PipelineConfig::new(REFERENCE_SD));
    let args = prepare_inputs(&generation(256, 2), &pipeline).unwrap();

    let mut benchmark = Benchmark::new(&pipeline, &args);
    assert_eq!(benchmark.phase(), RunPhase::Idle);

    let mut seen = Vec::new();
    let report = benchmark.warmup_with(2, |i, _| seen.push(i)).unwrap();
    assert_eq!(seen, vec![0, 1]);
    assert_eq!(report.iterations, 2);
    assert_eq!(benchmark.phase(), RunPhase::Warming);

    let err = benchmark.warmup(1).unwrap_err();
    assert!(matches!(err, BenchError::InvalidPhase { phase: RunPhase::Warming, .. }));

    benchmark.measure().unwrap();
    assert_eq!(benchmark.phase(), RunPhase::Done);
    assert!(matches!(benchmark.measure(), Err(BenchError::InvalidPhase { .. })));
}

#[test]
fn test_custom_pipeline_is_timed_without_profiler() {
    let mut config = PipelineConfig::new(REFERENCE_SD);
    config.custom_pipeline = Some("lpw_stable_diffusion".into());
    let pipeline = assemble(&config);
    assert_eq!(pipeline.custom_pipeline(), Some("lpw_stable_diffusion"));
    assert!(!pipeline.accepts_step_callback());

    let args = prepare_inputs(&generation(256, 2), &pipeline).unwrap();
    let measurement = run(&pipeline, &args, 0).unwrap();
    assert_eq!(measurement.iterations_per_second(), None);
    assert!(measurement.elapsed.as_nanos() > 0);
}

#[test]
fn test_extra_arguments_override_defaults() {
    let pipeline = assemble(&PipelineConfig::new(REFERENCE_SD));
    let mut generation = generation(256, 2);
    generation.extra_call_kwargs = Some(r#"{"guidance_scale": 0.0, "num_inference_steps": 3}"#.into());

    let args = prepare_inputs(&generation, &pipeline).unwrap();
    assert_eq!(args.guidance_scale, 0.0);
    assert_eq!(args.num_inference_steps, 3);

    let measurement = run(&pipeline, &args, 0).unwrap();
    assert_eq!(measurement.profiler.num_iterations, 2);
}

#[test]
fn test_extra_resolution_runs_with_controlnet() {
    let pipeline = assemble(&PipelineConfig::new(REFERENCE_SD).with_controlnet(REFERENCE_CONTROLNET));
    let mut generation = generation(256, 2);
    generation.extra_call_kwargs = Some(r#"{"height": 128, "width": 128}"#.into());

    let args = prepare_inputs(&generation, &pipeline).unwrap();
    let measurement = run(&pipeline, &args, 0).unwrap();
    assert_eq!(measurement.images[0].dimensions(), (128, 128));
}

#[test]
fn test_extra_resolution_runs_image_to_image() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.png");
    RgbImage::from_pixel(40, 40, Rgb([90, 120, 30])).save(&input).unwrap();

    let mut generation = generation(256, 2);
    generation.input_image = Some(input.to_string_lossy().into_owned());
    generation.extra_call_kwargs = Some(r#"{"width": 128}"#.into());

    let mut config = PipelineConfig::new(REFERENCE_SD).with_controlnet(REFERENCE_CONTROLNET);
    config.kind = generation.pipeline_kind();
    let pipeline = assemble(&config);

    let args = prepare_inputs(&generation, &pipeline).unwrap();
    let measurement = run(&pipeline, &args, 0).unwrap();
    assert_eq!(measurement.images[0].dimensions(), (128, 256));
}

#[test]
fn test_mismatched_image_size_is_rejected() {
    let pipeline = assemble(&PipelineConfig::new(REFERENCE_SD).with_controlnet(REFERENCE_CONTROLNET));
    let mut args = prepare_inputs(&generation(256, 2), &pipeline).unwrap();
    args.height = 128;
    args.width = 128;

    let err = run(&pipeline, &args, 0).unwrap_err();
    assert!(matches!(err, BenchError::InvalidArguments(_)), "{err}");
}
