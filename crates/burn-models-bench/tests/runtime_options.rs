//! The fusion toggle is process-wide, so it gets a test binary of its own

use burn_models_bench::reference::REFERENCE_SD;
use burn_models_bench::{Capabilities, Compiler, CompilerStrategy, PipelineConfig, RuntimeOptions, assemble_with};
use burn_ndarray::NdArray;

type TestBackend = NdArray<f32>;

#[test]
fn test_disable_fusion_reaches_later_compilations() {
    let caps = Capabilities::all();
    let runtime = RuntimeOptions::global();
    let compiler = Compiler::new(&caps, runtime);
    let config = PipelineConfig::new(REFERENCE_SD);

    let pipeline = assemble_with::<TestBackend>(&config, &caps, &Default::default()).unwrap();
    let fused = compiler
        .compile(pipeline, CompilerStrategy::TraceCompile, false, false)
        .unwrap();
    assert!(fused.denoiser().fused_kernels());
    assert!(runtime.is_sealed());

    let pipeline = assemble_with::<TestBackend>(&config, &caps, &Default::default()).unwrap();
    let unfused = compiler
        .compile(pipeline, CompilerStrategy::TraceCompile, false, true)
        .unwrap();
    assert!(!runtime.fusion_enabled());
    assert!(!unfused.denoiser().fused_kernels());
    assert!(!unfused.vae().fused_kernels());

    // no way back
    let pipeline = assemble_with::<TestBackend>(&config, &caps, &Default::default()).unwrap();
    let again = compiler
        .compile(pipeline, CompilerStrategy::GraphCompile, false, false)
        .unwrap();
    assert!(!again.denoiser().fused_kernels());

    // modules compiled before the toggle keep their kernels
    assert!(fused.denoiser().fused_kernels());
}
