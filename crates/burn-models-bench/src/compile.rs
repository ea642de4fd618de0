//! Compilation strategies
//!
//! Burn dispatches eagerly, so "compiling" a module here means fixing its
//! kernel choices up front and specialising it per input signature: the first
//! call with a new signature traces it (and, when autotuning, times every
//! available attention kernel), later calls replay the recorded choice.
//!
//! | strategy | effect |
//! |---|---|
//! | `none` | passthrough |
//! | `graph-compile` | memory-efficient attention and fused kernels when available, graph capture always |
//! | `trace-compile` | per-module specialisation |
//! | `trace-compile-autotune` | per-module specialisation with attention autotuning |

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use burn::prelude::*;
use burn_models_core::{AttentionConfig, AttentionStrategy, LoraModel, QuantConfig};
use tracing::{debug, info};

use crate::capabilities::{BackendTag, Capabilities};
use crate::components::{Autoencoder, ComputeModule, ConditioningAdapter, Denoiser};
use crate::error::{BenchError, Result};
use crate::pipeline::DiffusionPipeline;
use crate::profiler::{DeviceClock, SyncClock};
use crate::runtime::RuntimeOptions;

/// Chunk size used when graph compilation turns on memory-efficient attention
const MEMORY_EFFICIENT_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompilerStrategy {
    #[default]
    None,
    GraphCompile,
    TraceCompile,
    TraceCompileAutotune,
}

impl CompilerStrategy {
    pub const ALL: [CompilerStrategy; 4] = [
        CompilerStrategy::None,
        CompilerStrategy::GraphCompile,
        CompilerStrategy::TraceCompile,
        CompilerStrategy::TraceCompileAutotune,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CompilerStrategy::None => "none",
            CompilerStrategy::GraphCompile => "graph-compile",
            CompilerStrategy::TraceCompile => "trace-compile",
            CompilerStrategy::TraceCompileAutotune => "trace-compile-autotune",
        }
    }
}

impl fmt::Display for CompilerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompilerStrategy {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        CompilerStrategy::ALL
            .into_iter()
            .find(|strategy| strategy.name() == s.trim())
            .ok_or_else(|| BenchError::UnknownCompiler(s.to_string()))
    }
}

/// Options of the `graph-compile` strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompilationConfig {
    pub enable_memory_efficient_attention: bool,
    pub enable_kernel_fusion: bool,
    /// Keep per-call constants resident; more memory, less host dispatch
    pub enable_graph_capture: bool,
}

impl CompilationConfig {
    /// Enable every optional backend that is available, skipping the rest
    pub fn probe(capabilities: &Capabilities, runtime: &RuntimeOptions) -> Self {
        let enable_memory_efficient_attention = capabilities.has(BackendTag::MemoryEfficientAttention);
        if !enable_memory_efficient_attention {
            info!("memory-efficient attention not available, skip");
        }

        let enable_kernel_fusion = capabilities.has(BackendTag::KernelFusion) && runtime.fusion_enabled();
        if !enable_kernel_fusion {
            info!("kernel fusion not available, skip");
        }

        Self {
            enable_memory_efficient_attention,
            enable_kernel_fusion,
            enable_graph_capture: true,
        }
    }
}

/// Per-module specialisation counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompileStats {
    /// Calls that met a new input signature
    pub traces: usize,
    /// Calls that reused a recorded signature
    pub replays: usize,
    /// Signatures whose attention kernel was chosen by timing
    pub autotuned: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Graph,
    Trace,
    TraceAutotune,
}

/// A module specialised per input signature
pub struct Compiled<M: ?Sized> {
    name: String,
    inner: RefCell<Box<M>>,
    mode: Mode,
    memory_efficient_allowed: bool,
    cache: RefCell<HashMap<Vec<usize>, AttentionConfig>>,
    stats: Cell<CompileStats>,
}

impl<M: ?Sized> Compiled<M> {
    fn wrap<B: Backend>(inner: Box<M>, mode: Mode, memory_efficient_allowed: bool) -> Self
    where
        M: ComputeModule<B>,
    {
        Self {
            name: inner.name().to_string(),
            inner: RefCell::new(inner),
            mode,
            memory_efficient_allowed,
            cache: RefCell::new(HashMap::new()),
            stats: Cell::new(CompileStats::default()),
        }
    }

    pub fn stats(&self) -> CompileStats {
        self.stats.get()
    }

    fn bump(&self, f: impl FnOnce(&mut CompileStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    fn candidates<B: Backend>(&self) -> Vec<AttentionConfig>
    where
        M: ComputeModule<B>,
    {
        let inner = self.inner.borrow();
        let candidates: Vec<AttentionConfig> = inner
            .attention_candidates()
            .into_iter()
            .filter(|c| self.memory_efficient_allowed || c.strategy != AttentionStrategy::MemoryEfficient)
            .collect();
        if candidates.is_empty() {
            vec![inner.attention()]
        } else {
            candidates
        }
    }

    /// Run `forward` under the specialisation recorded for `signature`
    fn specialize<B: Backend, const D: usize>(
        &self,
        signature: Vec<usize>,
        device: &B::Device,
        forward: impl Fn(&M) -> Tensor<B, D>,
    ) -> Tensor<B, D>
    where
        M: ComputeModule<B>,
    {
        let recorded = self.cache.borrow().get(&signature).copied();
        if let Some(attention) = recorded {
            self.bump(|s| s.replays += 1);
            if self.inner.borrow().attention() != attention {
                self.inner.borrow_mut().set_attention(attention);
            }
            return forward(self.inner.borrow().as_ref());
        }

        self.bump(|s| s.traces += 1);
        if self.mode != Mode::TraceAutotune {
            let attention = self.inner.borrow().attention();
            debug!(module = %self.name, ?signature, "traced");
            self.cache.borrow_mut().insert(signature, attention);
            return forward(self.inner.borrow().as_ref());
        }

        let clock = SyncClock;
        let mut best: Option<(Duration, AttentionConfig, Tensor<B, D>)> = None;
        for candidate in self.candidates::<B>() {
            self.inner.borrow_mut().set_attention(candidate);
            let start = DeviceClock::<B>::record(&clock, device);
            let output = forward(self.inner.borrow().as_ref());
            let elapsed = DeviceClock::<B>::record(&clock, device).since(start);
            debug!(module = %self.name, strategy = candidate.strategy.name(), ?elapsed, "autotune candidate");
            if best.as_ref().is_none_or(|(fastest, _, _)| elapsed < *fastest) {
                best = Some((elapsed, candidate, output));
            }
        }

        self.bump(|s| s.autotuned += 1);
        match best {
            Some((_, attention, output)) => {
                info!(module = %self.name, strategy = attention.strategy.name(), "autotuned attention");
                self.inner.borrow_mut().set_attention(attention);
                self.cache.borrow_mut().insert(signature, attention);
                output
            }
            None => forward(self.inner.borrow().as_ref()),
        }
    }

    fn invalidate(&self) {
        self.cache.borrow_mut().clear();
    }
}

impl<B: Backend, M: ComputeModule<B> + ?Sized> ComputeModule<B> for Compiled<M> {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_attention(&mut self, config: AttentionConfig) {
        self.inner.get_mut().set_attention(config);
        self.invalidate();
    }

    fn attention(&self) -> AttentionConfig {
        self.inner.borrow().attention()
    }

    fn attention_candidates(&self) -> Vec<AttentionConfig> {
        self.inner.borrow().attention_candidates()
    }

    fn set_fused_kernels(&mut self, enabled: bool) {
        self.inner.get_mut().set_fused_kernels(enabled);
    }

    fn fused_kernels(&self) -> bool {
        self.inner.borrow().fused_kernels()
    }

    fn set_graph_capture(&mut self, enabled: bool) {
        self.inner.get_mut().set_graph_capture(enabled);
    }

    fn quantize_dynamic(&mut self, config: &QuantConfig) -> usize {
        self.invalidate();
        self.inner.get_mut().quantize_dynamic(config)
    }

    fn compile_stats(&self) -> Option<CompileStats> {
        Some(self.stats())
    }
}

impl<M: ?Sized> Compiled<M> {
    /// Rebuild around a transformed inner module; recorded specialisations
    /// are dropped, counters are kept
    fn map_inner<N: ?Sized>(self, f: impl FnOnce(Box<M>) -> Box<N>) -> Compiled<N> {
        Compiled {
            name: self.name,
            inner: RefCell::new(f(self.inner.into_inner())),
            mode: self.mode,
            memory_efficient_allowed: self.memory_efficient_allowed,
            cache: RefCell::new(HashMap::new()),
            stats: self.stats,
        }
    }
}

impl<B: Backend> Denoiser<B> for Compiled<dyn Denoiser<B>> {
    fn forward(
        &self,
        sample: Tensor<B, 4>,
        timestep: Tensor<B, 1>,
        context: Tensor<B, 3>,
        mid_residual: Option<Tensor<B, 4>>,
    ) -> Tensor<B, 4> {
        let mut signature = sample.dims().to_vec();
        signature.extend(context.dims());
        signature.push(usize::from(mid_residual.is_some()));
        let device = sample.device();
        self.specialize(signature, &device, |inner| {
            inner.forward(sample.clone(), timestep.clone(), context.clone(), mid_residual.clone())
        })
    }

    fn in_channels(&self) -> usize {
        self.inner.borrow().in_channels()
    }

    fn sample_size(&self) -> usize {
        self.inner.borrow().sample_size()
    }

    fn downsample_factor(&self) -> usize {
        self.inner.borrow().downsample_factor()
    }

    fn context_dim(&self) -> usize {
        self.inner.borrow().context_dim()
    }

    fn model_channels(&self) -> usize {
        self.inner.borrow().model_channels()
    }

    fn fuse_lora(&mut self, lora: &LoraModel<B>) -> usize {
        self.invalidate();
        self.inner.get_mut().fuse_lora(lora)
    }

    fn to_device(self: Box<Self>, device: &B::Device) -> Box<dyn Denoiser<B>> {
        Box::new(self.map_inner(|inner| inner.to_device(device)))
    }
}

impl<B: Backend> ConditioningAdapter<B> for Compiled<dyn ConditioningAdapter<B>> {
    fn forward(
        &self,
        sample: Tensor<B, 4>,
        timestep: Tensor<B, 1>,
        context: Tensor<B, 3>,
        control: Tensor<B, 4>,
        scale: f32,
    ) -> Tensor<B, 4> {
        let mut signature = sample.dims().to_vec();
        signature.extend(context.dims());
        signature.extend(control.dims());
        let device = sample.device();
        self.specialize(signature, &device, |inner| {
            inner.forward(sample.clone(), timestep.clone(), context.clone(), control.clone(), scale)
        })
    }

    fn in_channels(&self) -> usize {
        self.inner.borrow().in_channels()
    }

    fn model_channels(&self) -> usize {
        self.inner.borrow().model_channels()
    }

    fn context_dim(&self) -> usize {
        self.inner.borrow().context_dim()
    }

    fn to_device(self: Box<Self>, device: &B::Device) -> Box<dyn ConditioningAdapter<B>> {
        Box::new(self.map_inner(|inner| inner.to_device(device)))
    }
}

/// Leading signature entry separating encoder and decoder specialisations
const ENCODE: usize = 0;
const DECODE: usize = 1;

impl<B: Backend> Autoencoder<B> for Compiled<dyn Autoencoder<B>> {
    fn encode(&self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut signature = vec![ENCODE];
        signature.extend(image.dims());
        let device = image.device();
        self.specialize(signature, &device, |inner| inner.encode(image.clone()))
    }

    fn decode(&self, latent: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut signature = vec![DECODE];
        signature.extend(latent.dims());
        let device = latent.device();
        self.specialize(signature, &device, |inner| inner.decode(latent.clone()))
    }

    fn scale_factor(&self) -> usize {
        self.inner.borrow().scale_factor()
    }

    fn latent_channels(&self) -> usize {
        self.inner.borrow().latent_channels()
    }

    fn scaling_factor(&self) -> f32 {
        self.inner.borrow().scaling_factor()
    }

    fn to_device(self: Box<Self>, device: &B::Device) -> Box<dyn Autoencoder<B>> {
        Box::new(self.map_inner(|inner| inner.to_device(device)))
    }
}

/// Applies a compilation strategy to an assembled pipeline
#[derive(Debug, Clone, Copy)]
pub struct Compiler<'a> {
    capabilities: &'a Capabilities,
    runtime: &'a RuntimeOptions,
}

impl Compiler<'static> {
    /// Compiler reading the process-wide registry and runtime options
    pub fn global() -> Self {
        Self::new(Capabilities::global(), RuntimeOptions::global())
    }
}

impl<'a> Compiler<'a> {
    pub fn new(capabilities: &'a Capabilities, runtime: &'a RuntimeOptions) -> Self {
        Self { capabilities, runtime }
    }

    /// Quantize, disable fusion and compile, in that order
    ///
    /// The quantization precondition is checked before anything is touched.
    pub fn compile<B: Backend>(
        &self,
        mut pipeline: DiffusionPipeline<B>,
        strategy: CompilerStrategy,
        quantize: bool,
        disable_fusion: bool,
    ) -> Result<DiffusionPipeline<B>> {
        if quantize && !pipeline.adapter_backend_active() {
            return Err(BenchError::QuantizationPrecondition);
        }

        if disable_fusion {
            self.runtime.disable_fusion();
        }

        if quantize {
            let converted = pipeline.quantize_dynamic(&QuantConfig::int8_dynamic());
            info!(layers = converted, "int8 dynamic quantization");
        }

        let pipeline = match strategy {
            CompilerStrategy::None => return Ok(pipeline),
            CompilerStrategy::GraphCompile => {
                let config = CompilationConfig::probe(self.capabilities, self.runtime);
                info!(?config, "graph compilation");
                self.wrap_all(pipeline, Mode::Graph, Setup::from(config))
            }
            CompilerStrategy::TraceCompile | CompilerStrategy::TraceCompileAutotune => {
                let mode = if strategy == CompilerStrategy::TraceCompile {
                    Mode::Trace
                } else {
                    Mode::TraceAutotune
                };
                let fused = self.capabilities.has(BackendTag::KernelFusion) && self.runtime.fusion_enabled();
                info!(%strategy, fused, "trace compilation");
                let setup = Setup {
                    attention: None,
                    fused_kernels: fused,
                    graph_capture: false,
                };
                self.wrap_all(pipeline, mode, setup)
            }
        };

        self.runtime.seal();
        Ok(pipeline)
    }

    fn wrap_all<B: Backend>(&self, pipeline: DiffusionPipeline<B>, mode: Mode, setup: Setup) -> DiffusionPipeline<B> {
        let allowed = self.capabilities.has(BackendTag::MemoryEfficientAttention);
        pipeline
            .map_denoiser(|mut denoiser| {
                setup.apply::<B, _>(denoiser.as_mut());
                Box::new(Compiled::wrap::<B>(denoiser, mode, allowed))
            })
            .map_controlnet(|mut controlnet| {
                setup.apply::<B, _>(controlnet.as_mut());
                Box::new(Compiled::wrap::<B>(controlnet, mode, allowed))
            })
            .map_vae(|mut vae| {
                setup.apply::<B, _>(vae.as_mut());
                Box::new(Compiled::wrap::<B>(vae, mode, allowed))
            })
    }
}

/// Hook settings applied to every module before it is wrapped
#[derive(Debug, Clone, Copy)]
struct Setup {
    attention: Option<AttentionConfig>,
    fused_kernels: bool,
    graph_capture: bool,
}

impl From<CompilationConfig> for Setup {
    fn from(config: CompilationConfig) -> Self {
        Self {
            attention: config
                .enable_memory_efficient_attention
                .then(|| AttentionConfig::memory_efficient(MEMORY_EFFICIENT_CHUNK)),
            fused_kernels: config.enable_kernel_fusion,
            graph_capture: config.enable_graph_capture,
        }
    }
}

impl Setup {
    fn apply<B: Backend, M: ComputeModule<B> + ?Sized>(&self, module: &mut M) {
        debug!(module = module.name(), ?self, "compiling");
        if let Some(attention) = self.attention {
            module.set_attention(attention);
        }
        module.set_fused_kernels(self.fused_kernels);
        if self.graph_capture {
            module.set_graph_capture(true);
        }
    }
}

/// Compile `pipeline` with the process-wide registry and runtime options
pub fn compile<B: Backend>(
    pipeline: DiffusionPipeline<B>,
    strategy: CompilerStrategy,
    quantize: bool,
    disable_fusion: bool,
) -> Result<DiffusionPipeline<B>> {
    Compiler::global().compile(pipeline, strategy, quantize, disable_fusion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{ReferenceUNet, SeededWeights, UNetConfig};
    use burn_models_core::PrecisionMode;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn unet() -> Box<dyn Denoiser<TestBackend>> {
        let mut source = SeededWeights::new("compile-unet", PrecisionMode::Fp32);
        Box::new(ReferenceUNet::new(UNetConfig::default(), &mut source, &Default::default()).unwrap())
    }

    fn inputs(batch: usize) -> (Tensor<TestBackend, 4>, Tensor<TestBackend, 1>, Tensor<TestBackend, 3>) {
        let device = Default::default();
        (
            Tensor::ones([batch, 4, 8, 8], &device) * 0.5,
            Tensor::full([batch], 500.0, &device),
            Tensor::ones([batch, 16, 32], &device) * 0.1,
        )
    }

    #[test]
    fn test_strategy_names() {
        for strategy in CompilerStrategy::ALL {
            assert_eq!(strategy.to_string().parse::<CompilerStrategy>().unwrap(), strategy);
        }
        assert_eq!("none".parse::<CompilerStrategy>().unwrap(), CompilerStrategy::default());
        let err = "sfast".parse::<CompilerStrategy>().unwrap_err();
        assert!(matches!(err, BenchError::UnknownCompiler(name) if name == "sfast"));
    }

    #[test]
    fn test_probe_skips_missing_backends() {
        let runtime = RuntimeOptions::new();
        let config = CompilationConfig::probe(&Capabilities::default(), &runtime);
        assert!(!config.enable_memory_efficient_attention);
        assert!(!config.enable_kernel_fusion);
        assert!(config.enable_graph_capture);

        let config = CompilationConfig::probe(&Capabilities::all(), &runtime);
        assert!(config.enable_memory_efficient_attention);
        assert!(config.enable_kernel_fusion);

        runtime.disable_fusion();
        let config = CompilationConfig::probe(&Capabilities::all(), &runtime);
        assert!(!config.enable_kernel_fusion);
    }

    #[test]
    fn test_trace_then_replay() {
        let compiled = Compiled::wrap::<TestBackend>(unet(), Mode::Trace, true);
        let (x, t, ctx) = inputs(1);

        let first = compiled.forward(x.clone(), t.clone(), ctx.clone(), None);
        let second = compiled.forward(x.clone(), t.clone(), ctx.clone(), None);
        let stats = compiled.stats();
        assert_eq!((stats.traces, stats.replays, stats.autotuned), (1, 1, 0));

        let diff: f32 = (first - second).abs().max().into_scalar().elem();
        assert_eq!(diff, 0.0);

        let (x, t, ctx) = inputs(2);
        compiled.forward(x, t, ctx, None);
        assert_eq!(compiled.stats().traces, 2);
    }

    #[test]
    fn test_autotune_respects_capabilities() {
        let compiled = Compiled::wrap::<TestBackend>(unet(), Mode::TraceAutotune, false);
        let (x, t, ctx) = inputs(1);

        compiled.forward(x.clone(), t.clone(), ctx.clone(), None);
        compiled.forward(x, t, ctx, None);
        let stats = compiled.stats();
        assert_eq!((stats.traces, stats.replays, stats.autotuned), (1, 1, 1));
        assert_ne!(
            ComputeModule::<TestBackend>::attention(&compiled).strategy,
            AttentionStrategy::MemoryEfficient
        );
    }

    #[test]
    fn test_reconfiguring_drops_specialisations() {
        let mut compiled = Compiled::wrap::<TestBackend>(unet(), Mode::Trace, true);
        let (x, t, ctx) = inputs(1);
        compiled.forward(x.clone(), t.clone(), ctx.clone(), None);

        ComputeModule::<TestBackend>::set_attention(&mut compiled, AttentionConfig::memory_efficient(4));
        compiled.forward(x, t, ctx, None);
        assert_eq!(compiled.stats().traces, 2);
        assert_eq!(
            ComputeModule::<TestBackend>::compile_stats(&compiled).map(|s| s.replays),
            Some(0)
        );
    }

    #[test]
    fn test_graph_config_applies_hooks() {
        let mut denoiser = unet();
        let config = CompilationConfig {
            enable_memory_efficient_attention: true,
            enable_kernel_fusion: true,
            enable_graph_capture: true,
        };
        Setup::from(config).apply::<TestBackend, _>(denoiser.as_mut());
        assert_eq!(denoiser.attention(), AttentionConfig::memory_efficient(MEMORY_EFFICIENT_CHUNK));
        assert!(denoiser.fused_kernels());

        let mut denoiser = unet();
        Setup::from(CompilationConfig::default()).apply::<TestBackend, _>(denoiser.as_mut());
        assert_eq!(denoiser.attention(), AttentionConfig::standard());
        assert!(!denoiser.fused_kernels());
    }
}
