//! Warmup and measured runs
//!
//! A [`Benchmark`] owns one set of call arguments and moves through
//! `idle -> warming -> measuring -> done`. Every call, warmup or measured,
//! uses the same arguments, so the seeded generator replays the same noise.

use std::fmt;
use std::time::{Duration, Instant};

use burn::prelude::*;
use image::RgbImage;
use tracing::{debug, info};

use crate::components::StepCallback;
use crate::error::{BenchError, Result};
use crate::inputs::CallArguments;
use crate::pipeline::DiffusionPipeline;
use crate::profiler::{IterationProfiler, ProfilerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Warming,
    Measuring,
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunPhase::Idle => "idle",
            RunPhase::Warming => "warming up",
            RunPhase::Measuring => "measuring",
            RunPhase::Done => "done",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WarmupReport {
    pub iterations: usize,
    pub elapsed: Duration,
}

/// Result of the measured call
#[derive(Debug, Clone)]
pub struct Measurement {
    pub images: Vec<RgbImage>,
    pub nsfw_content_detected: Option<Vec<bool>>,
    /// Default when the pipeline takes no step callback
    pub profiler: ProfilerState,
    /// Wall-clock time of the measured call
    pub elapsed: Duration,
    pub warmup: Option<WarmupReport>,
}

impl Measurement {
    pub fn iterations_per_second(&self) -> Option<f64> {
        self.profiler.iterations_per_second()
    }
}

pub struct Benchmark<'a, B: Backend> {
    pipeline: &'a DiffusionPipeline<B>,
    args: &'a CallArguments,
    phase: RunPhase,
    warmup: Option<WarmupReport>,
}

impl<'a, B: Backend> Benchmark<'a, B> {
    pub fn new(pipeline: &'a DiffusionPipeline<B>, args: &'a CallArguments) -> Self {
        Self {
            pipeline,
            args,
            phase: RunPhase::Idle,
            warmup: None,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn expect_phase(&self, action: &'static str, allowed: &[RunPhase]) -> Result<()> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(BenchError::InvalidPhase {
                action,
                phase: self.phase,
            })
        }
    }

    pub fn warmup(&mut self, count: usize) -> Result<WarmupReport> {
        self.warmup_with(count, |_, _| {})
    }

    /// Run `count` unmeasured calls, reporting each to `observer` with its
    /// index and duration
    pub fn warmup_with(&mut self, count: usize, mut observer: impl FnMut(usize, Duration)) -> Result<WarmupReport> {
        self.expect_phase("warm up", &[RunPhase::Idle])?;
        self.phase = RunPhase::Warming;

        let start = Instant::now();
        for i in 0..count {
            let call_start = Instant::now();
            self.pipeline.call(self.args, None)?;
            let elapsed = call_start.elapsed();
            debug!(iteration = i, ?elapsed, "warmup call");
            observer(i, elapsed);
        }

        let report = WarmupReport {
            iterations: count,
            elapsed: start.elapsed(),
        };
        info!(iterations = count, elapsed = ?report.elapsed, "warmup finished");
        self.warmup = Some(report);
        Ok(report)
    }

    /// The measured call, profiled per step when the pipeline allows it
    pub fn measure(&mut self) -> Result<Measurement> {
        self.expect_phase("measure", &[RunPhase::Idle, RunPhase::Warming])?;
        self.phase = RunPhase::Measuring;

        let mut profiler = IterationProfiler::new();
        let callback: Option<&mut dyn StepCallback<B>> = if self.pipeline.accepts_step_callback() {
            Some(&mut profiler)
        } else {
            info!("pipeline takes no step callback, timing the call only");
            None
        };

        let start = Instant::now();
        let output = self.pipeline.call(self.args, callback)?;
        let elapsed = start.elapsed();
        self.phase = RunPhase::Done;

        let measurement = Measurement {
            images: output.images,
            nsfw_content_detected: output.nsfw_content_detected,
            profiler: profiler.into_state(),
            elapsed,
            warmup: self.warmup,
        };
        info!(
            ?elapsed,
            iterations = measurement.profiler.num_iterations,
            it_per_s = ?measurement.iterations_per_second(),
            "measured call finished"
        );
        Ok(measurement)
    }
}

/// Warm up `warmups` times, then measure once
pub fn run<B: Backend>(pipeline: &DiffusionPipeline<B>, args: &CallArguments, warmups: usize) -> Result<Measurement> {
    let mut benchmark = Benchmark::new(pipeline, args);
    benchmark.warmup(warmups)?;
    benchmark.measure()
}
