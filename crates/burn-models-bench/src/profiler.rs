//! Per-step iteration profiling
//!
//! The device runs asynchronously, so host-side callback deltas would measure
//! dispatch rather than execution. Each marker is taken only after the device
//! has drained its queue.

use std::time::{Duration, Instant};

use burn::prelude::*;

use crate::components::{StepCallback, StepEvent};

/// A device-synchronised timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeviceEvent(Instant);

impl DeviceEvent {
    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    /// Time from `earlier` to this event, zero if `earlier` is later
    pub fn since(&self, earlier: DeviceEvent) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }
}

/// Source of device timestamps
pub trait DeviceClock<B: Backend> {
    fn record(&self, device: &B::Device) -> DeviceEvent;
}

/// Waits for all queued work on the device, then reads the host clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncClock;

impl<B: Backend> DeviceClock<B> for SyncClock {
    fn record(&self, device: &B::Device) -> DeviceEvent {
        B::sync(device);
        DeviceEvent(Instant::now())
    }
}

/// Markers collected during one measured call
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProfilerState {
    /// Taken at the end of the first step
    pub begin: Option<DeviceEvent>,
    /// Taken at the end of the latest step
    pub end: Option<DeviceEvent>,
    /// Steps completed after `begin`
    pub num_iterations: usize,
}

impl ProfilerState {
    pub fn elapsed(&self) -> Option<Duration> {
        Some(self.end?.since(self.begin?))
    }

    /// `None` until both markers are set
    pub fn iterations_per_second(&self) -> Option<f64> {
        let elapsed = self.elapsed()?.as_secs_f64();
        (elapsed > 0.0).then(|| self.num_iterations as f64 / elapsed)
    }
}

/// Step callback that records the first and last step markers
#[derive(Debug, Clone, Default)]
pub struct IterationProfiler<C = SyncClock> {
    clock: C,
    state: ProfilerState,
}

impl IterationProfiler<SyncClock> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<C> IterationProfiler<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            state: ProfilerState::default(),
        }
    }

    pub fn state(&self) -> &ProfilerState {
        &self.state
    }

    pub fn into_state(self) -> ProfilerState {
        self.state
    }

    pub fn iterations_per_second(&self) -> Option<f64> {
        self.state.iterations_per_second()
    }
}

impl<B: Backend, C: DeviceClock<B>> StepCallback<B> for IterationProfiler<C> {
    fn on_step_end(&mut self, _event: &StepEvent, device: &B::Device) {
        let event = self.clock.record(device);
        if self.state.begin.is_none() {
            self.state.begin = Some(event);
        } else {
            self.state.end = Some(event);
            self.state.num_iterations += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use std::cell::Cell;

    type TestBackend = NdArray<f32>;

    /// Advances 10ms per record
    struct TickClock {
        base: Instant,
        ticks: Cell<u32>,
    }

    impl<B: Backend> DeviceClock<B> for TickClock {
        fn record(&self, _device: &B::Device) -> DeviceEvent {
            let tick = self.ticks.get();
            self.ticks.set(tick + 1);
            DeviceEvent::at(self.base + Duration::from_millis(10) * tick)
        }
    }

    fn step(profiler: &mut dyn StepCallback<TestBackend>, step: usize) {
        let event = StepEvent {
            step,
            total_steps: 4,
            timestep: 1000 - step * 250,
        };
        profiler.on_step_end(&event, &Default::default());
    }

    #[test]
    fn test_four_steps_count_three() {
        let mut profiler = IterationProfiler::with_clock(TickClock {
            base: Instant::now(),
            ticks: Cell::new(0),
        });
        assert_eq!(profiler.iterations_per_second(), None);

        step(&mut profiler, 0);
        assert_eq!(profiler.state().num_iterations, 0);
        assert_eq!(profiler.iterations_per_second(), None);

        for i in 1..4 {
            step(&mut profiler, i);
        }
        let state = profiler.into_state();
        assert_eq!(state.num_iterations, 3);
        assert_eq!(state.elapsed(), Some(Duration::from_millis(30)));
        let rate = state.iterations_per_second().unwrap();
        assert!((rate - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_sync_clock_is_monotonic() {
        let device = Default::default();
        let a = DeviceClock::<TestBackend>::record(&SyncClock, &device);
        let b = DeviceClock::<TestBackend>::record(&SyncClock, &device);
        assert!(b >= a);
        assert_eq!(a.since(b), Duration::ZERO);
    }
}
