//! Scheduler lookup by name
//!
//! Names follow the Diffusers class names so `scheduler_config.json` files
//! and command lines written for Diffusers resolve unchanged. Short aliases
//! are accepted case-insensitively.

use burn::prelude::*;

use crate::ddim::DdimScheduler;
use crate::euler::{EulerAncestralDiscreteScheduler, EulerDiscreteScheduler};
use crate::lcm::LcmScheduler;
use crate::scheduler::{Scheduler, SchedulerConfig};

/// Canonical names of every registered scheduler
pub const SCHEDULER_NAMES: &[&str] = &[
    "EulerDiscreteScheduler",
    "EulerAncestralDiscreteScheduler",
    "DDIMScheduler",
    "LCMScheduler",
];

/// Resolve a scheduler name or alias to its canonical name
pub fn canonical_name(name: &str) -> Option<&'static str> {
    let lower = name.trim().to_ascii_lowercase().replace(['-', '_'], "");
    let canonical = match lower.as_str() {
        "eulerdiscretescheduler" | "euler" => "EulerDiscreteScheduler",
        "eulerancestraldiscretescheduler" | "eulerancestral" | "eulera" => "EulerAncestralDiscreteScheduler",
        "ddimscheduler" | "ddim" => "DDIMScheduler",
        "lcmscheduler" | "lcm" => "LCMScheduler",
        _ => return None,
    };
    Some(canonical)
}

/// Instantiate a scheduler from an existing configuration
///
/// Returns `None` for unknown names. The configuration is carried over
/// unchanged, so swapping schedulers keeps the model's training schedule.
pub fn create_scheduler<B: Backend>(name: &str, config: &SchedulerConfig) -> Option<Box<dyn Scheduler<B>>> {
    let config = config.clone();
    let scheduler: Box<dyn Scheduler<B>> = match canonical_name(name)? {
        "EulerDiscreteScheduler" => Box::new(EulerDiscreteScheduler::new(config)),
        "EulerAncestralDiscreteScheduler" => Box::new(EulerAncestralDiscreteScheduler::new(config)),
        "DDIMScheduler" => Box::new(DdimScheduler::new(config)),
        "LCMScheduler" => Box::new(LcmScheduler::new(config)),
        _ => return None,
    };
    Some(scheduler)
}
