//! Diffusion schedulers for burn-models
//!
//! Every scheduler implements [`Scheduler`], is built from a
//! [`SchedulerConfig`] and draws any noise it needs from a seeded
//! [`Generator`]. [`create_scheduler`] looks schedulers up by their
//! Diffusers class name.
//!
//! # Available Schedulers
//!
//! - `EulerDiscreteScheduler` - [`EulerDiscreteScheduler`]
//! - `EulerAncestralDiscreteScheduler` - [`EulerAncestralDiscreteScheduler`]
//! - `DDIMScheduler` - [`DdimScheduler`]
//! - `LCMScheduler` - [`LcmScheduler`], for LCM-distilled models and LCM-LoRA

pub mod ddim;
pub mod euler;
pub mod generator;
pub mod lcm;
pub mod registry;
pub mod scheduler;

pub use ddim::DdimScheduler;
pub use euler::{EulerAncestralDiscreteScheduler, EulerDiscreteScheduler};
pub use generator::Generator;
pub use lcm::LcmScheduler;
pub use registry::{SCHEDULER_NAMES, canonical_name, create_scheduler};
pub use scheduler::{
    BetaSchedule, NoiseSchedule, PredictionType, Scheduler, SchedulerConfig, TimestepSpacing, Timesteps,
    get_ancestral_step, spaced_timesteps, to_epsilon, to_sample,
};
