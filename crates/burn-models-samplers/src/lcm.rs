//! LCM (Latent Consistency Model) scheduler
//!
//! A distillation-based scheduler that produces usable images in 1-8 steps.
//! Each step predicts a consistency-model estimate of x0 and, except on the
//! last step, re-noises it to the next timestep with fresh noise.

use burn::prelude::*;
use tracing::warn;

use crate::generator::Generator;
use crate::scheduler::{NoiseSchedule, Scheduler, SchedulerConfig, Timesteps, add_noise_alpha, to_sample};

/// Consistency-model boundary condition scaling
const SIGMA_DATA: f64 = 0.5;

/// LCM scheduler
#[derive(Debug, Clone)]
pub struct LcmScheduler {
    config: SchedulerConfig,
    schedule: NoiseSchedule,
}

impl LcmScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let schedule = NoiseSchedule::from_config(&config);
        Self { config, schedule }
    }

    /// Timesteps drawn from the distillation schedule
    ///
    /// The distillation schedule has `original_inference_steps` evenly spaced
    /// timesteps `k - 1, 2k - 1, ...`; inference takes evenly spaced indices
    /// into it, highest noise first.
    pub fn compute_timesteps(config: &SchedulerConfig, num_inference_steps: usize) -> Vec<usize> {
        let n = config.num_train_timesteps.max(1);
        let origin_steps = config.original_inference_steps.clamp(1, n);
        if num_inference_steps > origin_steps {
            warn!(
                requested = num_inference_steps,
                used = origin_steps,
                "more inference steps than the distillation schedule"
            );
        }
        let steps = num_inference_steps.clamp(1, origin_steps);
        let k = n / origin_steps;

        let origin: Vec<usize> = (1..=origin_steps).rev().map(|i| i * k - 1).collect();
        (0..steps)
            .map(|i| origin[(i as f64 * origin_steps as f64 / steps as f64).floor() as usize])
            .collect()
    }

    /// `(c_skip, c_out)` at a timestep
    fn boundary_scalings(&self, timestep: usize) -> (f32, f32) {
        let scaled = timestep as f64 * self.config.timestep_scaling;
        let denom = scaled * scaled + SIGMA_DATA * SIGMA_DATA;
        let c_skip = SIGMA_DATA * SIGMA_DATA / denom;
        let c_out = scaled / denom.sqrt();
        (c_skip as f32, c_out as f32)
    }
}

impl<B: Backend> Scheduler<B> for LcmScheduler {
    fn name(&self) -> &'static str {
        "LCMScheduler"
    }

    fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn timesteps(&self, num_inference_steps: usize) -> Timesteps {
        let timesteps = Self::compute_timesteps(&self.config, num_inference_steps);
        Timesteps::build(timesteps, &self.schedule, &self.config)
    }

    fn init_noise_sigma(&self, _plan: &Timesteps) -> f32 {
        1.0
    }

    fn step(
        &self,
        model_output: Tensor<B, 4>,
        plan: &Timesteps,
        step_index: usize,
        sample: Tensor<B, 4>,
        generator: &mut Generator,
    ) -> Tensor<B, 4> {
        let timestep = plan.timesteps[step_index];
        let alpha = plan.alphas_cumprod[step_index];
        let (c_skip, c_out) = self.boundary_scalings(timestep);

        let pred_original = to_sample(
            model_output,
            sample.clone(),
            alpha.sqrt(),
            (1.0 - alpha).sqrt(),
            self.config.prediction_type,
        );
        let denoised = pred_original * c_out + sample.clone() * c_skip;

        if step_index + 1 >= plan.len() {
            return denoised;
        }

        let alpha_prev = plan.alphas_cumprod[step_index + 1];
        let noise = generator.randn::<B, 4>(sample.dims(), &sample.device());
        add_noise_alpha(denoised, noise, alpha_prev)
    }

    fn add_noise(&self, original: Tensor<B, 4>, noise: Tensor<B, 4>, plan: &Timesteps, step_index: usize) -> Tensor<B, 4> {
        add_noise_alpha(original, noise, plan.alphas_cumprod[step_index])
    }

    fn is_stochastic(&self) -> bool {
        true
    }
}
