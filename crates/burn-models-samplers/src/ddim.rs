//! DDIM scheduler (deterministic, eta = 0)

use burn::prelude::*;

use crate::generator::Generator;
use crate::scheduler::{
    NoiseSchedule, Scheduler, SchedulerConfig, Timesteps, add_noise_alpha, spaced_timesteps, to_epsilon,
    to_sample,
};

/// Denoising Diffusion Implicit Models sampler
#[derive(Debug, Clone)]
pub struct DdimScheduler {
    config: SchedulerConfig,
    schedule: NoiseSchedule,
}

impl DdimScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let schedule = NoiseSchedule::from_config(&config);
        Self { config, schedule }
    }
}

impl<B: Backend> Scheduler<B> for DdimScheduler {
    fn name(&self) -> &'static str {
        "DDIMScheduler"
    }

    fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn timesteps(&self, num_inference_steps: usize) -> Timesteps {
        Timesteps::build(spaced_timesteps(num_inference_steps, &self.config), &self.schedule, &self.config)
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
        _generator: &mut Generator,
    ) -> Tensor<B, 4> {
        let alpha = plan.alphas_cumprod[step_index];
        let alpha_prev = plan.alphas_cumprod[step_index + 1];
        let (alpha_t, sigma_t) = (alpha.sqrt(), (1.0 - alpha).sqrt());
        let prediction = self.config.prediction_type;

        let pred_original = to_sample(model_output.clone(), sample.clone(), alpha_t, sigma_t, prediction);
        let pred_epsilon = to_epsilon(model_output, sample, alpha_t, sigma_t, prediction);

        pred_original * alpha_prev.sqrt() + pred_epsilon * (1.0 - alpha_prev).sqrt()
    }

    fn add_noise(&self, original: Tensor<B, 4>, noise: Tensor<B, 4>, plan: &Timesteps, step_index: usize) -> Tensor<B, 4> {
        add_noise_alpha(original, noise, plan.alphas_cumprod[step_index])
    }
}
