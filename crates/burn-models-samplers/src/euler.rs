//! Euler and Euler Ancestral schedulers
//!
//! Both integrate the probability-flow ODE in sigma space (k-diffusion
//! formulation). The ancestral variant steps to `sigma_down` and re-injects
//! `sigma_up` worth of fresh noise.

use burn::prelude::*;

use crate::generator::Generator;
use crate::scheduler::{
    NoiseSchedule, PredictionType, Scheduler, SchedulerConfig, TimestepSpacing, Timesteps,
    get_ancestral_step, spaced_timesteps,
};

/// Predicted x0 in sigma space
fn predicted_original<B: Backend>(
    model_output: Tensor<B, 4>,
    sample: Tensor<B, 4>,
    sigma: f32,
    prediction_type: PredictionType,
) -> Tensor<B, 4> {
    match prediction_type {
        PredictionType::Epsilon => sample - model_output * sigma,
        PredictionType::VPrediction => {
            let c = sigma * sigma + 1.0;
            model_output * (-sigma / c.sqrt()) + sample / c
        }
        PredictionType::Sample => model_output,
    }
}

fn euler_init_sigma(config: &SchedulerConfig, plan: &Timesteps) -> f32 {
    let sigma_max = plan.sigmas.iter().copied().fold(0.0f32, f32::max);
    match config.timestep_spacing {
        TimestepSpacing::Linspace | TimestepSpacing::Trailing => sigma_max,
        TimestepSpacing::Leading => (sigma_max * sigma_max + 1.0).sqrt(),
    }
}

fn euler_scale_input<B: Backend>(sample: Tensor<B, 4>, plan: &Timesteps, step_index: usize) -> Tensor<B, 4> {
    let sigma = plan.sigmas[step_index];
    sample / (sigma * sigma + 1.0).sqrt()
}

/// Euler scheduler (deterministic)
#[derive(Debug, Clone)]
pub struct EulerDiscreteScheduler {
    config: SchedulerConfig,
    schedule: NoiseSchedule,
}

impl EulerDiscreteScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let schedule = NoiseSchedule::from_config(&config);
        Self { config, schedule }
    }
}

impl<B: Backend> Scheduler<B> for EulerDiscreteScheduler {
    fn name(&self) -> &'static str {
        "EulerDiscreteScheduler"
    }

    fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn timesteps(&self, num_inference_steps: usize) -> Timesteps {
        Timesteps::build(spaced_timesteps(num_inference_steps, &self.config), &self.schedule, &self.config)
    }

    fn init_noise_sigma(&self, plan: &Timesteps) -> f32 {
        euler_init_sigma(&self.config, plan)
    }

    fn scale_model_input(&self, sample: Tensor<B, 4>, plan: &Timesteps, step_index: usize) -> Tensor<B, 4> {
        euler_scale_input(sample, plan, step_index)
    }

    fn step(
        &self,
        model_output: Tensor<B, 4>,
        plan: &Timesteps,
        step_index: usize,
        sample: Tensor<B, 4>,
        _generator: &mut Generator,
    ) -> Tensor<B, 4> {
        let sigma = plan.sigmas[step_index];
        let sigma_next = plan.sigmas[step_index + 1];

        let denoised = predicted_original(model_output, sample.clone(), sigma, self.config.prediction_type);
        let derivative = (sample.clone() - denoised) / sigma;

        sample + derivative * (sigma_next - sigma)
    }

    fn add_noise(&self, original: Tensor<B, 4>, noise: Tensor<B, 4>, plan: &Timesteps, step_index: usize) -> Tensor<B, 4> {
        original + noise * plan.sigmas[step_index]
    }
}

/// Euler Ancestral scheduler
#[derive(Debug, Clone)]
pub struct EulerAncestralDiscreteScheduler {
    config: SchedulerConfig,
    schedule: NoiseSchedule,
    /// Noise injection (0 = ODE, 1 = full ancestral)
    eta: f32,
}

impl EulerAncestralDiscreteScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let schedule = NoiseSchedule::from_config(&config);
        Self {
            config,
            schedule,
            eta: 1.0,
        }
    }

    pub fn with_eta(mut self, eta: f32) -> Self {
        self.eta = eta;
        self
    }
}

impl<B: Backend> Scheduler<B> for EulerAncestralDiscreteScheduler {
    fn name(&self) -> &'static str {
        "EulerAncestralDiscreteScheduler"
    }

    fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn timesteps(&self, num_inference_steps: usize) -> Timesteps {
        Timesteps::build(spaced_timesteps(num_inference_steps, &self.config), &self.schedule, &self.config)
    }

    fn init_noise_sigma(&self, plan: &Timesteps) -> f32 {
        euler_init_sigma(&self.config, plan)
    }

    fn scale_model_input(&self, sample: Tensor<B, 4>, plan: &Timesteps, step_index: usize) -> Tensor<B, 4> {
        euler_scale_input(sample, plan, step_index)
    }

    fn step(
        &self,
        model_output: Tensor<B, 4>,
        plan: &Timesteps,
        step_index: usize,
        sample: Tensor<B, 4>,
        generator: &mut Generator,
    ) -> Tensor<B, 4> {
        let sigma = plan.sigmas[step_index];
        let sigma_next = plan.sigmas[step_index + 1];
        let (sigma_down, sigma_up) = get_ancestral_step(sigma, sigma_next, self.eta);

        let denoised = predicted_original(model_output, sample.clone(), sigma, self.config.prediction_type);
        let derivative = (sample.clone() - denoised) / sigma;
        let prev = sample.clone() + derivative * (sigma_down - sigma);

        if sigma_up > 0.0 {
            let noise = generator.randn::<B, 4>(sample.dims(), &sample.device());
            prev + noise * sigma_up
        } else {
            prev
        }
    }

    fn add_noise(&self, original: Tensor<B, 4>, noise: Tensor<B, 4>, plan: &Timesteps, step_index: usize) -> Tensor<B, 4> {
        original + noise * plan.sigmas[step_index]
    }

    fn is_stochastic(&self) -> bool {
        self.eta > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_euler_plan() {
        let scheduler = EulerDiscreteScheduler::new(SchedulerConfig::default());
        let plan = Scheduler::<TestBackend>::timesteps(&scheduler, 4);

        assert_eq!(plan.timesteps, vec![751, 501, 251, 1]);
        assert_eq!(plan.sigmas.len(), 5);
        assert_eq!(*plan.sigmas.last().unwrap(), 0.0);
        assert!(plan.sigmas.windows(2).all(|w| w[0] > w[1]));

        let init = Scheduler::<TestBackend>::init_noise_sigma(&scheduler, &plan);
        assert!((init - (plan.sigmas[0].powi(2) + 1.0).sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_final_step_returns_denoised() {
        let device = Default::default();
        let scheduler = EulerDiscreteScheduler::new(SchedulerConfig::default());
        let plan = Scheduler::<TestBackend>::timesteps(&scheduler, 4);

        let sample = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device);
        let eps = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device) * 0.5;
        let out = scheduler.step(eps, &plan, 3, sample, &mut Generator::seeded(0));

        // sigma_next = 0 lands on x0 = x - sigma * eps
        let expected = 1.0 - plan.sigmas[3] * 0.5;
        let value: f32 = out.mean().into_scalar().elem();
        assert!((value - expected).abs() < 1e-5);
    }

    #[test]
    fn test_ancestral_uses_generator() {
        let device = Default::default();
        let scheduler = EulerAncestralDiscreteScheduler::new(SchedulerConfig::default());
        let plan = Scheduler::<TestBackend>::timesteps(&scheduler, 4);
        assert!(Scheduler::<TestBackend>::is_stochastic(&scheduler));

        let sample = Tensor::<TestBackend, 4>::ones([1, 4, 4, 4], &device);
        let eps = Tensor::<TestBackend, 4>::zeros([1, 4, 4, 4], &device);

        let run = |seed| {
            scheduler
                .step(eps.clone(), &plan, 0, sample.clone(), &mut Generator::seeded(seed))
                .into_data()
                .to_vec::<f32>()
                .unwrap()
        };
        assert_eq!(run(1), run(1));
        assert_ne!(run(1), run(2));
    }
}
