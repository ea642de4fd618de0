//! Noise schedules and the scheduler interface
//!
//! Schedulers are stateless: `timesteps` produces a [`Timesteps`] plan for a
//! given step count and every other call reads from that plan, so one
//! scheduler instance can serve any number of concurrent or repeated runs.

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::generator::Generator;

// ============================================================================
// Prediction Type (epsilon vs v-prediction)
// ============================================================================

/// Model prediction type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    /// Model predicts the noise (epsilon) added to the sample
    #[default]
    Epsilon,
    /// Model predicts the velocity v = alpha_t * epsilon - sigma_t * x0
    #[serde(rename = "v_prediction")]
    VPrediction,
    /// Model predicts the original sample x0
    Sample,
}

/// Convert any prediction type to predicted x0 in the alpha parameterisation
///
/// `alpha_t = sqrt(alpha_cumprod)`, `sigma_t = sqrt(1 - alpha_cumprod)`.
pub fn to_sample<B: Backend>(
    model_output: Tensor<B, 4>,
    sample: Tensor<B, 4>,
    alpha_t: f32,
    sigma_t: f32,
    prediction_type: PredictionType,
) -> Tensor<B, 4> {
    match prediction_type {
        PredictionType::Epsilon => (sample - model_output * sigma_t) / alpha_t,
        PredictionType::VPrediction => sample * alpha_t - model_output * sigma_t,
        PredictionType::Sample => model_output,
    }
}

/// Convert any prediction type to epsilon in the alpha parameterisation
pub fn to_epsilon<B: Backend>(
    model_output: Tensor<B, 4>,
    sample: Tensor<B, 4>,
    alpha_t: f32,
    sigma_t: f32,
    prediction_type: PredictionType,
) -> Tensor<B, 4> {
    match prediction_type {
        PredictionType::Epsilon => model_output,
        PredictionType::VPrediction => model_output * alpha_t + sample * sigma_t,
        PredictionType::Sample => (sample - model_output * alpha_t) / sigma_t,
    }
}

// ============================================================================
// Schedule Configuration
// ============================================================================

/// Beta schedule used during training
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    /// Linear in sqrt(beta), used by Stable Diffusion
    #[default]
    ScaledLinear,
    /// Cosine schedule capped at beta = 0.999
    #[serde(rename = "squaredcos_cap_v2")]
    SquaredCosCapV2,
}

/// How inference timesteps are spread over the training range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepSpacing {
    #[default]
    Leading,
    Trailing,
    Linspace,
}

/// Scheduler hyperparameters, as stored in `scheduler_config.json`
///
/// Unknown keys in the file are ignored; missing keys take Stable
/// Diffusion defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    pub prediction_type: PredictionType,
    pub steps_offset: usize,
    pub timestep_spacing: TimestepSpacing,
    /// Use alpha_cumprod = 1 after the final step (DDIM, LCM)
    pub set_alpha_to_one: bool,
    /// Step count of the schedule an LCM was distilled from
    pub original_inference_steps: usize,
    /// LCM boundary-condition timestep scaling
    pub timestep_scaling: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            prediction_type: PredictionType::Epsilon,
            steps_offset: 1,
            timestep_spacing: TimestepSpacing::Leading,
            set_alpha_to_one: false,
            original_inference_steps: 50,
            timestep_scaling: 10.0,
        }
    }
}

impl SchedulerConfig {
    /// Reject hyperparameters no schedule can be built from
    pub fn validate(&self) -> Result<(), String> {
        if self.num_train_timesteps == 0 {
            return Err("num_train_timesteps must be at least 1".into());
        }
        if !(self.beta_start > 0.0 && self.beta_start <= self.beta_end && self.beta_end < 1.0) {
            return Err(format!(
                "betas must satisfy 0 < beta_start <= beta_end < 1, got {} and {}",
                self.beta_start, self.beta_end
            ));
        }
        if self.original_inference_steps == 0 {
            return Err("original_inference_steps must be at least 1".into());
        }
        Ok(())
    }
}

/// Precomputed cumulative alphas for every training timestep
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    /// Cumulative product of alphas: ᾱₜ
    pub alphas_cumprod: Vec<f32>,
}

impl NoiseSchedule {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        let n = config.num_train_timesteps.max(2);
        let betas: Vec<f64> = match config.beta_schedule {
            BetaSchedule::Linear => (0..n)
                .map(|i| {
                    let t = i as f64 / (n - 1) as f64;
                    config.beta_start + t * (config.beta_end - config.beta_start)
                })
                .collect(),
            BetaSchedule::ScaledLinear => {
                let (start, end) = (config.beta_start.sqrt(), config.beta_end.sqrt());
                (0..n)
                    .map(|i| {
                        let t = i as f64 / (n - 1) as f64;
                        (start + t * (end - start)).powi(2)
                    })
                    .collect()
            }
            BetaSchedule::SquaredCosCapV2 => {
                let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
                (0..n)
                    .map(|i| {
                        let t1 = i as f64 / n as f64;
                        let t2 = (i + 1) as f64 / n as f64;
                        (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
                    })
                    .collect()
            }
        };

        let mut cumprod = 1.0f64;
        let alphas_cumprod = betas
            .iter()
            .map(|beta| {
                cumprod *= 1.0 - beta;
                cumprod as f32
            })
            .collect();

        Self { alphas_cumprod }
    }

    pub fn num_train_steps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn alpha_cumprod_at(&self, t: usize) -> f32 {
        self.alphas_cumprod[t.min(self.alphas_cumprod.len() - 1)]
    }

    /// sigma = sqrt((1 - ᾱ) / ᾱ)
    pub fn sigma_at(&self, t: usize) -> f32 {
        let alpha = self.alpha_cumprod_at(t);
        ((1.0 - alpha) / alpha).sqrt()
    }

    /// ᾱ after the final step
    pub fn final_alpha_cumprod(&self, config: &SchedulerConfig) -> f32 {
        if config.set_alpha_to_one {
            1.0
        } else {
            self.alphas_cumprod[0]
        }
    }
}

/// Spread `num_inference_steps` over the training range, highest noise first
pub fn spaced_timesteps(num_inference_steps: usize, config: &SchedulerConfig) -> Vec<usize> {
    let n = config.num_train_timesteps.max(1);
    if num_inference_steps > n {
        warn!(requested = num_inference_steps, used = n, "more inference steps than training timesteps");
    }
    let steps = num_inference_steps.clamp(1, n);

    match config.timestep_spacing {
        TimestepSpacing::Leading => {
            let ratio = n / steps;
            (0..steps)
                .rev()
                .map(|i| (i * ratio + config.steps_offset).min(n - 1))
                .collect()
        }
        TimestepSpacing::Trailing => {
            let ratio = n as f64 / steps as f64;
            (0..steps)
                .map(|i| ((n as f64 - i as f64 * ratio).round() as usize).saturating_sub(1))
                .collect()
        }
        TimestepSpacing::Linspace => {
            if steps == 1 {
                return vec![n - 1];
            }
            (0..steps)
                .rev()
                .map(|i| (i as f64 * (n - 1) as f64 / (steps - 1) as f64).round() as usize)
                .collect()
        }
    }
}

/// Compute ancestral sampling step parameters `(sigma_down, sigma_up)`
///
/// The eta parameter controls stochasticity (0 = ODE, 1 = full SDE)
pub fn get_ancestral_step(sigma: f32, sigma_next: f32, eta: f32) -> (f32, f32) {
    if sigma_next == 0.0 {
        return (0.0, 0.0);
    }

    let sigma_up = (sigma_next.powi(2) * (sigma.powi(2) - sigma_next.powi(2)) / sigma.powi(2))
        .sqrt()
        .min(sigma_next)
        * eta;
    let sigma_down = (sigma_next.powi(2) - sigma_up.powi(2)).sqrt();

    (sigma_down, sigma_up)
}

/// Per-run plan produced by [`Scheduler::timesteps`]
#[derive(Debug, Clone, PartialEq)]
pub struct Timesteps {
    /// Training timesteps, highest noise first
    pub timesteps: Vec<usize>,
    /// Sigma at each timestep, followed by the final sigma (0)
    pub sigmas: Vec<f32>,
    /// ᾱ at each timestep, followed by the final ᾱ
    pub alphas_cumprod: Vec<f32>,
}

impl Timesteps {
    pub fn build(timesteps: Vec<usize>, schedule: &NoiseSchedule, config: &SchedulerConfig) -> Self {
        let mut sigmas: Vec<f32> = timesteps.iter().map(|&t| schedule.sigma_at(t)).collect();
        sigmas.push(0.0);
        let mut alphas_cumprod: Vec<f32> =
            timesteps.iter().map(|&t| schedule.alpha_cumprod_at(t)).collect();
        alphas_cumprod.push(schedule.final_alpha_cumprod(config));
        Self {
            timesteps,
            sigmas,
            alphas_cumprod,
        }
    }

    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timesteps.is_empty()
    }

    /// Index of the first step when only the last `strength` fraction runs
    ///
    /// `strength = 1` runs every step, `strength = 0` runs none.
    pub fn start_index(&self, strength: f64) -> usize {
        let n = self.timesteps.len();
        let init = ((n as f64) * strength.clamp(0.0, 1.0)) as usize;
        n - init.min(n)
    }
}

/// A diffusion scheduler
///
/// Implementations are constructed from a [`SchedulerConfig`] and never
/// mutate themselves while sampling.
pub trait Scheduler<B: Backend> {
    /// Registry name, e.g. `EulerAncestralDiscreteScheduler`
    fn name(&self) -> &'static str;

    fn config(&self) -> &SchedulerConfig;

    /// Plan `num_inference_steps` steps
    fn timesteps(&self, num_inference_steps: usize) -> Timesteps;

    /// Standard deviation of the initial latent noise
    fn init_noise_sigma(&self, plan: &Timesteps) -> f32;

    /// Scale the denoiser input for the current step
    fn scale_model_input(&self, sample: Tensor<B, 4>, _plan: &Timesteps, _step_index: usize) -> Tensor<B, 4> {
        sample
    }

    /// Advance `sample` one step given the model output
    fn step(
        &self,
        model_output: Tensor<B, 4>,
        plan: &Timesteps,
        step_index: usize,
        sample: Tensor<B, 4>,
        generator: &mut Generator,
    ) -> Tensor<B, 4>;

    /// Noise a clean sample to the level of `step_index` (image-to-image)
    fn add_noise(
        &self,
        original: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        plan: &Timesteps,
        step_index: usize,
    ) -> Tensor<B, 4>;

    /// Whether `step` draws fresh noise from the generator
    fn is_stochastic(&self) -> bool {
        false
    }
}

/// Noise at the ᾱ level of a step, shared by alpha-parameterised schedulers
pub(crate) fn add_noise_alpha<B: Backend>(
    original: Tensor<B, 4>,
    noise: Tensor<B, 4>,
    alpha_cumprod: f32,
) -> Tensor<B, 4> {
    original * alpha_cumprod.sqrt() + noise * (1.0 - alpha_cumprod).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_timesteps() {
        let config = SchedulerConfig::default();
        assert_eq!(spaced_timesteps(4, &config), vec![751, 501, 251, 1]);

        let steps = spaced_timesteps(50, &config);
        assert_eq!(steps.len(), 50);
        assert_eq!(steps[0], 981);
        assert_eq!(steps[49], 1);
    }

    #[test]
    fn test_steps_capped_at_training_range() {
        let config = SchedulerConfig {
            num_train_timesteps: 10,
            ..Default::default()
        };
        let steps = spaced_timesteps(25, &config);
        assert_eq!(steps.len(), 10);
        assert_eq!(steps.last(), Some(&1));

        let empty = SchedulerConfig {
            num_train_timesteps: 0,
            timestep_spacing: TimestepSpacing::Linspace,
            ..Default::default()
        };
        assert_eq!(spaced_timesteps(4, &empty), vec![0]);
    }

    #[test]
    fn test_config_validation() {
        assert!(SchedulerConfig::default().validate().is_ok());

        let config: SchedulerConfig = serde_json::from_str(r#"{"num_train_timesteps": 0}"#).unwrap();
        assert!(config.validate().unwrap_err().contains("num_train_timesteps"));

        let config = SchedulerConfig {
            beta_start: 0.02,
            beta_end: 0.01,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trailing_and_linspace() {
        let config = SchedulerConfig {
            timestep_spacing: TimestepSpacing::Trailing,
            ..Default::default()
        };
        assert_eq!(spaced_timesteps(4, &config), vec![999, 749, 499, 249]);

        let config = SchedulerConfig {
            timestep_spacing: TimestepSpacing::Linspace,
            ..Default::default()
        };
        assert_eq!(spaced_timesteps(4, &config), vec![999, 666, 333, 0]);
    }

    #[test]
    fn test_scaled_linear_schedule() {
        let schedule = NoiseSchedule::from_config(&SchedulerConfig::default());
        assert_eq!(schedule.num_train_steps(), 1000);
        assert!((schedule.alpha_cumprod_at(0) - (1.0 - 0.00085)).abs() < 1e-6);
        // Stable Diffusion's sigma_max
        assert!((schedule.sigma_at(999) - 14.6146).abs() < 1e-2);
    }

    #[test]
    fn test_start_index() {
        let config = SchedulerConfig::default();
        let schedule = NoiseSchedule::from_config(&config);
        let plan = Timesteps::build(spaced_timesteps(10, &config), &schedule, &config);

        assert_eq!(plan.sigmas.len(), 11);
        assert_eq!(plan.start_index(1.0), 0);
        assert_eq!(plan.start_index(0.8), 2);
        assert_eq!(plan.start_index(0.0), 10);
    }

    #[test]
    fn test_ancestral_step() {
        let (down, up) = get_ancestral_step(2.0, 1.0, 1.0);
        assert!((down * down + up * up - 1.0).abs() < 1e-6);
        assert_eq!(get_ancestral_step(1.0, 0.0, 1.0), (0.0, 0.0));
    }

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: SchedulerConfig = serde_json::from_str(
            r#"{"_class_name": "EulerDiscreteScheduler", "beta_schedule": "linear", "prediction_type": "v_prediction"}"#,
        )
        .unwrap();
        assert_eq!(config.beta_schedule, BetaSchedule::Linear);
        assert_eq!(config.prediction_type, PredictionType::VPrediction);
        assert_eq!(config.num_train_timesteps, 1000);
    }
}
