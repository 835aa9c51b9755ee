//! Deterministic multistep diffusion solver.
//!
//! Converts a per-step model output into the next, less-noisy latent using a
//! fixed small inference-step count over a much finer training-time schedule.
//! The update is a DPM-Solver++ multistep rule: first order on the very first
//! step and on the final step, a second-order blend weighted by the ratio of
//! consecutive log-SNR gaps everywhere else.
//!
//! All per-timestep coefficients are precomputed once at construction; the
//! per-frame history lives in [`SolverState`], so one scheduler is safely
//! shared across concurrent requests.

use crate::error::{LyrebirdError, Result};
use std::str::FromStr;
use tracing::debug;

/// Training-time noise schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetaSchedule {
    /// Squared-cosine schedule with capped betas.
    Cosine,
}

impl FromStr for BetaSchedule {
    type Err = LyrebirdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cosine" | "squaredcos_cap_v2" => Ok(Self::Cosine),
            other => Err(LyrebirdError::DataFormat(format!(
                "unsupported beta schedule '{other}'"
            ))),
        }
    }
}

/// What the diffusion predictor's output parameterizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
    /// Output is the added noise.
    Epsilon,
    /// Output is the velocity; production mode.
    VPrediction,
    /// Output is the denoised sample directly.
    Sample,
}

impl FromStr for PredictionType {
    type Err = LyrebirdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "epsilon" => Ok(Self::Epsilon),
            "v_prediction" => Ok(Self::VPrediction),
            "sample" => Ok(Self::Sample),
            other => Err(LyrebirdError::DataFormat(format!(
                "unsupported prediction type '{other}'"
            ))),
        }
    }
}

/// Precomputed solver tables plus the fixed descending timestep schedule.
#[derive(Debug)]
pub struct DiffusionScheduler {
    num_inference_steps: usize,
    prediction: PredictionType,
    /// Cumulative signal retention ᾱ(t), one entry per training timestep.
    alphas_cumprod: Vec<f64>,
    /// Signal scale sqrt(ᾱ(t)).
    signal_scale: Vec<f32>,
    /// Noise scale sqrt(1 - ᾱ(t)).
    noise_scale: Vec<f32>,
    /// Log signal-to-noise ratio ln(signal scale) - ln(noise scale).
    log_snr: Vec<f64>,
    timesteps: Vec<usize>,
}

impl DiffusionScheduler {
    pub fn new(
        num_inference_steps: usize,
        num_train_timesteps: usize,
        schedule: BetaSchedule,
        prediction: PredictionType,
    ) -> Result<Self> {
        if num_train_timesteps < 2 {
            return Err(LyrebirdError::InvalidArgument(
                "training timestep count must be at least 2".to_string(),
            ));
        }
        if num_inference_steps == 0 || num_inference_steps >= num_train_timesteps {
            return Err(LyrebirdError::InvalidArgument(format!(
                "inference step count {num_inference_steps} must be in [1, {})",
                num_train_timesteps
            )));
        }

        let alphas_cumprod = cumulative_signal_retention(num_train_timesteps, schedule);
        let signal_scale: Vec<f32> = alphas_cumprod.iter().map(|a| a.sqrt() as f32).collect();
        let noise_scale: Vec<f32> = alphas_cumprod
            .iter()
            .map(|a| (1.0 - a).sqrt() as f32)
            .collect();
        let log_snr: Vec<f64> = alphas_cumprod
            .iter()
            .map(|a| 0.5 * (a.ln() - (1.0 - a).ln()))
            .collect();

        let timesteps = spaced_timesteps(num_inference_steps, num_train_timesteps);
        debug!(
            "scheduler: {} steps over {} training timesteps: {:?}",
            num_inference_steps, num_train_timesteps, timesteps
        );

        Ok(Self {
            num_inference_steps,
            prediction,
            alphas_cumprod,
            signal_scale,
            noise_scale,
            log_snr,
            timesteps,
        })
    }

    /// The fixed descending timestep schedule.
    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    pub fn num_inference_steps(&self) -> usize {
        self.num_inference_steps
    }

    pub fn prediction_type(&self) -> PredictionType {
        self.prediction
    }

    /// Start a fresh per-frame solver pass.
    pub fn begin(&self) -> SolverState<'_> {
        SolverState {
            scheduler: self,
            step_index: 0,
            previous_denoised: None,
        }
    }

    /// (signal scale, noise scale, log-SNR) at a timestep; `None` is the
    /// fully-denoised terminal boundary past the end of the schedule.
    fn coefficients(&self, timestep: Option<usize>) -> (f64, f64, f64) {
        match timestep {
            Some(t) => (
                self.signal_scale[t] as f64,
                self.noise_scale[t] as f64,
                self.log_snr[t],
            ),
            None => (1.0, 0.0, f64::INFINITY),
        }
    }

    /// Convert a model output into the predicted fully-denoised sample.
    fn to_denoised(&self, model_output: &[f32], timestep: usize, sample: &[f32]) -> Vec<f32> {
        let a = self.signal_scale[timestep];
        let s = self.noise_scale[timestep];
        match self.prediction {
            PredictionType::VPrediction => sample
                .iter()
                .zip(model_output)
                .map(|(&x, &v)| a * x - s * v)
                .collect(),
            PredictionType::Epsilon => sample
                .iter()
                .zip(model_output)
                .map(|(&x, &e)| (x - s * e) / a)
                .collect(),
            PredictionType::Sample => model_output.to_vec(),
        }
    }
}

/// Per-frame solver state: the step cursor plus the retained previous
/// denoised-sample estimate for the second-order update. Discard once the
/// frame's latent is finalized.
pub struct SolverState<'a> {
    scheduler: &'a DiffusionScheduler,
    step_index: usize,
    previous_denoised: Option<Vec<f32>>,
}

impl SolverState<'_> {
    /// Advance the sample by one scheduler step.
    ///
    /// `timestep` must be the schedule entry for the current step index.
    /// Identical inputs at the same index always produce identical output.
    pub fn step(
        &mut self,
        model_output: &[f32],
        timestep: usize,
        sample: &[f32],
    ) -> Result<Vec<f32>> {
        let schedule = self.scheduler.timesteps();
        let i = self.step_index;
        if i >= schedule.len() {
            return Err(LyrebirdError::InvalidArgument(
                "solver already consumed every scheduled step".to_string(),
            ));
        }
        if timestep != schedule[i] {
            return Err(LyrebirdError::InvalidArgument(format!(
                "timestep {} does not match scheduled step {} at index {}",
                timestep, schedule[i], i
            )));
        }
        if model_output.len() != sample.len() {
            return Err(LyrebirdError::InvalidArgument(format!(
                "model output length {} does not match sample length {}",
                model_output.len(),
                sample.len()
            )));
        }

        let denoised = self.scheduler.to_denoised(model_output, timestep, sample);

        let (_, sigma_s, lambda_s) = self.scheduler.coefficients(Some(timestep));
        let next = schedule.get(i + 1).copied();
        let (alpha_t, sigma_t, lambda_t) = self.scheduler.coefficients(next);
        let h = lambda_t - lambda_s;

        // x_prev = (sigma_t / sigma_s) * x - alpha_t * (exp(-h) - 1) * D
        let ratio = (sigma_t / sigma_s) as f32;
        let order_coeff = (alpha_t * ((-h).exp() - 1.0)) as f32;

        let last_index = i + 1 == schedule.len();
        let first_order = i == 0 || last_index || self.previous_denoised.is_none();

        let prev_sample: Vec<f32> = if first_order {
            sample
                .iter()
                .zip(&denoised)
                .map(|(&x, &d0)| ratio * x - order_coeff * d0)
                .collect()
        } else {
            // D blends the two retained estimates by the ratio of consecutive
            // log-SNR gaps.
            let m1 = self
                .previous_denoised
                .as_ref()
                .ok_or_else(|| {
                    LyrebirdError::InvalidArgument("missing solver history".to_string())
                })?;
            let (_, _, lambda_prev) = self.scheduler.coefficients(Some(schedule[i - 1]));
            let h_prev = lambda_s - lambda_prev;
            let r = (h_prev / h) as f32;
            sample
                .iter()
                .zip(denoised.iter().zip(m1))
                .map(|(&x, (&d0, &d1))| {
                    let blend = d0 + 0.5 * (d0 - d1) / r;
                    ratio * x - order_coeff * blend
                })
                .collect()
        };

        self.previous_denoised = Some(denoised);
        self.step_index += 1;
        Ok(prev_sample)
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }
}

/// ᾱ(t) for every training timestep under the given schedule.
fn cumulative_signal_retention(num_train_timesteps: usize, schedule: BetaSchedule) -> Vec<f64> {
    match schedule {
        BetaSchedule::Cosine => {
            let alpha_bar = |t: f64| -> f64 {
                ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2)
            };
            let max_beta = 0.999;
            let mut out = Vec::with_capacity(num_train_timesteps);
            let mut running = 1.0f64;
            for i in 0..num_train_timesteps {
                let t1 = i as f64 / num_train_timesteps as f64;
                let t2 = (i + 1) as f64 / num_train_timesteps as f64;
                let beta = (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta);
                running *= 1.0 - beta;
                out.push(running);
            }
            out
        }
    }
}

/// Evenly spaced by value over `[0, train−1]`, rounded, descending, with the
/// trailing zero dropped.
fn spaced_timesteps(num_inference_steps: usize, num_train_timesteps: usize) -> Vec<usize> {
    let n_points = num_inference_steps + 1;
    let span = (num_train_timesteps - 1) as f64;
    let mut timesteps: Vec<usize> = (0..n_points)
        .map(|i| (i as f64 * span / (n_points - 1) as f64).round() as usize)
        .collect();
    timesteps.reverse();
    timesteps.truncate(num_inference_steps);
    timesteps
}
