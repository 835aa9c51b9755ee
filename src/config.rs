//! Model configuration loaded from the exported models directory.
//!
//! `model_config.json` is written at export time and carries the dimensions
//! the graphs were traced with. Everything the pipeline must agree on with
//! the graphs (hidden size, latent size, cache depths, diffusion schedule)
//! comes from here; anything tunable at run time has a serde default.

use crate::error::{LyrebirdError, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

fn default_ddpm_num_steps() -> usize {
    1000
}

fn default_inference_steps() -> usize {
    5
}

fn default_prediction_type() -> String {
    "v_prediction".to_string()
}

fn default_beta_schedule() -> String {
    "squaredcos_cap_v2".to_string()
}

fn default_tts_backbone_layers() -> usize {
    20
}

fn default_lm_layers() -> usize {
    4
}

fn default_samples_per_frame() -> usize {
    3200
}

fn default_speech_scaling_factor() -> f32 {
    1.0
}

fn default_max_frames() -> usize {
    256
}

fn default_cfg_scale() -> f32 {
    1.5
}

/// Exported model configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Source model identifier, informational only.
    #[serde(default)]
    pub model_name: Option<String>,

    /// Output sample rate in Hz.
    pub sample_rate: u32,

    /// LLM hidden dimension; conditions, caches and type embeddings use it.
    pub hidden_size: usize,

    /// Acoustic latent dimension per frame.
    pub latent_size: usize,

    /// Training-time diffusion resolution.
    #[serde(default = "default_ddpm_num_steps")]
    pub ddpm_num_steps: usize,

    /// Inference-time diffusion step count.
    #[serde(default = "default_inference_steps")]
    pub ddpm_num_inference_steps: usize,

    /// Diffusion predictor parameterization.
    #[serde(default = "default_prediction_type")]
    pub prediction_type: String,

    /// Training-time noise schedule.
    #[serde(default = "default_beta_schedule")]
    pub ddpm_beta_schedule: String,

    /// Deep (TTS) cache depth in layers.
    #[serde(default = "default_tts_backbone_layers")]
    pub tts_backbone_num_hidden_layers: usize,

    /// Shallow (base LM) cache depth in layers.
    #[serde(default = "default_lm_layers")]
    pub lm_num_hidden_layers: usize,

    /// Fixed decoder upsampling: output samples per latent frame.
    #[serde(default = "default_samples_per_frame")]
    pub samples_per_frame: usize,

    /// Default latent rescale factors; voice metadata may override.
    #[serde(default = "default_speech_scaling_factor")]
    pub speech_scaling_factor: f32,
    #[serde(default)]
    pub speech_bias_factor: f32,

    /// Safety ceiling for the autoregressive frame loop.
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,

    /// Classifier-free guidance scale.
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f32,
}

impl ModelConfig {
    /// Load and validate the configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            LyrebirdError::NotFound(format!(
                "model configuration {} unavailable: {}",
                path.display(),
                e
            ))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            LyrebirdError::DataFormat(format!(
                "malformed model configuration {}: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;

        debug!(
            "loaded model config: hidden={}, latent={}, caches={}+{}, {} Hz",
            config.hidden_size,
            config.latent_size,
            config.lm_num_hidden_layers,
            config.tts_backbone_num_hidden_layers,
            config.sample_rate
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let check = |ok: bool, what: &str| -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(LyrebirdError::DataFormat(format!(
                    "model configuration rejected: {what}"
                )))
            }
        };
        check(self.sample_rate > 0, "sample_rate must be positive")?;
        check(self.hidden_size > 0, "hidden_size must be positive")?;
        check(self.latent_size > 0, "latent_size must be positive")?;
        check(
            self.samples_per_frame > 0,
            "samples_per_frame must be positive",
        )?;
        check(self.max_frames > 0, "max_frames must be positive")?;
        check(
            self.lm_num_hidden_layers > 0 && self.tts_backbone_num_hidden_layers > 0,
            "cache depths must be positive",
        )?;
        check(
            self.ddpm_num_inference_steps > 0
                && self.ddpm_num_inference_steps < self.ddpm_num_steps,
            "inference steps must be within the training resolution",
        )?;
        check(self.cfg_scale.is_finite(), "cfg_scale must be finite")?;
        Ok(())
    }
}
