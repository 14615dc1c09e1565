//! Configuration for the diffusion process and the system-identification sampler.
//!
//! Defaults match the reference run: a 1000-step cosine schedule, 250 sampling
//! steps, Adam at lr 0.1, a 64×64 grid and the noisy pendulum.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::schedule::ScheduleKind;
use crate::system::SystemKind;
use crate::{Error, Result};

/// Diffusion-process configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionConfig {
    /// Number of timesteps in the full diffusion process (default: 1000).
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,

    /// Variance schedule (default: cosine).
    #[serde(default)]
    pub schedule: ScheduleKind,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: default_num_train_timesteps(),
            schedule: ScheduleKind::default(),
        }
    }
}

/// Reverse-process / fitting-loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Dynamical system variant to identify (default: noisy_pendulum).
    #[serde(default = "default_system")]
    pub system: SystemKind,

    /// Number of sub-sampled reverse steps (default: 250).
    #[serde(default = "default_sampling_steps")]
    pub sampling_steps: usize,

    /// Learning rate of the coefficient optimizer (default: 0.1).
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Side length of the square coordinate grid (default: 64).
    #[serde(default = "default_grid_size")]
    pub grid_size: usize,

    /// Seed for the per-run random stream. `None` draws one from the OS.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Emit a progress line every `log_every` steps; 0 disables it (default: 1).
    #[serde(default = "default_log_every")]
    pub log_every: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            system: default_system(),
            sampling_steps: default_sampling_steps(),
            learning_rate: default_learning_rate(),
            grid_size: default_grid_size(),
            seed: None,
            log_every: default_log_every(),
        }
    }
}

impl SamplerConfig {
    /// Check the fields that do not depend on the diffusion process.
    pub fn validate(&self) -> Result<()> {
        if self.sampling_steps == 0 {
            return Err(Error::config("sampling_steps must be positive"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::config(format!(
                "learning_rate must be positive and finite, got {}",
                self.learning_rate
            )));
        }
        if self.grid_size < 2 {
            return Err(Error::config(format!(
                "grid_size must be at least 2, got {}",
                self.grid_size
            )));
        }
        Ok(())
    }
}

/// Combined configuration file layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub diffusion: DiffusionConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
}

impl Config {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

fn default_num_train_timesteps() -> usize {
    1000
}

fn default_system() -> SystemKind {
    SystemKind::NoisyPendulum
}

fn default_sampling_steps() -> usize {
    250
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_grid_size() -> usize {
    64
}

fn default_log_every() -> usize {
    1
}
