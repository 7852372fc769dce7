use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::schedule::Schedule;

/// Validation failure for a training configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    InvalidCount { field: &'static str, value: usize },
    OutOfRange { field: &'static str, value: f32, min: f32, max: f32 },
    DegenerateBuffer { size: usize },
    DegenerateBatch { batch_size: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidCount { field, value } => {
                write!(f, "{} must be positive, got {}", field, value)
            }
            ConfigError::OutOfRange { field, value, min, max } => {
                write!(f, "{} must be in [{}, {}], got {}", field, min, max, value)
            }
            ConfigError::DegenerateBuffer { size } => {
                write!(
                    f,
                    "rollout buffer holds {} transitions, need at least 2 (increase n_steps or n_envs)",
                    size
                )
            }
            ConfigError::DegenerateBatch { batch_size } => {
                write!(
                    f,
                    "advantage normalization requires batch_size > 1, got {}",
                    batch_size
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Hyperparameters for anchored PPO training.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchoredPpoConfig {
    pub n_envs: usize,
    pub n_steps: usize,
    pub batch_size: usize,
    pub n_epochs: usize,
    pub gamma: f32,
    pub gae_lambda: f32,
    pub learning_rate: Schedule,
    pub clip_range: Schedule,
    pub clip_range_vf: Option<Schedule>,
    pub normalize_advantage: bool,
    pub ent_coef: f32,
    pub vf_coef: f32,
    pub max_grad_norm: Option<f32>,
    pub target_kl: Option<f32>,
    pub total_timesteps: u64,
    /// Per-env episode time limit; episodes are truncated past it.
    pub eps_length: usize,
    /// Window length for the rolling mean episodic reward.
    pub stats_window_size: usize,
    /// Weight of the anchor KL penalty in the policy loss.
    pub anchor_kl_coef: f32,
    /// States sampled (with replacement) per minibatch for the anchor KL.
    pub anchor_sample_size: usize,
    /// Mean episodic reward a policy must reach to enter the archive.
    pub gp_threshold: f32,
    /// Archive capacity.
    pub gp_k: usize,
    /// Detector sensitivity, currently diagnostic only.
    pub td_alpha: f32,
    pub load_params: Option<PathBuf>,
    pub save_params: Option<PathBuf>,
}

impl Default for AnchoredPpoConfig {
    fn default() -> Self {
        Self {
            n_envs: 1,
            n_steps: 2048,
            batch_size: 64,
            n_epochs: 10,
            gamma: 0.99,
            gae_lambda: 0.95,
            learning_rate: Schedule::Constant(3e-4),
            clip_range: Schedule::Constant(0.2),
            clip_range_vf: None,
            normalize_advantage: true,
            ent_coef: 0.0,
            vf_coef: 0.5,
            max_grad_norm: Some(0.5),
            target_kl: None,
            total_timesteps: 1_000_000,
            eps_length: 1000,
            stats_window_size: 100,
            anchor_kl_coef: 0.1,
            anchor_sample_size: 300,
            gp_threshold: 0.0,
            gp_k: 5,
            td_alpha: 0.1,
            load_params: None,
            save_params: None,
        }
    }
}

impl AnchoredPpoConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_n_envs(mut self, n_envs: usize) -> Self {
        self.n_envs = n_envs;
        self
    }

    pub fn with_n_steps(mut self, n_steps: usize) -> Self {
        self.n_steps = n_steps;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_n_epochs(mut self, n_epochs: usize) -> Self {
        self.n_epochs = n_epochs;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: Schedule) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_clip_range(mut self, clip_range: Schedule) -> Self {
        self.clip_range = clip_range;
        self
    }

    pub fn with_target_kl(mut self, target_kl: Option<f32>) -> Self {
        self.target_kl = target_kl;
        self
    }

    pub fn with_total_timesteps(mut self, total_timesteps: u64) -> Self {
        self.total_timesteps = total_timesteps;
        self
    }

    pub fn with_anchor_kl_coef(mut self, coef: f32) -> Self {
        self.anchor_kl_coef = coef;
        self
    }

    pub fn with_gp_threshold(mut self, threshold: f32) -> Self {
        self.gp_threshold = threshold;
        self
    }

    /// Number of transitions gathered per rollout.
    pub fn rollout_size(&self) -> usize {
        self.n_steps * self.n_envs
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("n_envs", self.n_envs),
            ("n_steps", self.n_steps),
            ("batch_size", self.batch_size),
            ("n_epochs", self.n_epochs),
            ("eps_length", self.eps_length),
            ("stats_window_size", self.stats_window_size),
            ("anchor_sample_size", self.anchor_sample_size),
            ("gp_k", self.gp_k),
        ];
        for (field, value) in counts {
            if value == 0 {
                return Err(ConfigError::InvalidCount { field, value });
            }
        }

        let unit_ranges = [("gamma", self.gamma), ("gae_lambda", self.gae_lambda)];
        for (field, value) in unit_ranges {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange { field, value, min: 0.0, max: 1.0 });
            }
        }
        if self.clip_range.initial() <= 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "clip_range",
                value: self.clip_range.initial(),
                min: f32::EPSILON,
                max: f32::INFINITY,
            });
        }
        if self.anchor_kl_coef < 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "anchor_kl_coef",
                value: self.anchor_kl_coef,
                min: 0.0,
                max: f32::INFINITY,
            });
        }

        let buffer = self.rollout_size();
        if buffer <= 1 {
            return Err(ConfigError::DegenerateBuffer { size: buffer });
        }
        if self.normalize_advantage && self.batch_size <= 1 {
            return Err(ConfigError::DegenerateBatch { batch_size: self.batch_size });
        }
        if buffer % self.batch_size != 0 {
            log::warn!(
                "rollout size {} is not divisible by batch_size {}, the final minibatch each epoch will be short",
                buffer,
                self.batch_size
            );
        }

        Ok(())
    }

    pub fn build(self) -> Result<Self, ConfigError> {
        self.validate()?;
        Ok(self)
    }
}

/// Failure while reading an experiment parameter file.
#[derive(Debug)]
pub enum ParamsError {
    Io(io::Error),
    Parse(serde_json::Error),
}

impl fmt::Display for ParamsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamsError::Io(e) => write!(f, "failed to read parameter file: {}", e),
            ParamsError::Parse(e) => write!(f, "failed to parse parameter file: {}", e),
        }
    }
}

impl std::error::Error for ParamsError {}

impl From<io::Error> for ParamsError {
    fn from(e: io::Error) -> Self {
        ParamsError::Io(e)
    }
}

impl From<serde_json::Error> for ParamsError {
    fn from(e: serde_json::Error) -> Self {
        ParamsError::Parse(e)
    }
}

/// Per-experiment overrides loaded from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentParams {
    pub expt_id: String,
    pub total_timesteps: u64,
    pub eps_length: usize,
    pub anchor_pol_kl_coef: f32,
    pub td_alpha: f32,
    pub gp_threshold: f32,
    #[serde(default)]
    pub switch_after: Option<u64>,
    #[serde(default)]
    pub task: Option<String>,
}

impl ExperimentParams {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ParamsError> {
        let file = File::open(path.as_ref())?;
        let params = serde_json::from_reader(BufReader::new(file))?;
        Ok(params)
    }

    pub fn apply(&self, mut config: AnchoredPpoConfig) -> AnchoredPpoConfig {
        config.total_timesteps = self.total_timesteps;
        config.eps_length = self.eps_length;
        config.anchor_kl_coef = self.anchor_pol_kl_coef;
        config.td_alpha = self.td_alpha;
        config.gp_threshold = self.gp_threshold;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        assert!(AnchoredPpoConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_counts_are_rejected() {
        let config = AnchoredPpoConfig::default().with_n_steps(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidCount { field: "n_steps", .. })
        ));
    }

    #[test]
    fn gamma_out_of_range_is_rejected() {
        let mut config = AnchoredPpoConfig::default();
        config.gamma = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::OutOfRange { .. })));
    }

    #[test]
    fn single_transition_buffer_is_rejected() {
        let mut config = AnchoredPpoConfig::default().with_n_envs(1).with_n_steps(1);
        config.normalize_advantage = false;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DegenerateBuffer { size: 1 })
        ));
    }

    #[test]
    fn normalization_with_unit_batch_is_rejected() {
        let config = AnchoredPpoConfig::default().with_batch_size(1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DegenerateBatch { batch_size: 1 })
        ));
    }

    #[test]
    fn indivisible_batch_is_accepted_with_warning() {
        let config = AnchoredPpoConfig::default()
            .with_n_steps(10)
            .with_batch_size(3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn experiment_params_load_and_apply() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "expt_id": "run_01",
                "total_timesteps": 5000000,
                "eps_length": 500,
                "anchor_pol_kl_coef": 0.25,
                "td_alpha": 0.05,
                "gp_threshold": 800.0,
                "task": "half_cheetah"
            }}"#
        )
        .unwrap();

        let params = ExperimentParams::from_file(file.path()).unwrap();
        assert_eq!(params.expt_id, "run_01");
        assert_eq!(params.task.as_deref(), Some("half_cheetah"));
        assert!(params.switch_after.is_none());

        let config = params.apply(AnchoredPpoConfig::default());
        assert_eq!(config.total_timesteps, 5_000_000);
        assert_eq!(config.eps_length, 500);
        assert!((config.anchor_kl_coef - 0.25).abs() < 1e-6);
        assert!((config.gp_threshold - 800.0).abs() < 1e-6);
    }

    #[test]
    fn missing_params_file_is_io_error() {
        let err = ExperimentParams::from_file("/nonexistent/params.json").unwrap_err();
        assert!(matches!(err, ParamsError::Io(_)));
    }
}
