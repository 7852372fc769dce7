use std::collections::VecDeque;
use std::fmt;

use burn::grad_clipping::GradientClippingConfig;
use burn::optim::{AdamConfig, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;

use crate::anchor::AnchorManager;
use crate::archive::GoodPolicyArchive;
use crate::checkpoint::{load_params, save_params, CheckpointError};
use crate::config::{AnchoredPpoConfig, ConfigError};
use crate::detector::TaskChangeDetector;
use crate::environment::VectorizedEnv;
use crate::policy::{snapshot_policy, PolicyModel, SnapshotError, TrainablePolicy};
use crate::rollout::RolloutBuffer;
use crate::telemetry::TelemetrySink;
use crate::update::UpdateEngine;

/// Failure during a training run.
#[derive(Debug)]
pub enum TrainError {
    Config(ConfigError),
    Snapshot(SnapshotError),
    Checkpoint(CheckpointError),
}

impl fmt::Display for TrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainError::Config(e) => write!(f, "invalid configuration: {}", e),
            TrainError::Snapshot(e) => write!(f, "policy snapshot failed: {}", e),
            TrainError::Checkpoint(e) => write!(f, "checkpoint failed: {}", e),
        }
    }
}

impl std::error::Error for TrainError {}

impl From<ConfigError> for TrainError {
    fn from(e: ConfigError) -> Self {
        TrainError::Config(e)
    }
}

impl From<SnapshotError> for TrainError {
    fn from(e: SnapshotError) -> Self {
        TrainError::Snapshot(e)
    }
}

impl From<CheckpointError> for TrainError {
    fn from(e: CheckpointError) -> Self {
        TrainError::Checkpoint(e)
    }
}

/// PPO trainer with a policy anchor for continual learning.
///
/// Each iteration collects one on-policy rollout, runs the clipped
/// surrogate gradient phase with the anchor KL penalty, lets the task
/// change detector re-anchor from the archive, and offers the current
/// policy to the archive.
pub struct AnchoredPpo<B, M>
where
    B: AutodiffBackend,
    M: TrainablePolicy<B>,
    M::InnerModule: PolicyModel<B::InnerBackend>,
{
    config: AnchoredPpoConfig,
    engine: UpdateEngine,
    anchor: AnchorManager<M::InnerModule>,
    archive: GoodPolicyArchive<M::InnerModule>,
    detector: TaskChangeDetector,
    model_factory: Box<dyn Fn(&B::Device) -> M + Send>,
    num_timesteps: u64,
    n_updates: u64,
    iterations: u64,
}

impl<B, M> AnchoredPpo<B, M>
where
    B: AutodiffBackend,
    M: TrainablePolicy<B>,
    M::InnerModule: PolicyModel<B::InnerBackend>,
{
    /// `model_factory` must build networks with the same architecture
    /// as the model passed to `learn`; it backs snapshot capture.
    pub fn new(
        config: AnchoredPpoConfig,
        model_factory: impl Fn(&B::Device) -> M + Send + 'static,
    ) -> Result<Self, TrainError> {
        config.validate()?;
        Ok(Self {
            engine: UpdateEngine::new(&config),
            anchor: AnchorManager::new(config.anchor_kl_coef, config.anchor_sample_size),
            archive: GoodPolicyArchive::new(config.gp_threshold, config.gp_k),
            detector: TaskChangeDetector::new(config.eps_length, config.td_alpha),
            model_factory: Box::new(model_factory),
            num_timesteps: 0,
            n_updates: 0,
            iterations: 0,
            config,
        })
    }

    pub fn num_timesteps(&self) -> u64 {
        self.num_timesteps
    }

    pub fn n_updates(&self) -> u64 {
        self.n_updates
    }

    pub fn archive(&self) -> &GoodPolicyArchive<M::InnerModule> {
        &self.archive
    }

    pub fn anchor(&self) -> &AnchorManager<M::InnerModule> {
        &self.anchor
    }

    pub fn create_optimizer(&self) -> impl Optimizer<M, B> {
        let mut adam = AdamConfig::new().with_epsilon(1e-5);
        if let Some(max_norm) = self.config.max_grad_norm {
            adam = adam.with_grad_clipping(Some(GradientClippingConfig::Norm(max_norm)));
        }
        adam.init()
    }

    /// Trains until `total_timesteps` and returns the final policy.
    pub fn learn<E, O>(
        &mut self,
        mut model: M,
        mut env: E,
        mut optimizer: O,
        sink: &mut dyn TelemetrySink,
        device: &B::Device,
    ) -> Result<M, TrainError>
    where
        E: VectorizedEnv,
        O: Optimizer<M, B>,
    {
        if let Some(path) = self.config.load_params.clone() {
            model = load_params(model, &path, device)?;
            log::info!("loaded initial parameters from {}", path.display());
        }

        let n_envs = env.n_envs();
        let obs_size = env.obs_size();
        let rollout_size = self.config.rollout_size() as u64;
        let mut rollout = RolloutBuffer::new(n_envs, self.config.n_steps, obs_size);
        let mut obs_buffer = vec![0.0f32; n_envs * obs_size];
        let mut episode_rewards = vec![0.0f32; n_envs];
        let mut episode_steps = vec![0usize; n_envs];
        let mut reward_window: VecDeque<f32> =
            VecDeque::with_capacity(self.config.stats_window_size);
        env.reset_envs(&(0..n_envs).collect::<Vec<_>>());

        while self.num_timesteps < self.config.total_timesteps {
            rollout.clear();
            let mut completed_returns = Vec::new();

            while !rollout.is_full() {
                env.write_observations(&mut obs_buffer);
                let observations = Tensor::<B, 1>::from_floats(obs_buffer.as_slice(), device)
                    .reshape([n_envs, obs_size]);
                let output = model.forward(observations);
                let (actions, log_probs) = output.sample();
                let values_data = output.values_flat().into_data();
                let values: Vec<f32> = values_data.as_slice::<f32>().unwrap().to_vec();

                let result = env.step(&actions);
                let mut dones = result.dones.clone();
                let mut to_reset = Vec::new();
                for i in 0..n_envs {
                    episode_rewards[i] += result.rewards[i];
                    episode_steps[i] += 1;
                    if episode_steps[i] >= self.config.eps_length {
                        dones[i] = true;
                    }
                    if dones[i] {
                        completed_returns.push(episode_rewards[i]);
                        if reward_window.len() == self.config.stats_window_size {
                            reward_window.pop_front();
                        }
                        reward_window.push_back(episode_rewards[i]);
                        episode_rewards[i] = 0.0;
                        episode_steps[i] = 0;
                        to_reset.push(i);
                    }
                }

                rollout.push_step(
                    &obs_buffer,
                    &actions,
                    &result.rewards,
                    &dones,
                    &values,
                    &log_probs,
                );
                if !to_reset.is_empty() {
                    env.reset_envs(&to_reset);
                }
            }

            env.write_observations(&mut obs_buffer);
            let observations = Tensor::<B, 1>::from_floats(obs_buffer.as_slice(), device)
                .reshape([n_envs, obs_size]);
            let last_values_data = model.forward(observations).values_flat().into_data();
            let last_values: Vec<f32> = last_values_data.as_slice::<f32>().unwrap().to_vec();
            rollout.finalize(&last_values, self.config.gamma, self.config.gae_lambda);

            self.num_timesteps += rollout_size;
            self.iterations += 1;
            let progress_remaining =
                1.0 - self.num_timesteps as f32 / self.config.total_timesteps as f32;

            let (updated, metrics) = self.engine.update(
                model,
                &mut optimizer,
                &rollout,
                &self.anchor,
                progress_remaining,
                device,
            );
            model = updated;
            self.n_updates += metrics.epochs_completed as u64;

            self.detector.detect(
                &completed_returns,
                self.num_timesteps,
                self.config.n_steps as u64,
                &self.archive,
                &mut self.anchor,
            );

            if !completed_returns.is_empty() {
                let mean_reward =
                    completed_returns.iter().sum::<f32>() / completed_returns.len() as f32;
                if self.archive.admits(mean_reward, false) {
                    let snapshot = snapshot_policy(&model, &*self.model_factory, device)?;
                    self.archive
                        .consider(snapshot, mean_reward, self.num_timesteps, false);
                }
            }

            sink.record("train/loss", metrics.loss as f64);
            sink.record(
                "train/policy_gradient_loss",
                metrics.policy_gradient_loss as f64,
            );
            sink.record("train/value_loss", metrics.value_loss as f64);
            sink.record("train/entropy_loss", metrics.entropy_loss as f64);
            sink.record("train/approx_kl", metrics.approx_kl as f64);
            sink.record("train/clip_fraction", metrics.clip_fraction as f64);
            sink.record("train/explained_variance", metrics.explained_variance as f64);
            sink.record("train/clip_range", metrics.clip_range as f64);
            if let Some(clip_vf) = metrics.clip_range_vf {
                sink.record("train/clip_range_vf", clip_vf as f64);
            }
            sink.record("train/learning_rate", metrics.learning_rate);
            sink.record("train/n_updates", self.n_updates as f64);
            sink.record("train/clip_surrogate", metrics.clip_surrogate_term as f64);
            sink.record("anchor/anchor_penalty", metrics.anchor_penalty_term as f64);
            sink.record("anchor/anchor_kl_div", metrics.anchor_kl as f64);
            sink.record("anchor/anchor_pol_kl_coef", self.anchor.coef() as f64);
            sink.record("anchor/td_counter", self.detector.counter() as f64);
            sink.record("anchor/td_alpha", self.detector.alpha() as f64);
            sink.record("anchor/gp_threshold", self.archive.threshold() as f64);
            sink.record("anchor/gp_size", self.archive.len() as f64);
            if !reward_window.is_empty() {
                let ep_rew_mean =
                    reward_window.iter().sum::<f32>() / reward_window.len() as f32;
                sink.record("rollout/ep_rew_mean", ep_rew_mean as f64);
            }
            sink.record("time/iterations", self.iterations as f64);
            sink.record("env/switches", env.switch_count() as f64);
            if let Some(task) = env.current_task() {
                log::debug!(
                    "env task {} after {} switches at step {}",
                    task,
                    env.switch_count(),
                    self.num_timesteps,
                );
            }
            sink.dump(self.num_timesteps);
        }

        if let Some(path) = self.config.save_params.clone() {
            save_params(&model, &path)?;
            log::info!("saved final parameters to {}", path.display());
        }

        Ok(model)
    }
}
