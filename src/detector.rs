use std::collections::VecDeque;

use crate::anchor::AnchorManager;
use crate::archive::GoodPolicyArchive;

const STEPS_PER_PHASE: u64 = 1_000_000;
const REWARD_WINDOW_STEPS: usize = 100_000;

/// Watches training progress and re-anchors the policy whenever the
/// step counter crosses a million-step boundary.
///
/// Reward statistics are tracked and logged for diagnosis but do not
/// influence triggering.
pub struct TaskChangeDetector {
    reward_history: VecDeque<f32>,
    window_capacity: usize,
    previous_rewards: Vec<f32>,
    counter: u64,
    alpha: f32,
}

impl TaskChangeDetector {
    pub fn new(eps_length: usize, alpha: f32) -> Self {
        debug_assert!(eps_length > 0);
        let window_capacity = (REWARD_WINDOW_STEPS + eps_length) / eps_length;
        Self {
            reward_history: VecDeque::with_capacity(window_capacity),
            window_capacity,
            previous_rewards: Vec::new(),
            counter: 0,
            alpha,
        }
    }

    /// Times the detector has triggered.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Processes one update's episode returns and decides whether the
    /// counter crossed a boundary since it stood at
    /// `num_timesteps - n_steps`, where `n_steps` is the per-env length
    /// of the last rollout. On a trigger the anchor is replaced with
    /// the archive's most recent snapshot; an empty archive leaves the
    /// anchor untouched.
    pub fn detect<S: Clone>(
        &mut self,
        episode_returns: &[f32],
        num_timesteps: u64,
        n_steps: u64,
        archive: &GoodPolicyArchive<S>,
        anchor: &mut AnchorManager<S>,
    ) -> bool {
        let (prev_mean, prev_std) = mean_std(&self.previous_rewards);
        let (cur_mean, cur_std) = mean_std(episode_returns);
        if !episode_returns.is_empty() {
            if self.reward_history.len() == self.window_capacity {
                self.reward_history.pop_front();
            }
            self.reward_history.push_back(cur_mean);
        }
        log::debug!(
            "reward stats at step {}: prev mean {:.3} std {:.3}, current mean {:.3} std {:.3}",
            num_timesteps,
            prev_mean,
            prev_std,
            cur_mean,
            cur_std,
        );

        let before = num_timesteps.saturating_sub(n_steps) / STEPS_PER_PHASE;
        let after = num_timesteps / STEPS_PER_PHASE;
        let triggered = before != after;

        if triggered {
            self.counter += 1;
            match archive.most_recent() {
                Some(record) => {
                    anchor.set(record.snapshot.clone(), record.timestep);
                    log::info!(
                        "task change {} at step {}: anchored to policy from step {}",
                        self.counter,
                        num_timesteps,
                        record.timestep,
                    );
                }
                None => {
                    log::info!(
                        "task change {} at step {}: archive empty, anchor unchanged",
                        self.counter,
                        num_timesteps,
                    );
                }
            }
        }

        self.previous_rewards = episode_returns.to_vec();
        triggered
    }
}

fn mean_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    (mean, var.sqrt())
}
