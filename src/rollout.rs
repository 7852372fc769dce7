use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::seq::SliceRandom;

use crate::gae::compute_gae;

/// On-policy rollout storage for interleaved multi-env collection.
///
/// Transitions live at `index = step * n_envs + env` in flat vectors.
/// `finalize` must run after collection before minibatches are drawn.
pub struct RolloutBuffer {
    n_envs: usize,
    n_steps: usize,
    obs_size: usize,
    observations: Vec<f32>,
    actions: Vec<u32>,
    rewards: Vec<f32>,
    dones: Vec<bool>,
    values: Vec<f32>,
    log_probs: Vec<f32>,
    advantages: Vec<f32>,
    returns: Vec<f32>,
    step_count: usize,
    finalized: bool,
}

impl RolloutBuffer {
    pub fn new(n_envs: usize, n_steps: usize, obs_size: usize) -> Self {
        let capacity = n_envs * n_steps;
        Self {
            n_envs,
            n_steps,
            obs_size,
            observations: Vec::with_capacity(capacity * obs_size),
            actions: Vec::with_capacity(capacity),
            rewards: Vec::with_capacity(capacity),
            dones: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            log_probs: Vec::with_capacity(capacity),
            advantages: Vec::new(),
            returns: Vec::new(),
            step_count: 0,
            finalized: false,
        }
    }

    /// Appends one step of data for every env.
    pub fn push_step(
        &mut self,
        observations: &[f32],
        actions: &[u32],
        rewards: &[f32],
        dones: &[bool],
        values: &[f32],
        log_probs: &[f32],
    ) {
        debug_assert_eq!(observations.len(), self.n_envs * self.obs_size);
        debug_assert_eq!(actions.len(), self.n_envs);
        debug_assert!(self.step_count < self.n_steps);

        self.observations.extend_from_slice(observations);
        self.actions.extend_from_slice(actions);
        self.rewards.extend_from_slice(rewards);
        self.dones.extend_from_slice(dones);
        self.values.extend_from_slice(values);
        self.log_probs.extend_from_slice(log_probs);
        self.step_count += 1;
    }

    pub fn is_full(&self) -> bool {
        self.step_count >= self.n_steps
    }

    /// Transitions currently stored.
    pub fn len(&self) -> usize {
        self.step_count * self.n_envs
    }

    pub fn is_empty(&self) -> bool {
        self.step_count == 0
    }

    pub fn clear(&mut self) {
        self.observations.clear();
        self.actions.clear();
        self.rewards.clear();
        self.dones.clear();
        self.values.clear();
        self.log_probs.clear();
        self.advantages.clear();
        self.returns.clear();
        self.step_count = 0;
        self.finalized = false;
    }

    /// Computes advantages and returns, bootstrapping each env with its
    /// value estimate for the state after the final step.
    pub fn finalize(&mut self, last_values: &[f32], gamma: f32, gae_lambda: f32) {
        let (advantages, returns) = compute_gae(
            &self.rewards,
            &self.values,
            &self.dones,
            last_values,
            self.n_envs,
            gamma,
            gae_lambda,
        );
        self.advantages = advantages;
        self.returns = returns;
        self.finalized = true;
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn returns(&self) -> &[f32] {
        debug_assert!(self.finalized);
        &self.returns
    }

    /// All observations collected this rollout, flat.
    pub fn observations(&self) -> &[f32] {
        &self.observations
    }

    pub fn obs_size(&self) -> usize {
        self.obs_size
    }

    /// Shuffled index partitions of at most `batch_size` transitions.
    /// The final partition is short when the buffer is not divisible.
    pub fn minibatches(&self, batch_size: usize) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        indices.shuffle(&mut rand::thread_rng());
        indices.chunks(batch_size).map(|c| c.to_vec()).collect()
    }

    /// Gathers the transitions at `indices` into a contiguous batch.
    pub fn batch(&self, indices: &[usize]) -> RolloutBatch {
        debug_assert!(self.finalized);
        let mut batch = RolloutBatch {
            obs_size: self.obs_size,
            observations: Vec::with_capacity(indices.len() * self.obs_size),
            actions: Vec::with_capacity(indices.len()),
            old_log_probs: Vec::with_capacity(indices.len()),
            old_values: Vec::with_capacity(indices.len()),
            advantages: Vec::with_capacity(indices.len()),
            returns: Vec::with_capacity(indices.len()),
        };
        for &i in indices {
            let start = i * self.obs_size;
            batch
                .observations
                .extend_from_slice(&self.observations[start..start + self.obs_size]);
            batch.actions.push(self.actions[i]);
            batch.old_log_probs.push(self.log_probs[i]);
            batch.old_values.push(self.values[i]);
            batch.advantages.push(self.advantages[i]);
            batch.returns.push(self.returns[i]);
        }
        batch
    }
}

/// One minibatch of training data in host memory.
pub struct RolloutBatch {
    pub obs_size: usize,
    pub observations: Vec<f32>,
    pub actions: Vec<u32>,
    pub old_log_probs: Vec<f32>,
    pub old_values: Vec<f32>,
    pub advantages: Vec<f32>,
    pub returns: Vec<f32>,
}

impl RolloutBatch {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn observations_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 2> {
        Tensor::<B, 1>::from_floats(self.observations.as_slice(), device)
            .reshape([self.len(), self.obs_size])
    }

    pub fn old_log_probs_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1> {
        Tensor::from_floats(self.old_log_probs.as_slice(), device)
    }

    pub fn old_values_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1> {
        Tensor::from_floats(self.old_values.as_slice(), device)
    }

    pub fn returns_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1> {
        Tensor::from_floats(self.returns.as_slice(), device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_buffer(n_envs: usize, n_steps: usize, obs_size: usize) -> RolloutBuffer {
        let mut buffer = RolloutBuffer::new(n_envs, n_steps, obs_size);
        for step in 0..n_steps {
            let obs: Vec<f32> = (0..n_envs * obs_size).map(|i| (step * 10 + i) as f32).collect();
            let actions: Vec<u32> = (0..n_envs).map(|e| (e % 2) as u32).collect();
            let rewards = vec![1.0; n_envs];
            let dones = vec![false; n_envs];
            let values = vec![0.5; n_envs];
            let log_probs = vec![-0.7; n_envs];
            buffer.push_step(&obs, &actions, &rewards, &dones, &values, &log_probs);
        }
        buffer
    }

    #[test]
    fn fills_to_capacity() {
        let buffer = filled_buffer(2, 4, 3);
        assert!(buffer.is_full());
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn finalize_populates_advantages_and_returns() {
        let mut buffer = filled_buffer(2, 4, 3);
        buffer.finalize(&[0.5, 0.5], 0.99, 0.95);
        assert_eq!(buffer.returns().len(), 8);
        let batch = buffer.batch(&[0, 3, 7]);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.advantages.len(), 3);
    }

    #[test]
    fn minibatches_partition_all_indices() {
        let mut buffer = filled_buffer(2, 5, 1);
        buffer.finalize(&[0.0, 0.0], 0.99, 0.95);

        let minibatches = buffer.minibatches(4);
        assert_eq!(minibatches.len(), 3);
        assert_eq!(minibatches[2].len(), 2);

        let mut seen: Vec<usize> = minibatches.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn batch_gathers_matching_rows() {
        let mut buffer = filled_buffer(1, 3, 2);
        buffer.finalize(&[0.0], 0.99, 0.95);

        let batch = buffer.batch(&[2]);
        assert_eq!(batch.observations, vec![20.0, 21.0]);
        assert_eq!(batch.old_log_probs, vec![-0.7]);
    }

    #[test]
    fn clear_resets_for_reuse() {
        let mut buffer = filled_buffer(2, 4, 3);
        buffer.finalize(&[0.5, 0.5], 0.99, 0.95);
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(!buffer.is_full());
    }
}
