use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;

use crate::anchor::AnchorManager;
use crate::config::AnchoredPpoConfig;
use crate::gae::normalize_advantages;
use crate::policy::{PolicyModel, TrainablePolicy};
use crate::rollout::RolloutBuffer;
use crate::schedule::Schedule;

/// Diagnostics from one gradient phase over a rollout.
#[derive(Debug, Clone)]
pub struct UpdateMetrics {
    pub policy_gradient_loss: f32,
    pub value_loss: f32,
    pub entropy_loss: f32,
    pub approx_kl: f32,
    pub clip_fraction: f32,
    /// Composite loss of the last minibatch processed.
    pub loss: f32,
    pub explained_variance: f32,
    pub clip_surrogate_term: f32,
    pub anchor_penalty_term: f32,
    pub anchor_kl: f32,
    pub clip_range: f32,
    pub clip_range_vf: Option<f32>,
    pub learning_rate: f64,
    pub epochs_completed: usize,
    pub early_stop_epoch: Option<usize>,
}

/// Clipped-surrogate gradient phase: several epochs of shuffled
/// minibatch updates over one rollout, with optional KL early stopping.
pub struct UpdateEngine {
    n_epochs: usize,
    batch_size: usize,
    normalize_advantage: bool,
    ent_coef: f32,
    vf_coef: f32,
    target_kl: Option<f32>,
    learning_rate: Schedule,
    clip_range: Schedule,
    clip_range_vf: Option<Schedule>,
}

impl UpdateEngine {
    pub fn new(config: &AnchoredPpoConfig) -> Self {
        Self {
            n_epochs: config.n_epochs,
            batch_size: config.batch_size,
            normalize_advantage: config.normalize_advantage,
            ent_coef: config.ent_coef,
            vf_coef: config.vf_coef,
            target_kl: config.target_kl,
            learning_rate: config.learning_rate,
            clip_range: config.clip_range,
            clip_range_vf: config.clip_range_vf,
        }
    }

    /// Runs the gradient phase and returns the updated policy with its
    /// diagnostics. The rollout must already be finalized.
    pub fn update<B, M, O, S>(
        &self,
        mut model: M,
        optimizer: &mut O,
        rollout: &RolloutBuffer,
        anchor: &AnchorManager<S>,
        progress_remaining: f32,
        device: &B::Device,
    ) -> (M, UpdateMetrics)
    where
        B: AutodiffBackend,
        M: TrainablePolicy<B>,
        O: Optimizer<M, B>,
        S: PolicyModel<B::InnerBackend>,
    {
        let clip_range = self.clip_range.value(progress_remaining);
        let clip_range_vf = self.clip_range_vf.map(|s| s.value(progress_remaining));
        let learning_rate = self.learning_rate.value(progress_remaining) as f64;

        let mut pg_losses = Vec::new();
        let mut value_losses = Vec::new();
        let mut entropy_losses = Vec::new();
        let mut clip_fractions = Vec::new();
        let mut approx_kls = Vec::new();
        let mut last_loss = 0.0f32;
        let mut clip_surrogate_term = 0.0f32;
        let mut anchor_penalty_term = 0.0f32;
        let mut anchor_kl = 0.0f32;
        let mut early_stop_epoch = None;
        let mut epochs_completed = 0;
        let mut continue_training = true;

        for epoch in 0..self.n_epochs {
            for indices in rollout.minibatches(self.batch_size) {
                let batch = rollout.batch(&indices);
                let batch_len = batch.len();

                let mut advantages = batch.advantages.clone();
                if self.normalize_advantage && batch_len > 1 {
                    normalize_advantages(&mut advantages);
                }
                let advantages = Tensor::<B, 1>::from_floats(advantages.as_slice(), device);

                let observations = batch.observations_tensor::<B>(device);
                let old_log_probs = batch.old_log_probs_tensor::<B>(device);

                let output = model.forward(observations);
                let log_probs = output.action_log_prob(&batch.actions, device);
                let entropy = output.entropy();
                let values = output.values_flat();

                let log_ratio = log_probs.clone() - old_log_probs;
                let ratio = log_ratio.clone().exp();

                let log_ratio_data = log_ratio.into_data();
                let log_ratio_vals: &[f32] = log_ratio_data.as_slice().unwrap();
                let approx_kl = log_ratio_vals
                    .iter()
                    .map(|&d| d.exp() - 1.0 - d)
                    .sum::<f32>()
                    / batch_len as f32;
                let clip_fraction = log_ratio_vals
                    .iter()
                    .filter(|&&d| (d.exp() - 1.0).abs() > clip_range)
                    .count() as f32
                    / batch_len as f32;
                approx_kls.push(approx_kl);
                clip_fractions.push(clip_fraction);

                let surrogate = clipped_surrogate(ratio, advantages, clip_range);
                let penalty =
                    anchor.penalty::<B, M>(&batch.observations, batch.obs_size, &model, device);
                let policy_loss = surrogate.clone() + penalty.term.mul_scalar(anchor.coef());

                let value_loss = value_loss(
                    values,
                    batch.old_values_tensor::<B>(device),
                    batch.returns_tensor::<B>(device),
                    clip_range_vf,
                );
                let entropy_loss = entropy_objective(entropy, &log_probs);

                let loss = policy_loss.clone()
                    + entropy_loss.clone().mul_scalar(self.ent_coef)
                    + value_loss.clone().mul_scalar(self.vf_coef);

                pg_losses.push(scalar(&policy_loss));
                value_losses.push(scalar(&value_loss));
                entropy_losses.push(scalar(&entropy_loss));
                last_loss = scalar(&loss);
                clip_surrogate_term = scalar(&surrogate);
                anchor_penalty_term = penalty.value * anchor.coef();
                anchor_kl = penalty.value;

                if let Some(target) = self.target_kl {
                    if approx_kl > 1.5 * target {
                        early_stop_epoch = Some(epoch);
                        continue_training = false;
                        log::debug!(
                            "early stopping at epoch {} due to approx kl {:.4}",
                            epoch,
                            approx_kl,
                        );
                        break;
                    }
                }

                let grads = loss.backward();
                let grads = GradientsParams::from_grads(grads, &model);
                model = optimizer.step(learning_rate, model, grads);
            }
            epochs_completed = epoch + 1;
            if !continue_training {
                break;
            }
        }

        let metrics = UpdateMetrics {
            policy_gradient_loss: mean(&pg_losses),
            value_loss: mean(&value_losses),
            entropy_loss: mean(&entropy_losses),
            approx_kl: mean(&approx_kls),
            clip_fraction: mean(&clip_fractions),
            loss: last_loss,
            explained_variance: explained_variance(rollout.values(), rollout.returns()),
            clip_surrogate_term,
            anchor_penalty_term,
            anchor_kl,
            clip_range,
            clip_range_vf,
            learning_rate,
            epochs_completed,
            early_stop_epoch,
        };
        (model, metrics)
    }
}

/// Negated clipped-surrogate objective,
/// `-mean(min(ratio * A, clamp(ratio, 1 - eps, 1 + eps) * A))`.
fn clipped_surrogate<B: AutodiffBackend>(
    ratio: Tensor<B, 1>,
    advantages: Tensor<B, 1>,
    clip_range: f32,
) -> Tensor<B, 1> {
    let clipped = ratio.clone().clamp(1.0 - clip_range, 1.0 + clip_range);
    let surr1 = ratio * advantages.clone();
    let surr2 = clipped * advantages;
    -surr1.min_pair(surr2).mean()
}

/// Mean squared error of the value head against empirical returns,
/// with the prediction optionally clipped around its rollout estimate.
fn value_loss<B: AutodiffBackend>(
    values: Tensor<B, 1>,
    old_values: Tensor<B, 1>,
    returns: Tensor<B, 1>,
    clip_range_vf: Option<f32>,
) -> Tensor<B, 1> {
    let predicted = match clip_range_vf {
        Some(clip) => old_values.clone() + (values - old_values).clamp(-clip, clip),
        None => values,
    };
    (predicted - returns).powf_scalar(2.0).mean()
}

/// Entropy bonus as a loss term. Falls back to the sampled estimate
/// `-mean(-log_prob)` when the distribution has no closed form.
fn entropy_objective<B: AutodiffBackend>(
    entropy: Option<Tensor<B, 1>>,
    log_probs: &Tensor<B, 1>,
) -> Tensor<B, 1> {
    match entropy {
        Some(entropy) => -entropy.mean(),
        None => -(-log_probs.clone()).mean(),
    }
}

/// 1 - Var(returns - values) / Var(returns), NaN for constant returns.
fn explained_variance(values: &[f32], returns: &[f32]) -> f32 {
    let n = returns.len() as f32;
    if n == 0.0 {
        return f32::NAN;
    }
    let mean_r = returns.iter().sum::<f32>() / n;
    let var_r = returns.iter().map(|r| (r - mean_r) * (r - mean_r)).sum::<f32>() / n;
    if var_r == 0.0 {
        return f32::NAN;
    }
    let diffs: Vec<f32> = returns.iter().zip(values).map(|(r, v)| r - v).collect();
    let mean_d = diffs.iter().sum::<f32>() / n;
    let var_d = diffs.iter().map(|d| (d - mean_d) * (d - mean_d)).sum::<f32>() / n;
    1.0 - var_d / var_r
}

fn scalar<B: AutodiffBackend>(tensor: &Tensor<B, 1>) -> f32 {
    tensor.clone().into_data().as_slice::<f32>().unwrap()[0]
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::test_model::TestPolicy;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;

    type TestBackend = Autodiff<NdArray<f32>>;
    type InnerPolicy = TestPolicy<NdArray<f32>>;

    fn tensor1(values: &[f32]) -> Tensor<TestBackend, 1> {
        Tensor::from_floats(values, &Default::default())
    }

    #[test]
    fn clipped_surrogate_matches_hand_value_when_clipped() {
        // ratio 1.5, advantage 1.0, clip 0.2: clipped branch wins at -1.2.
        let loss = clipped_surrogate(tensor1(&[1.5]), tensor1(&[1.0]), 0.2);
        let loss = loss.into_data();
        assert!((loss.as_slice::<f32>().unwrap()[0] - (-1.2)).abs() < 1e-6);
    }

    #[test]
    fn surrogate_equals_unclipped_inside_band() {
        let ratios = [0.85, 1.0, 1.15];
        let advantages = [1.0, -2.0, 0.5];
        let loss = clipped_surrogate(tensor1(&ratios), tensor1(&advantages), 0.2);
        let loss = loss.into_data();

        let expected = -ratios
            .iter()
            .zip(&advantages)
            .map(|(r, a)| r * a)
            .sum::<f32>()
            / 3.0;
        assert!((loss.as_slice::<f32>().unwrap()[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn value_loss_clipping_limits_prediction_movement() {
        let unclipped = value_loss(tensor1(&[2.0]), tensor1(&[0.0]), tensor1(&[0.0]), None);
        let clipped = value_loss(tensor1(&[2.0]), tensor1(&[0.0]), tensor1(&[0.0]), Some(0.5));

        assert!((unclipped.into_data().as_slice::<f32>().unwrap()[0] - 4.0).abs() < 1e-6);
        assert!((clipped.into_data().as_slice::<f32>().unwrap()[0] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn entropy_fallback_uses_log_probs() {
        let log_probs = tensor1(&[-1.0, -2.0]);
        let loss = entropy_objective(None, &log_probs);
        // -mean(-log_prob) = mean(log_prob) = -1.5.
        assert!((loss.into_data().as_slice::<f32>().unwrap()[0] - (-1.5)).abs() < 1e-6);
    }

    #[test]
    fn explained_variance_is_nan_for_constant_returns() {
        assert!(explained_variance(&[1.0, 2.0], &[3.0, 3.0]).is_nan());
        assert!((explained_variance(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-6);
    }

    fn filled_rollout(n_steps: usize, obs_size: usize) -> RolloutBuffer {
        let mut rollout = RolloutBuffer::new(1, n_steps, obs_size);
        for step in 0..n_steps {
            let obs: Vec<f32> = (0..obs_size).map(|i| (step + i) as f32 * 0.1).collect();
            rollout.push_step(
                &obs,
                &[(step % 3) as u32],
                &[1.0 + step as f32 * 0.2],
                &[false],
                &[0.3],
                &[-1.1],
            );
        }
        rollout.finalize(&[0.3], 0.99, 0.95);
        rollout
    }

    fn engine(config: &AnchoredPpoConfig) -> UpdateEngine {
        UpdateEngine::new(config)
    }

    #[test]
    fn update_returns_finite_metrics() {
        let device = Default::default();
        let model = TestPolicy::<TestBackend>::new(4, 3, &device);
        let mut optimizer = AdamConfig::new().with_epsilon(1e-5).init();
        let rollout = filled_rollout(8, 4);
        let anchor: AnchorManager<InnerPolicy> = AnchorManager::new(0.1, 4);

        let config = AnchoredPpoConfig::default()
            .with_n_steps(8)
            .with_batch_size(4)
            .with_n_epochs(2);
        let (_, metrics) =
            engine(&config).update(model, &mut optimizer, &rollout, &anchor, 1.0, &device);

        assert!(metrics.policy_gradient_loss.is_finite());
        assert!(metrics.value_loss.is_finite());
        assert!(metrics.entropy_loss.is_finite());
        assert!(metrics.approx_kl.is_finite());
        assert_eq!(metrics.epochs_completed, 2);
        assert!(metrics.early_stop_epoch.is_none());
        assert_eq!(metrics.anchor_kl, 0.0);
    }

    #[test]
    fn tiny_target_kl_stops_after_second_epoch() {
        let device = Default::default();
        let model = TestPolicy::<TestBackend>::new(4, 3, &device);
        let mut optimizer = AdamConfig::new().with_epsilon(1e-5).init();
        let rollout = filled_rollout(8, 4);
        let anchor: AnchorManager<InnerPolicy> = AnchorManager::new(0.1, 4);

        // One full-buffer minibatch per epoch. Epoch 0 has ratio 1 and
        // zero KL, so the first possible stop is epoch 1.
        let config = AnchoredPpoConfig::default()
            .with_n_steps(8)
            .with_batch_size(8)
            .with_n_epochs(10)
            .with_target_kl(Some(1e-12))
            .with_learning_rate(Schedule::Constant(0.1));
        let (_, metrics) =
            engine(&config).update(model, &mut optimizer, &rollout, &anchor, 1.0, &device);

        assert_eq!(metrics.early_stop_epoch, Some(1));
        assert_eq!(metrics.epochs_completed, 2);
    }

    #[test]
    fn extreme_divergence_reports_unattenuated_kl() {
        let device = Default::default();
        let model = TestPolicy::<TestBackend>::new(4, 3, &device);
        let mut optimizer = AdamConfig::new().with_epsilon(1e-5).init();
        let anchor: AnchorManager<InnerPolicy> = AnchorManager::new(0.1, 4);

        // Stored log-probs of -50 give log-ratios near +49, so the KL
        // estimate mean(exp(d) - 1 - d) lands around 1.9e21 and the
        // first minibatch trips the early stop before any step.
        let mut rollout = RolloutBuffer::new(1, 8, 4);
        for step in 0..8 {
            let obs: Vec<f32> = (0..4).map(|i| (step + i) as f32 * 0.1).collect();
            rollout.push_step(&obs, &[0], &[1.0], &[false], &[0.3], &[-50.0]);
        }
        rollout.finalize(&[0.3], 0.99, 0.95);

        let config = AnchoredPpoConfig::default()
            .with_n_steps(8)
            .with_batch_size(8)
            .with_n_epochs(3)
            .with_target_kl(Some(0.01));
        let (_, metrics) =
            engine(&config).update(model, &mut optimizer, &rollout, &anchor, 1.0, &device);

        assert!(metrics.approx_kl > 1e12);
        assert!(metrics.approx_kl.is_finite());
        assert_eq!(metrics.early_stop_epoch, Some(0));
        assert_eq!(metrics.epochs_completed, 1);
    }

    #[test]
    fn short_final_minibatch_of_one_is_tolerated() {
        let device = Default::default();
        let model = TestPolicy::<TestBackend>::new(4, 3, &device);
        let mut optimizer = AdamConfig::new().with_epsilon(1e-5).init();
        let rollout = filled_rollout(5, 4);
        let anchor: AnchorManager<InnerPolicy> = AnchorManager::new(0.1, 4);

        // 5 transitions with batch_size 2 leaves a single-element
        // minibatch whose advantages are passed through unnormalized.
        let config = AnchoredPpoConfig::default()
            .with_n_steps(5)
            .with_batch_size(2)
            .with_n_epochs(1);
        let (_, metrics) =
            engine(&config).update(model, &mut optimizer, &rollout, &anchor, 1.0, &device);

        assert!(metrics.loss.is_finite());
        assert_eq!(metrics.epochs_completed, 1);
    }

    #[test]
    fn anchored_update_reports_positive_penalty() {
        use burn::module::AutodiffModule;

        let device = Default::default();
        let model = TestPolicy::<TestBackend>::new(4, 3, &device);
        let other = TestPolicy::<TestBackend>::new(4, 3, &device);
        let mut optimizer = AdamConfig::new().with_epsilon(1e-5).init();
        let rollout = filled_rollout(8, 4);
        let mut anchor: AnchorManager<InnerPolicy> = AnchorManager::new(0.5, 16);
        anchor.set(other.valid(), 1000);

        let config = AnchoredPpoConfig::default()
            .with_n_steps(8)
            .with_batch_size(8)
            .with_n_epochs(1);
        let (_, metrics) =
            engine(&config).update(model, &mut optimizer, &rollout, &anchor, 1.0, &device);

        assert!(metrics.anchor_kl >= 0.0);
        assert!((metrics.anchor_penalty_term - metrics.anchor_kl * 0.5).abs() < 1e-6);
    }
}
