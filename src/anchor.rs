use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use rand::Rng;

use crate::policy::PolicyModel;

/// A frozen policy the live policy is being pulled toward.
#[derive(Debug, Clone)]
pub struct AnchorState<S> {
    pub snapshot: S,
    pub timestep: u64,
}

/// KL penalty term of the loss produced for one minibatch.
pub struct AnchorPenalty<B: Backend> {
    /// Mean KL(anchor || current), differentiable through the current
    /// policy only. An exact zero constant when no anchor is set.
    pub term: Tensor<B, 1>,
    pub value: f32,
}

/// Holds the current anchor policy and computes the KL regularizer
/// against it over states the live policy actually visited.
pub struct AnchorManager<S> {
    state: Option<AnchorState<S>>,
    kl_coef: f32,
    sample_size: usize,
}

impl<S> AnchorManager<S> {
    pub fn new(kl_coef: f32, sample_size: usize) -> Self {
        Self {
            state: None,
            kl_coef,
            sample_size,
        }
    }

    pub fn set(&mut self, snapshot: S, timestep: u64) {
        self.state = Some(AnchorState { snapshot, timestep });
    }

    pub fn clear(&mut self) {
        self.state = None;
    }

    pub fn is_set(&self) -> bool {
        self.state.is_some()
    }

    pub fn timestep(&self) -> Option<u64> {
        self.state.as_ref().map(|s| s.timestep)
    }

    pub fn coef(&self) -> f32 {
        self.kl_coef
    }

    /// Full-distribution KL(anchor || current) averaged over
    /// `sample_size` states drawn with replacement from the minibatch
    /// observations. The anchor runs on the inference backend, so
    /// gradients flow only into the current policy.
    pub fn penalty<B, M>(
        &self,
        observations: &[f32],
        obs_size: usize,
        policy: &M,
        device: &B::Device,
    ) -> AnchorPenalty<B>
    where
        B: AutodiffBackend,
        M: PolicyModel<B>,
        S: PolicyModel<B::InnerBackend>,
    {
        let state = match &self.state {
            Some(state) => state,
            None => {
                return AnchorPenalty {
                    term: Tensor::zeros([1], device),
                    value: 0.0,
                }
            }
        };

        let n_states = observations.len() / obs_size;
        let mut rng = rand::thread_rng();
        let mut sampled = Vec::with_capacity(self.sample_size * obs_size);
        for _ in 0..self.sample_size {
            let i = rng.gen_range(0..n_states);
            sampled.extend_from_slice(&observations[i * obs_size..(i + 1) * obs_size]);
        }

        let inner_device = <B::InnerBackend as Backend>::Device::default();
        let anchor_obs = Tensor::<B::InnerBackend, 1>::from_floats(sampled.as_slice(), &inner_device)
            .reshape([self.sample_size, obs_size]);
        let anchor_out = state.snapshot.forward(anchor_obs);
        let n_actions = anchor_out.logits.dims()[1];
        let anchor_probs = anchor_out.probs();
        let anchor_log_probs = (anchor_probs.clone() + 1e-8).log();

        // Re-enter the training backend as constants.
        let probs_data = anchor_probs.into_data();
        let log_probs_data = anchor_log_probs.into_data();
        let anchor_probs = Tensor::<B, 1>::from_floats(probs_data.as_slice::<f32>().unwrap(), device)
            .reshape([self.sample_size, n_actions]);
        let anchor_log_probs =
            Tensor::<B, 1>::from_floats(log_probs_data.as_slice::<f32>().unwrap(), device)
                .reshape([self.sample_size, n_actions]);

        let current_obs = Tensor::<B, 1>::from_floats(sampled.as_slice(), device)
            .reshape([self.sample_size, obs_size]);
        let current_log_probs = policy.forward(current_obs).log_probs();

        let kl = (anchor_probs * (anchor_log_probs - current_log_probs))
            .sum_dim(1)
            .flatten::<1>(0, 1)
            .mean();
        let value = kl.clone().into_data().as_slice::<f32>().unwrap()[0];

        AnchorPenalty { term: kl, value }
    }
}
