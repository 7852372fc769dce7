use std::fmt;

use burn::module::{AutodiffModule, Module};
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::activation::softmax;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Int, Tensor};

/// Actor-critic network over a discrete action space.
///
/// `forward` maps a `[batch, obs_size]` observation tensor to action
/// logits and state values in one pass.
pub trait PolicyModel<B: Backend>: Module<B> + Clone + Send + 'static {
    fn forward(&self, observations: Tensor<B, 2>) -> PolicyOutput<B>;
    fn obs_size(&self) -> usize;
    fn n_actions(&self) -> usize;
}

/// Marker for policies that can be trained with gradient descent.
pub trait TrainablePolicy<B: AutodiffBackend>: PolicyModel<B> + AutodiffModule<B> {}

/// Raw network heads for one forward pass.
#[derive(Debug, Clone)]
pub struct PolicyOutput<B: Backend> {
    /// Action logits, `[batch, n_actions]`.
    pub logits: Tensor<B, 2>,
    /// State value estimates, `[batch, 1]`.
    pub values: Tensor<B, 2>,
}

impl<B: Backend> PolicyOutput<B> {
    pub fn probs(&self) -> Tensor<B, 2> {
        softmax(self.logits.clone(), 1)
    }

    pub fn log_probs(&self) -> Tensor<B, 2> {
        (self.probs() + 1e-8).log()
    }

    /// Log-probability of each given action, `[batch]`.
    pub fn action_log_prob(&self, actions: &[u32], device: &B::Device) -> Tensor<B, 1> {
        let batch = actions.len();
        let indices: Vec<i32> = actions.iter().map(|&a| a as i32).collect();
        let actions_2d = Tensor::<B, 1, Int>::from_ints(indices.as_slice(), device).reshape([batch, 1]);
        self.log_probs().gather(1, actions_2d).flatten(0, 1)
    }

    /// Categorical entropy per state, `[batch]`. Returns `None` when no
    /// closed form exists for the output distribution.
    pub fn entropy(&self) -> Option<Tensor<B, 1>> {
        let probs = self.probs();
        let log_probs = (probs.clone() + 1e-8).log();
        Some(-(probs * log_probs).sum_dim(1).flatten(0, 1))
    }

    pub fn values_flat(&self) -> Tensor<B, 1> {
        self.values.clone().flatten(0, 1)
    }

    /// Samples one action per state and returns the actions with their
    /// log-probabilities under the current distribution.
    pub fn sample(&self) -> (Vec<u32>, Vec<f32>) {
        let [batch, n_actions] = self.probs().dims();
        let probs_data = self.probs().into_data();
        let probs: &[f32] = probs_data.as_slice().unwrap();

        let mut actions = Vec::with_capacity(batch);
        let mut log_probs = Vec::with_capacity(batch);
        for row in 0..batch {
            let offset = row * n_actions;
            let sample = fastrand::f32();
            let mut cumulative = 0.0f32;
            let mut action = n_actions - 1;
            for a in 0..n_actions {
                cumulative += probs[offset + a];
                if sample < cumulative {
                    action = a;
                    break;
                }
            }
            actions.push(action as u32);
            log_probs.push((probs[offset + action] + 1e-8).ln());
        }
        (actions, log_probs)
    }
}

/// Failure while capturing a frozen copy of a policy.
#[derive(Debug)]
pub enum SnapshotError {
    Recorder(String),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Recorder(msg) => write!(f, "failed to serialize policy weights: {}", msg),
        }
    }
}

impl std::error::Error for SnapshotError {}

/// Deep-copies a policy onto the inference backend by round-tripping
/// its weights through a byte recorder into a fresh network from
/// `factory`. The copy shares no parameters with the live model.
pub fn snapshot_policy<B, M, F>(
    model: &M,
    factory: F,
    device: &B::Device,
) -> Result<M::InnerModule, SnapshotError>
where
    B: AutodiffBackend,
    M: TrainablePolicy<B>,
    M::InnerModule: PolicyModel<B::InnerBackend>,
    F: Fn(&B::Device) -> M,
{
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let bytes = recorder
        .record(model.clone().into_record(), ())
        .map_err(|e| SnapshotError::Recorder(e.to_string()))?;
    let record = recorder
        .load(bytes, device)
        .map_err(|e| SnapshotError::Recorder(e.to_string()))?;
    Ok(factory(device).load_record(record).valid())
}
