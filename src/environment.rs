/// Outcome of stepping every env in a vectorized environment once.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub rewards: Vec<f32>,
    /// Episode ended this step, either terminally or by truncation.
    pub dones: Vec<bool>,
}

/// Batch of environments stepped in lockstep with discrete actions.
///
/// Observations are written flat, `n_envs * obs_size` values with env 0
/// first. Envs that report done are not auto-reset; the caller decides
/// when to call `reset_envs`.
pub trait VectorizedEnv: Send {
    fn n_envs(&self) -> usize;
    fn obs_size(&self) -> usize;
    fn n_actions(&self) -> usize;

    fn write_observations(&self, buffer: &mut [f32]);
    fn step(&mut self, actions: &[u32]) -> StepResult;
    fn reset_envs(&mut self, env_indices: &[usize]);

    /// How many times the underlying task has changed, for telemetry.
    fn switch_count(&self) -> u64 {
        0
    }

    /// Name of the task currently active, if the env exposes one.
    fn current_task(&self) -> Option<&str> {
        None
    }
}
