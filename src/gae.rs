//! Generalized Advantage Estimation over interleaved multi-env rollouts.

/// Computes advantages and returns for a rollout laid out as
/// `index = step * n_envs + env`. `last_values` bootstraps each env
/// past the final collected step; episode boundaries cut the recursion.
pub fn compute_gae(
    rewards: &[f32],
    values: &[f32],
    dones: &[bool],
    last_values: &[f32],
    n_envs: usize,
    gamma: f32,
    gae_lambda: f32,
) -> (Vec<f32>, Vec<f32>) {
    let total = rewards.len();
    debug_assert_eq!(values.len(), total);
    debug_assert_eq!(dones.len(), total);
    debug_assert_eq!(last_values.len(), n_envs);
    let n_steps = if n_envs == 0 { 0 } else { total / n_envs };

    let mut advantages = vec![0.0f32; total];
    let mut returns = vec![0.0f32; total];

    for env in 0..n_envs {
        let mut gae = 0.0f32;
        let mut next_value = last_values[env];
        for step in (0..n_steps).rev() {
            let i = step * n_envs + env;
            let not_done = if dones[i] { 0.0 } else { 1.0 };
            let delta = rewards[i] + gamma * next_value * not_done - values[i];
            gae = delta + gamma * gae_lambda * not_done * gae;
            advantages[i] = gae;
            returns[i] = gae + values[i];
            next_value = values[i];
        }
    }

    (advantages, returns)
}

/// Standardizes advantages in place to zero mean and unit variance.
/// Empty slices are a no-op; a single element becomes 0.0.
pub fn normalize_advantages(advantages: &mut [f32]) {
    let n = advantages.len();
    if n == 0 {
        return;
    }
    if n == 1 {
        advantages[0] = 0.0;
        return;
    }

    let mean: f32 = advantages.iter().sum::<f32>() / n as f32;
    let var: f32 = advantages.iter().map(|a| (a - mean) * (a - mean)).sum::<f32>() / n as f32;
    let std = var.sqrt() + 1e-8;
    for a in advantages.iter_mut() {
        *a = (*a - mean) / std;
    }
}
