use serde::{Deserialize, Serialize};

/// Scalar hyperparameter schedule evaluated against the fraction of
/// training remaining (1.0 at the first update, 0.0 at the last).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Schedule {
    Constant(f32),
    Linear { initial: f32, end: f32 },
}

impl Schedule {
    pub fn value(&self, progress_remaining: f32) -> f32 {
        let p = progress_remaining.clamp(0.0, 1.0);
        match *self {
            Schedule::Constant(v) => v,
            Schedule::Linear { initial, end } => end + (initial - end) * p,
        }
    }

    pub fn initial(&self) -> f32 {
        match *self {
            Schedule::Constant(v) => v,
            Schedule::Linear { initial, .. } => initial,
        }
    }
}
