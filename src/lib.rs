//! Anchored PPO: proximal policy optimization with a policy anchor for
//! continual learning.
//!
//! The trainer couples a standard clipped-surrogate update with three
//! continual-learning pieces. A [`GoodPolicyArchive`] keeps snapshots
//! of policies whose mean episodic reward cleared a threshold, a
//! [`TaskChangeDetector`] fires whenever training crosses a
//! million-step boundary and re-anchors from the archive, and an
//! [`AnchorManager`] adds a KL(anchor || current) penalty over visited
//! states to every policy gradient step, pulling the live policy back
//! toward its last good configuration.
//!
//! Networks implement [`PolicyModel`] over a burn backend; training
//! runs on an autodiff backend while anchor snapshots are evaluated on
//! the inner inference backend.

pub mod anchor;
pub mod archive;
pub mod checkpoint;
pub mod config;
pub mod detector;
pub mod environment;
pub mod gae;
pub mod policy;
pub mod rollout;
pub mod schedule;
pub mod telemetry;
pub mod trainer;
pub mod update;

pub use anchor::{AnchorManager, AnchorPenalty, AnchorState};
pub use archive::{GoodPolicyArchive, GoodPolicyRecord};
pub use checkpoint::{load_params, save_params, CheckpointError};
pub use config::{AnchoredPpoConfig, ConfigError, ExperimentParams, ParamsError};
pub use detector::TaskChangeDetector;
pub use environment::{StepResult, VectorizedEnv};
pub use policy::{snapshot_policy, PolicyModel, PolicyOutput, SnapshotError, TrainablePolicy};
pub use rollout::{RolloutBatch, RolloutBuffer};
pub use schedule::Schedule;
pub use telemetry::{ConsoleSink, CsvSink, MultiSink, NoopSink, TelemetrySink};
pub use trainer::{AnchoredPpo, TrainError};
pub use update::{UpdateEngine, UpdateMetrics};
