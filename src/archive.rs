/// Snapshot of a policy that performed well, with its admission context.
#[derive(Debug, Clone)]
pub struct GoodPolicyRecord<S> {
    pub snapshot: S,
    pub mean_reward: f32,
    pub timestep: u64,
}

/// Capacity-bounded store of high-performing policy snapshots.
///
/// Records are kept sorted by timestep, newest first, and truncated to
/// `capacity` after every admission, so retention always favors the
/// most recent qualifying policies.
pub struct GoodPolicyArchive<S> {
    records: Vec<GoodPolicyRecord<S>>,
    threshold: f32,
    capacity: usize,
}

impl<S> GoodPolicyArchive<S> {
    pub fn new(threshold: f32, capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            threshold,
            capacity,
        }
    }

    /// Whether a candidate with this mean reward would be admitted.
    pub fn admits(&self, mean_reward: f32, task_change: bool) -> bool {
        mean_reward >= self.threshold || task_change
    }

    /// Offers a snapshot for admission. Returns true if it was stored.
    pub fn consider(&mut self, snapshot: S, mean_reward: f32, timestep: u64, task_change: bool) -> bool {
        if !self.admits(mean_reward, task_change) {
            return false;
        }
        self.records.push(GoodPolicyRecord {
            snapshot,
            mean_reward,
            timestep,
        });
        self.records.sort_by(|a, b| b.timestep.cmp(&a.timestep));
        self.records.truncate(self.capacity);
        true
    }

    /// The stored record with the highest timestep.
    pub fn most_recent(&self) -> Option<&GoodPolicyRecord<S>> {
        self.records.first()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn records(&self) -> &[GoodPolicyRecord<S>] {
        &self.records
    }
}
