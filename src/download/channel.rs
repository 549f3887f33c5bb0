// Progress Channel
use crate::models::ProgressSnapshot;
use parking_lot::RwLock;

/// Last-value-wins slot of progress for one job. Written by the fetch
/// adapter, read by the controller; no history is kept.
pub struct ProgressChannel {
    latest: RwLock<Option<ProgressSnapshot>>,
}

impl ProgressChannel {
    pub fn new() -> Self {
        Self {
            latest: RwLock::new(None),
        }
    }

    /// Get the latest snapshot (None until the engine reports)
    pub fn get(&self) -> Option<ProgressSnapshot> {
        self.latest.read().clone()
    }

    /// Replace the latest snapshot
    pub fn publish(&self, snapshot: ProgressSnapshot) {
        *self.latest.write() = Some(snapshot);
    }

    pub fn reset(&self) {
        *self.latest.write() = None;
    }
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new()
    }
}
