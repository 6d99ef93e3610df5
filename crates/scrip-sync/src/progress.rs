use std::sync::{Arc, Mutex};

use scrip_core::RunCounters;
use scrip_storage::CheckpointStore;
use tracing::{debug, error};

/// Contiguous-completion high-water mark over the shard's pending indices.
///
/// Indices may complete in any order; the mark only moves across a prefix of
/// `pending` in which every entry has completed, so a crash can never skip an
/// unfinished item.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    pending: Vec<usize>,
    done: Vec<bool>,
    cursor: usize,
    base: i64,
}

impl ProgressTracker {
    /// `pending` must be sorted ascending (plan order). `base` is the loaded checkpoint.
    pub fn new(pending: Vec<usize>, base: i64) -> Self {
        let done = vec![false; pending.len()];
        Self {
            pending,
            done,
            cursor: 0,
            base,
        }
    }

    /// Record completion of `index`. Returns the new high-water mark when it moved.
    pub fn complete(&mut self, index: usize) -> Option<i64> {
        let Ok(slot) = self.pending.binary_search(&index) else {
            return None;
        };
        self.done[slot] = true;

        let before = self.cursor;
        while self.cursor < self.done.len() && self.done[self.cursor] {
            self.cursor += 1;
        }
        (self.cursor > before).then(|| self.high_water_mark())
    }

    pub fn high_water_mark(&self) -> i64 {
        match self.cursor {
            0 => self.base,
            n => self.pending[n - 1] as i64,
        }
    }

    pub fn completed(&self) -> usize {
        self.done.iter().filter(|d| **d).count()
    }

    pub fn is_finished(&self) -> bool {
        self.cursor == self.pending.len()
    }
}

/// The tracker plus the durable store it feeds.
#[derive(Debug)]
pub struct CheckpointProgress {
    tracker: Mutex<ProgressTracker>,
    store: Arc<CheckpointStore>,
}

impl CheckpointProgress {
    pub fn new(tracker: ProgressTracker, store: Arc<CheckpointStore>) -> Self {
        Self {
            tracker: Mutex::new(tracker),
            store,
        }
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    pub fn high_water_mark(&self) -> i64 {
        self.tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .high_water_mark()
    }

    /// Mark `indices` complete and persist the mark if it moved. The tracker
    /// lock is released before the file write.
    pub async fn mark_complete(&self, indices: &[usize]) {
        let advanced = {
            let mut tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
            indices
                .iter()
                .filter_map(|i| tracker.complete(*i))
                .max()
        };
        let Some(mark) = advanced else {
            return;
        };
        match self.store.advance(mark).await {
            Ok(true) => debug!(checkpoint = mark, "checkpoint advanced"),
            Ok(false) => {}
            Err(err) => error!(checkpoint = mark, error = %format!("{err:#}"), "checkpoint write failed"),
        }
    }
}

/// Shared counters. The lock is never held across I/O or an await.
#[derive(Debug, Default)]
pub struct RunTally {
    counters: Mutex<RunCounters>,
}

impl RunTally {
    pub fn update(&self, f: impl FnOnce(&mut RunCounters)) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut counters);
    }

    pub fn snapshot(&self) -> RunCounters {
        *self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }
}
