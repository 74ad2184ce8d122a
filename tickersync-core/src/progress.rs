//! Shared progress snapshots for long-running sync tasks.
//!
//! Task owners publish whole snapshots; pollers read copies. There is no
//! merge and no expiry: the owner clears its task id when done.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Coarse phase of a sync task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    CheckRange,
    Fetching,
    Rereading,
    Sweeping,
    Done,
    Failed,
}

/// Snapshot published for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub ticker: Option<String>,
    pub processed: usize,
    pub total: usize,
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SyncProgress {
    pub fn new(phase: SyncPhase, processed: usize, total: usize) -> Self {
        Self {
            phase,
            ticker: None,
            processed,
            total,
            message: None,
            updated_at: Utc::now(),
        }
    }

    pub fn for_ticker(mut self, ticker: impl Into<String>) -> Self {
        self.ticker = Some(ticker.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Map of task id → latest snapshot, last write wins.
#[derive(Debug)]
pub struct ProgressStore<S = SyncProgress> {
    tasks: Mutex<HashMap<String, S>>,
}

impl<S> Default for ProgressStore<S> {
    fn default() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }
}

impl<S: Clone> ProgressStore<S> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, S>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the snapshot for `task_id`.
    pub fn update(&self, task_id: impl Into<String>, snapshot: S) {
        self.lock().insert(task_id.into(), snapshot);
    }

    pub fn get(&self, task_id: &str) -> Option<S> {
        self.lock().get(task_id).cloned()
    }

    /// Remove `task_id`. Returns the last snapshot, if any.
    pub fn clear(&self, task_id: &str) -> Option<S> {
        self.lock().remove(task_id)
    }

    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
