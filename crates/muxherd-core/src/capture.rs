//! Bounded retention of captured pane output
//!
//! Every snapshot the classifier or supervisor pulls from a pane lands here,
//! bounded per pane by count and by age so a long-running process keeps
//! O(panes × window) memory. Pruning happens on write; reads filter by time
//! and then apply the caller's limit.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CaptureConfig;

/// One captured snapshot of a pane's recent output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedOutput {
    /// Pane the capture came from
    pub pane_id: String,
    /// Captured text (last N lines of the pane)
    pub content: String,
    /// When the capture was taken
    pub captured_at: DateTime<Utc>,
}

/// Store of recent captures, bounded per pane.
#[derive(Debug)]
pub struct OutputCapture {
    max_per_pane: usize,
    max_retention: ChronoDuration,
    captures: RwLock<HashMap<String, VecDeque<CapturedOutput>>>,
}

impl OutputCapture {
    /// Create a store with the given bounds.
    #[must_use]
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            max_per_pane: config.max_per_pane.max(1),
            max_retention: ChronoDuration::seconds(config.max_retention_secs as i64),
            captures: RwLock::new(HashMap::new()),
        }
    }

    /// Create a store with default bounds (100 per pane, 1 hour).
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(&CaptureConfig::default())
    }

    /// Record a capture taken now.
    pub fn record(&self, pane_id: &str, content: impl Into<String>) {
        self.record_at(pane_id, content, Utc::now());
    }

    /// Record a capture with an explicit timestamp.
    pub fn record_at(&self, pane_id: &str, content: impl Into<String>, now: DateTime<Utc>) {
        let mut captures = self.write();
        let ring = captures.entry(pane_id.to_string()).or_default();
        ring.push_back(CapturedOutput {
            pane_id: pane_id.to_string(),
            content: content.into(),
            captured_at: now,
        });

        let cutoff = now - self.max_retention;
        while ring
            .front()
            .is_some_and(|c| c.captured_at < cutoff || ring.len() > self.max_per_pane)
        {
            ring.pop_front();
        }
    }

    /// The most recent captures for a pane, oldest first, at most `limit`.
    pub fn recent(&self, pane_id: &str, limit: usize) -> Vec<CapturedOutput> {
        self.recent_at(pane_id, limit, Utc::now())
    }

    /// Time-filtered variant of [`recent`](Self::recent).
    pub fn recent_at(&self, pane_id: &str, limit: usize, now: DateTime<Utc>) -> Vec<CapturedOutput> {
        let cutoff = now - self.max_retention;
        let captures = self.read();
        let Some(ring) = captures.get(pane_id) else {
            return Vec::new();
        };
        let fresh: Vec<CapturedOutput> = ring
            .iter()
            .filter(|c| c.captured_at >= cutoff)
            .cloned()
            .collect();
        let start = fresh.len().saturating_sub(limit);
        fresh[start..].to_vec()
    }

    /// The newest capture for a pane, if any fresh one exists.
    pub fn latest(&self, pane_id: &str) -> Option<CapturedOutput> {
        self.recent(pane_id, 1).pop()
    }

    /// Number of retained captures for a pane.
    pub fn len(&self, pane_id: &str) -> usize {
        self.read().get(pane_id).map_or(0, VecDeque::len)
    }

    /// Whether the pane has no retained captures.
    pub fn is_empty(&self, pane_id: &str) -> bool {
        self.len(pane_id) == 0
    }

    /// Drop all captures for a pane.
    pub fn clear(&self, pane_id: &str) {
        self.write().remove(pane_id);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, VecDeque<CapturedOutput>>> {
        match self.captures.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, VecDeque<CapturedOutput>>> {
        match self.captures.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
