//! Exponential backoff on rate-limit events
//!
//! Each rate-limit signal puts the pane into (or extends) a backoff window:
//! duration = min(base · 2^n, cap), where n counts consecutive events that
//! arrived while a window was still open. A fresh event after the window
//! expired restarts the schedule at the base duration. Deadlines only ever
//! move forward.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::config::BackoffConfig;

/// Per-pane backoff record.
#[derive(Debug, Clone)]
pub struct RateLimitBackoff {
    /// Pane in backoff
    pub pane_id: String,
    /// Consecutive rate limits while still in backoff (the exponent)
    pub backoff_count: u32,
    /// When the current window closes
    pub backoff_ends_at: Instant,
    /// When the most recent rate limit arrived
    pub last_rate_limit_at: Instant,
    /// Rate limits observed over the pane's lifetime
    pub total_rate_limits: u64,
}

/// Serializable view of a pane's backoff state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffStatus {
    pub pane_id: String,
    pub backoff_count: u32,
    pub remaining_ms: u64,
    pub total_rate_limits: u64,
}

/// Tracks rate-limit backoff windows per pane.
#[derive(Debug)]
pub struct BackoffManager {
    base: Duration,
    max: Duration,
    backoffs: RwLock<HashMap<String, RateLimitBackoff>>,
}

impl Default for BackoffManager {
    fn default() -> Self {
        Self::new(&BackoffConfig::default())
    }
}

impl BackoffManager {
    /// Create a manager with the given schedule endpoints.
    #[must_use]
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base: config.base(),
            max: config.max(),
            backoffs: RwLock::new(HashMap::new()),
        }
    }

    /// Record a rate-limit event now; returns the new window duration.
    pub fn record_rate_limit(&self, pane_id: &str) -> Duration {
        self.record_rate_limit_at(pane_id, Instant::now())
    }

    /// Time-injected variant of [`record_rate_limit`](Self::record_rate_limit).
    pub fn record_rate_limit_at(&self, pane_id: &str, now: Instant) -> Duration {
        let mut backoffs = self.write();
        let entry = backoffs
            .entry(pane_id.to_string())
            .or_insert_with(|| RateLimitBackoff {
                pane_id: pane_id.to_string(),
                backoff_count: 0,
                backoff_ends_at: now,
                last_rate_limit_at: now,
                total_rate_limits: 0,
            });

        if entry.total_rate_limits > 0 && now < entry.backoff_ends_at {
            entry.backoff_count = entry.backoff_count.saturating_add(1);
        } else {
            entry.backoff_count = 0;
        }

        let duration = self.duration_for(entry.backoff_count);
        // Deadlines are monotone: never pull an existing window backwards.
        entry.backoff_ends_at = entry.backoff_ends_at.max(now + duration);
        entry.last_rate_limit_at = now;
        entry.total_rate_limits = entry.total_rate_limits.saturating_add(1);

        debug!(
            pane_id = %pane_id,
            backoff_count = entry.backoff_count,
            duration_ms = duration.as_millis() as u64,
            "Recorded rate limit"
        );
        duration
    }

    /// Whether the pane currently has an open backoff window.
    pub fn is_in_backoff(&self, pane_id: &str) -> bool {
        self.is_in_backoff_at(pane_id, Instant::now())
    }

    /// Time-injected variant of [`is_in_backoff`](Self::is_in_backoff).
    pub fn is_in_backoff_at(&self, pane_id: &str, now: Instant) -> bool {
        self.read()
            .get(pane_id)
            .is_some_and(|b| now < b.backoff_ends_at)
    }

    /// Time left in the pane's backoff window (zero when not in backoff).
    pub fn remaining(&self, pane_id: &str) -> Duration {
        self.remaining_at(pane_id, Instant::now())
    }

    /// Time-injected variant of [`remaining`](Self::remaining).
    pub fn remaining_at(&self, pane_id: &str, now: Instant) -> Duration {
        self.read()
            .get(pane_id)
            .map_or(Duration::ZERO, |b| {
                b.backoff_ends_at.saturating_duration_since(now)
            })
    }

    /// Snapshot of a pane's backoff state.
    pub fn status(&self, pane_id: &str) -> Option<BackoffStatus> {
        self.status_at(pane_id, Instant::now())
    }

    /// Time-injected variant of [`status`](Self::status).
    pub fn status_at(&self, pane_id: &str, now: Instant) -> Option<BackoffStatus> {
        self.read().get(pane_id).map(|b| BackoffStatus {
            pane_id: b.pane_id.clone(),
            backoff_count: b.backoff_count,
            remaining_ms: b.backoff_ends_at.saturating_duration_since(now).as_millis() as u64,
            total_rate_limits: b.total_rate_limits,
        })
    }

    /// Drop a pane's backoff state entirely.
    pub fn clear(&self, pane_id: &str) {
        self.write().remove(pane_id);
    }

    /// Remove entries whose windows have expired.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    /// Time-injected variant of [`sweep`](Self::sweep).
    pub fn sweep_at(&self, now: Instant) {
        self.write().retain(|_, b| now < b.backoff_ends_at);
    }

    /// Panes currently tracked (in or out of window, pre-sweep).
    pub fn tracked_panes(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Sweep expired entries on an interval until cancelled.
    pub async fn sweep_loop(&self, interval: Duration, mut cancel: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                () = tokio::time::sleep(interval) => self.sweep(),
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return;
                    }
                }
            }
        }
    }

    fn duration_for(&self, count: u32) -> Duration {
        let doubled = self
            .base
            .saturating_mul(2u32.saturating_pow(count.min(20)));
        doubled.min(self.max)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, RateLimitBackoff>> {
        match self.backoffs.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, RateLimitBackoff>> {
        match self.backoffs.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_doubles_then_caps() {
        let manager = BackoffManager::default();
        let start = Instant::now();

        let durations: Vec<u64> = (0..6)
            .map(|i| {
                manager
                    .record_rate_limit_at("%1", start + Duration::from_secs(i))
                    .as_secs()
            })
            .collect();
        assert_eq!(durations, vec![30, 60, 120, 240, 300, 300]);
    }

    #[test]
    fn fresh_event_after_expiry_resets_exponent() {
        let manager = BackoffManager::default();
        let start = Instant::now();

        assert_eq!(
            manager.record_rate_limit_at("%1", start).as_secs(),
            30
        );
        assert_eq!(
            manager
                .record_rate_limit_at("%1", start + Duration::from_secs(10))
                .as_secs(),
            60
        );
        // Window ends at start+70; an event well after that starts over.
        assert_eq!(
            manager
                .record_rate_limit_at("%1", start + Duration::from_secs(500))
                .as_secs(),
            30
        );
    }

    #[test]
    fn deadline_is_monotone() {
        let manager = BackoffManager::default();
        let start = Instant::now();
        manager.record_rate_limit_at("%1", start);
        let first_remaining = manager.remaining_at("%1", start);
        manager.record_rate_limit_at("%1", start + Duration::from_secs(1));
        let second_remaining = manager.remaining_at("%1", start + Duration::from_secs(1));
        assert!(second_remaining >= first_remaining.saturating_sub(Duration::from_secs(1)));
    }

    #[test]
    fn queries_reflect_window_state() {
        let manager = BackoffManager::default();
        let start = Instant::now();
        assert!(!manager.is_in_backoff_at("%1", start));
        assert_eq!(manager.remaining_at("%1", start), Duration::ZERO);

        manager.record_rate_limit_at("%1", start);
        assert!(manager.is_in_backoff_at("%1", start + Duration::from_secs(29)));
        assert!(!manager.is_in_backoff_at("%1", start + Duration::from_secs(31)));
        assert_eq!(
            manager.remaining_at("%1", start + Duration::from_secs(10)),
            Duration::from_secs(20)
        );
    }

    #[test]
    fn sweep_removes_expired_entries_only() {
        let manager = BackoffManager::default();
        let start = Instant::now();
        manager.record_rate_limit_at("%old", start);
        manager.record_rate_limit_at("%new", start + Duration::from_secs(100));

        manager.sweep_at(start + Duration::from_secs(60));
        let panes = manager.tracked_panes();
        assert!(!panes.contains(&"%old".to_string()));
        assert!(panes.contains(&"%new".to_string()));
    }

    #[tokio::test]
    async fn sweep_loop_returns_promptly_on_cancel() {
        let manager = std::sync::Arc::new(BackoffManager::default());
        let (tx, rx) = watch::channel(false);
        let handle = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager.sweep_loop(Duration::from_secs(3600), rx).await;
            })
        };
        tx.send(true).expect("receiver alive");
        handle.await.expect("sweeper exits cleanly");
    }

    #[test]
    fn clear_forgets_the_pane() {
        let manager = BackoffManager::default();
        manager.record_rate_limit("%1");
        assert!(manager.status("%1").is_some());
        manager.clear("%1");
        assert!(manager.status("%1").is_none());
        assert!(!manager.is_in_backoff("%1"));
    }
}
