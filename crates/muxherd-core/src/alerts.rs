//! Operator alerts for supervisor events
//!
//! Restart escalations, restart-cap rejections, health transitions and
//! backoff entries all surface here so callers can attach a sink once and
//! observe every recovery decision the core makes.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Alert types emitted by the supervision layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Alert {
    /// A hard restart succeeded and the agent's conversation context was lost
    ContextLoss {
        pane_id: String,
        session: String,
        agent_type: String,
        at: DateTime<Utc>,
    },

    /// A restart attempt was rejected by the rolling-hour cap
    MaxRestarts {
        pane_id: String,
        session: String,
        attempts: u32,
        cap: u32,
        at: DateTime<Utc>,
    },

    /// A tracked agent changed health state
    HealthTransition {
        pane_id: String,
        from: String,
        to: String,
        reason: String,
        at: DateTime<Utc>,
    },

    /// A rate-limit event put (or kept) a pane in backoff
    BackoffStarted {
        pane_id: String,
        duration_ms: u64,
        backoff_count: u32,
        at: DateTime<Utc>,
    },
}

impl Alert {
    /// Pane the alert refers to.
    #[must_use]
    pub fn pane_id(&self) -> &str {
        match self {
            Self::ContextLoss { pane_id, .. }
            | Self::MaxRestarts { pane_id, .. }
            | Self::HealthTransition { pane_id, .. }
            | Self::BackoffStarted { pane_id, .. } => pane_id,
        }
    }
}

/// Capability for receiving alerts. One method; implementations decide
/// whether to log, buffer, or forward.
pub trait AlertSink: Send + Sync {
    /// Deliver a single alert.
    fn emit(&self, alert: Alert);
}

/// Default sink: structured log lines via `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn emit(&self, alert: Alert) {
        match &alert {
            Alert::ContextLoss {
                pane_id,
                session,
                agent_type,
                ..
            } => {
                warn!(
                    pane_id = %pane_id,
                    session = %session,
                    agent_type = %agent_type,
                    "Hard restart completed; agent context lost"
                );
            }
            Alert::MaxRestarts {
                pane_id,
                session,
                attempts,
                cap,
                ..
            } => {
                warn!(
                    pane_id = %pane_id,
                    session = %session,
                    attempts,
                    cap,
                    "Restart suppressed by hourly cap"
                );
            }
            Alert::HealthTransition {
                pane_id,
                from,
                to,
                reason,
                ..
            } => {
                info!(
                    pane_id = %pane_id,
                    from = %from,
                    to = %to,
                    reason = %reason,
                    "Agent health transition"
                );
            }
            Alert::BackoffStarted {
                pane_id,
                duration_ms,
                backoff_count,
                ..
            } => {
                info!(
                    pane_id = %pane_id,
                    duration_ms,
                    backoff_count,
                    "Rate-limit backoff started"
                );
            }
        }
    }
}

/// Buffering sink that records alerts for later inspection.
#[derive(Debug, Default)]
pub struct BufferingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl BufferingAlertSink {
    /// Create an empty buffering sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all buffered alerts, leaving the buffer empty.
    pub fn drain(&self) -> Vec<Alert> {
        match self.alerts.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    /// Snapshot of buffered alerts without draining.
    pub fn snapshot(&self) -> Vec<Alert> {
        match self.alerts.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AlertSink for BufferingAlertSink {
    fn emit(&self, alert: Alert) {
        match self.alerts.lock() {
            Ok(mut guard) => guard.push(alert),
            Err(poisoned) => poisoned.into_inner().push(alert),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_serializes_with_snake_case_tag() {
        let alert = Alert::MaxRestarts {
            pane_id: "%3".into(),
            session: "agents".into(),
            attempts: 3,
            cap: 3,
            at: Utc::now(),
        };
        let json = serde_json::to_string(&alert).unwrap();
        assert!(json.contains("max_restarts"));
    }

    #[test]
    fn buffering_sink_records_and_drains() {
        let sink = BufferingAlertSink::new();
        sink.emit(Alert::BackoffStarted {
            pane_id: "%1".into(),
            duration_ms: 30_000,
            backoff_count: 1,
            at: Utc::now(),
        });
        assert_eq!(sink.snapshot().len(), 1);
        let drained = sink.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].pane_id(), "%1");
        assert!(sink.snapshot().is_empty());
    }
}
