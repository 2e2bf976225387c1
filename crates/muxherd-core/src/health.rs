//! Health checks, transition tracking, and the restart supervisor
//!
//! A health check folds three sub-checks over a pane's recent output:
//!
//! - **process**: did the agent process exit (exit banner or bare shell
//!   prompt at the end of the buffer)?
//! - **stall**: is the pane stalled per the activity classifier?
//! - **error**: literal error patterns, categorized, with a parsed wait
//!   hint for rate limits.
//!
//! Fold priority: crashed or hard error ⇒ UNHEALTHY; rate limit ⇒
//! RATE_LIMITED; stalled or idle over five minutes ⇒ DEGRADED; otherwise
//! HEALTHY. Adapter failures are absorbed: the affected sub-check is marked
//! incomplete, its reason records the failure, and overall confidence drops.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::activity::{ActivityClassifier, AgentState};
use crate::alerts::{Alert, AlertSink};
use crate::backoff::BackoffManager;
use crate::capture::OutputCapture;
use crate::error::{Error, Result};
use crate::restart::{RestartManager, RestartResult, RestartType};
use crate::terminal::{AgentFamily, PaneTarget, TerminalAdapter, CAPTURE_DEADLINE};

/// Lines examined by the process and error sub-checks.
const CHECK_LINES: usize = 30;

/// Idle time beyond which a pane is degraded even without a stall verdict.
const IDLE_DEGRADED: Duration = Duration::from_secs(300);

/// Transition ring capacity per pane.
const MAX_TRANSITIONS: usize = 50;

/// Rolling window for restart timestamps and rate-limit hits.
fn metrics_window() -> chrono::Duration {
    chrono::Duration::seconds(3600)
}

/// Confidence multiplier when any sub-check could not complete.
const INCOMPLETE_PENALTY: f64 = 0.8;

/// Supervised health of a single agent pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Responding normally
    Healthy,
    /// Stalled or idle too long
    Degraded,
    /// Crashed or showing hard errors
    Unhealthy,
    /// Backing off after a rate-limit signal
    RateLimited,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::RateLimited => write!(f, "rate_limited"),
        }
    }
}

/// Error categories recognized by the error sub-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    AuthError,
    Crash,
    NetworkError,
}

/// Result of the process sub-check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessCheck {
    /// The agent process appears to have exited
    pub crashed: bool,
    /// Sub-check confidence
    pub confidence: f64,
    /// Whether the sub-check could run to completion
    pub complete: bool,
    /// Failure or finding description
    pub reason: Option<String>,
}

/// Result of the stall sub-check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallCheck {
    /// The pane is stalled
    pub stalled: bool,
    /// Seconds since last output, when known
    pub idle_secs: Option<u64>,
    /// Sub-check confidence
    pub confidence: f64,
    /// Whether the sub-check could run to completion
    pub complete: bool,
    /// Failure or finding description
    pub reason: Option<String>,
}

/// Result of the error sub-check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCheck {
    /// Categories found in the scanned output
    pub categories: BTreeSet<ErrorCategory>,
    /// Suggested wait in seconds parsed near a rate-limit message
    pub wait_hint_secs: Option<u64>,
    /// Sub-check confidence
    pub confidence: f64,
    /// Whether the sub-check could run to completion
    pub complete: bool,
    /// Failure or finding description
    pub reason: Option<String>,
}

/// A folded health check for one pane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Pane the check ran against
    pub pane_id: String,
    /// Agent family in the pane
    pub agent_type: AgentFamily,
    /// Folded health state
    pub state: HealthState,
    /// Product of sub-check confidences, penalized for incompleteness
    pub confidence: f64,
    /// Process sub-check detail
    pub process: ProcessCheck,
    /// Stall sub-check detail
    pub stall: StallCheck,
    /// Error sub-check detail
    pub error: ErrorCheck,
    /// When the check ran
    pub checked_at: DateTime<Utc>,
}

/// One recorded health transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStateTransition {
    pub from: HealthState,
    pub to: HealthState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Per-pane health bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealthMetrics {
    pub pane_id: String,
    pub agent_type: AgentFamily,
    pub current_state: HealthState,
    pub transitions: Vec<HealthStateTransition>,
    pub total_restarts: u64,
    /// Restart timestamps, filtered to the rolling window on read
    pub restart_timestamps: Vec<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub rate_limit_count: u64,
    pub rate_limit_window_hits: u32,
    pub rate_limit_window_end: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub start_time: DateTime<Utc>,
    pub last_restart_time: Option<DateTime<Utc>>,
    pub last_check_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct TrackedAgent {
    metrics: AgentHealthMetrics,
    transitions: VecDeque<HealthStateTransition>,
}

/// Records health transitions and per-pane metrics.
pub struct HealthTracker {
    agents: RwLock<HashMap<String, TrackedAgent>>,
    alerts: Arc<dyn AlertSink>,
}

impl fmt::Debug for HealthTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthTracker").finish_non_exhaustive()
    }
}

impl HealthTracker {
    /// Create a tracker emitting transition alerts into `alerts`.
    #[must_use]
    pub fn new(alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            alerts,
        }
    }

    /// Record the observed state for a pane, appending a transition when the
    /// state changed. Returns the transition, if any.
    pub fn record_state(
        &self,
        pane_id: &str,
        agent_type: AgentFamily,
        state: HealthState,
        reason: &str,
    ) -> Option<HealthStateTransition> {
        self.record_state_at(pane_id, agent_type, state, reason, Utc::now())
    }

    /// Time-injected variant of [`record_state`](Self::record_state).
    pub fn record_state_at(
        &self,
        pane_id: &str,
        agent_type: AgentFamily,
        state: HealthState,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Option<HealthStateTransition> {
        let mut agents = write(&self.agents);
        let tracked = agents
            .entry(pane_id.to_string())
            .or_insert_with(|| TrackedAgent {
                metrics: AgentHealthMetrics {
                    pane_id: pane_id.to_string(),
                    agent_type,
                    current_state: state,
                    transitions: Vec::new(),
                    total_restarts: 0,
                    restart_timestamps: Vec::new(),
                    last_error: None,
                    rate_limit_count: 0,
                    rate_limit_window_hits: 0,
                    rate_limit_window_end: None,
                    consecutive_failures: 0,
                    start_time: now,
                    last_restart_time: None,
                    last_check_time: now,
                },
                transitions: VecDeque::new(),
            });

        let metrics = &mut tracked.metrics;
        metrics.last_check_time = now;

        match state {
            HealthState::Unhealthy | HealthState::RateLimited => {
                metrics.consecutive_failures = metrics.consecutive_failures.saturating_add(1);
                metrics.last_error = Some(reason.to_string());
            }
            HealthState::Healthy => {
                metrics.consecutive_failures = 0;
            }
            HealthState::Degraded => {}
        }

        if state == HealthState::RateLimited {
            metrics.rate_limit_count = metrics.rate_limit_count.saturating_add(1);
            let window_open = metrics.rate_limit_window_end.is_some_and(|end| now < end);
            if window_open {
                metrics.rate_limit_window_hits = metrics.rate_limit_window_hits.saturating_add(1);
            } else {
                metrics.rate_limit_window_hits = 1;
                metrics.rate_limit_window_end = Some(now + metrics_window());
            }
        }

        let previous = metrics.current_state;
        if previous == state && !tracked.transitions.is_empty() {
            return None;
        }
        if previous == state && tracked.transitions.is_empty() {
            // First observation; nothing transitioned yet.
            return None;
        }

        let transition = HealthStateTransition {
            from: previous,
            to: state,
            reason: reason.to_string(),
            at: now,
        };
        metrics.current_state = state;
        tracked.transitions.push_back(transition.clone());
        while tracked.transitions.len() > MAX_TRANSITIONS {
            tracked.transitions.pop_front();
        }

        self.alerts.emit(Alert::HealthTransition {
            pane_id: pane_id.to_string(),
            from: previous.to_string(),
            to: state.to_string(),
            reason: reason.to_string(),
            at: now,
        });
        Some(transition)
    }

    /// Record a completed restart attempt for a pane.
    pub fn record_restart(&self, pane_id: &str) {
        self.record_restart_at(pane_id, Utc::now());
    }

    /// Time-injected variant of [`record_restart`](Self::record_restart).
    pub fn record_restart_at(&self, pane_id: &str, now: DateTime<Utc>) {
        let mut agents = write(&self.agents);
        if let Some(tracked) = agents.get_mut(pane_id) {
            let metrics = &mut tracked.metrics;
            metrics.total_restarts = metrics.total_restarts.saturating_add(1);
            metrics.last_restart_time = Some(now);
            metrics.restart_timestamps.push(now);
            let cutoff = now - metrics_window();
            metrics.restart_timestamps.retain(|t| *t >= cutoff);
        }
    }

    /// The current state for a pane, when tracked.
    pub fn current_state(&self, pane_id: &str) -> Option<HealthState> {
        read(&self.agents)
            .get(pane_id)
            .map(|t| t.metrics.current_state)
    }

    /// Deep-copied metrics for a pane, with restart timestamps filtered to
    /// the rolling window.
    pub fn metrics(&self, pane_id: &str) -> Option<AgentHealthMetrics> {
        self.metrics_at(pane_id, Utc::now())
    }

    /// Time-injected variant of [`metrics`](Self::metrics).
    pub fn metrics_at(&self, pane_id: &str, now: DateTime<Utc>) -> Option<AgentHealthMetrics> {
        read(&self.agents).get(pane_id).map(|tracked| {
            let mut metrics = tracked.metrics.clone();
            metrics.transitions = tracked.transitions.iter().cloned().collect();
            let cutoff = now - metrics_window();
            metrics.restart_timestamps.retain(|t| *t >= cutoff);
            metrics
        })
    }

    /// Pane ids currently tracked.
    pub fn tracked_panes(&self) -> Vec<String> {
        read(&self.agents).keys().cloned().collect()
    }

    /// Forget a pane entirely.
    pub fn forget(&self, pane_id: &str) {
        write(&self.agents).remove(pane_id);
    }
}

// ---------------------------------------------------------------------------
// Sub-checks
// ---------------------------------------------------------------------------

/// Literal error table: pattern → category.
const ERROR_TABLE: &[(&str, ErrorCategory)] = &[
    ("rate limit", ErrorCategory::RateLimit),
    ("rate-limited", ErrorCategory::RateLimit),
    ("too many requests", ErrorCategory::RateLimit),
    ("429", ErrorCategory::RateLimit),
    ("usage limit reached", ErrorCategory::RateLimit),
    ("authentication failed", ErrorCategory::AuthError),
    ("401", ErrorCategory::AuthError),
    ("unauthorized", ErrorCategory::AuthError),
    ("invalid api key", ErrorCategory::AuthError),
    ("panic:", ErrorCategory::Crash),
    ("fatal error", ErrorCategory::Crash),
    ("segmentation fault", ErrorCategory::Crash),
    ("core dumped", ErrorCategory::Crash),
    ("stack trace", ErrorCategory::Crash),
    ("connection refused", ErrorCategory::NetworkError),
    ("connection reset", ErrorCategory::NetworkError),
    ("connection timed out", ErrorCategory::NetworkError),
    ("network unreachable", ErrorCategory::NetworkError),
];

fn error_matcher() -> &'static aho_corasick::AhoCorasick {
    static MATCHER: OnceLock<aho_corasick::AhoCorasick> = OnceLock::new();
    MATCHER.get_or_init(|| {
        aho_corasick::AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .build(ERROR_TABLE.iter().map(|(pattern, _)| *pattern))
            .expect("static error table compiles")
    })
}

fn wait_hint_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)wait\s+(\d+)\s+seconds?",
            r"(?i)retry\s+in\s+(\d+)\s*s(?:ec(?:onds?)?)?\b",
            r"(?i)(\d+)\s+second\s+cooldown",
            r"(?i)retry\s+after\s+(\d+)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static wait-hint regex compiles"))
        .collect()
    })
}

fn exit_banner() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"exited with code \d+").expect("static exit regex compiles"))
}

fn shell_prompt_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:[$%#]|\S+@\S+.*[$%#])\s*$").expect("static prompt regex compiles")
    })
}

/// Scan the tail of a capture for signs the agent process exited.
#[must_use]
pub fn process_check(content: &str) -> ProcessCheck {
    let tail: Vec<&str> = content.lines().rev().take(CHECK_LINES).collect();
    let tail_text = tail.iter().rev().copied().collect::<Vec<_>>().join("\n");

    if exit_banner().is_match(&tail_text) {
        return ProcessCheck {
            crashed: true,
            confidence: 0.9,
            complete: true,
            reason: Some("exit banner in recent output".to_string()),
        };
    }

    let last = tail.iter().find(|line| !line.trim().is_empty());
    if let Some(line) = last {
        if shell_prompt_line().is_match(line.trim()) {
            return ProcessCheck {
                crashed: true,
                confidence: 0.9,
                complete: true,
                reason: Some("shell prompt terminates the buffer".to_string()),
            };
        }
    }

    ProcessCheck {
        crashed: false,
        confidence: 0.9,
        complete: true,
        reason: None,
    }
}

/// Categorize literal error patterns and parse a nearby wait hint.
#[must_use]
pub fn error_check(content: &str) -> ErrorCheck {
    let mut categories = BTreeSet::new();
    for matched in error_matcher().find_iter(content) {
        let (_, category) = ERROR_TABLE[matched.pattern().as_usize()];
        categories.insert(category);
    }

    let wait_hint_secs = if categories.contains(&ErrorCategory::RateLimit) {
        wait_hint_patterns()
            .iter()
            .find_map(|re| re.captures(content))
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .map(|secs| secs.clamp(1, 3600))
    } else {
        None
    };

    let reason = if categories.is_empty() {
        None
    } else {
        Some(format!("matched error categories: {categories:?}"))
    };

    ErrorCheck {
        categories,
        wait_hint_secs,
        confidence: 0.9,
        complete: true,
        reason,
    }
}

fn incomplete_process(reason: String) -> ProcessCheck {
    ProcessCheck {
        crashed: false,
        confidence: 0.5,
        complete: false,
        reason: Some(reason),
    }
}

fn incomplete_error(reason: String) -> ErrorCheck {
    ErrorCheck {
        categories: BTreeSet::new(),
        wait_hint_secs: None,
        confidence: 0.5,
        complete: false,
        reason: Some(reason),
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Per-pane health outcome inside a session-wide check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaneHealthOutcome {
    pub pane_id: String,
    pub agent_type: AgentFamily,
    /// Present when the check could run
    pub check: Option<HealthCheck>,
    /// Why the check is missing or qualified
    pub reason: Option<String>,
}

/// Composes the three sub-checks and drives backoff and restarts.
pub struct HealthSupervisor {
    adapter: Arc<dyn TerminalAdapter>,
    classifier: Arc<ActivityClassifier>,
    tracker: Arc<HealthTracker>,
    backoff: Arc<BackoffManager>,
    restarts: Arc<RestartManager>,
    captures: Arc<OutputCapture>,
    stall_threshold: Duration,
}

impl fmt::Debug for HealthSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthSupervisor").finish_non_exhaustive()
    }
}

impl HealthSupervisor {
    /// Create a supervisor over the given collaborators.
    #[must_use]
    pub fn new(
        adapter: Arc<dyn TerminalAdapter>,
        classifier: Arc<ActivityClassifier>,
        tracker: Arc<HealthTracker>,
        backoff: Arc<BackoffManager>,
        restarts: Arc<RestartManager>,
        captures: Arc<OutputCapture>,
        stall_threshold: Duration,
    ) -> Self {
        Self {
            adapter,
            classifier,
            tracker,
            backoff,
            restarts,
            captures,
            stall_threshold,
        }
    }

    /// The tracker backing this supervisor.
    #[must_use]
    pub fn tracker(&self) -> &Arc<HealthTracker> {
        &self.tracker
    }

    /// The capture store holding the supervisor's recent snapshots.
    #[must_use]
    pub fn captures(&self) -> &Arc<OutputCapture> {
        &self.captures
    }

    /// Run the three sub-checks for one pane and fold them. Capture
    /// failures are absorbed into incomplete sub-checks.
    pub fn check(&self, pane_id: &str, agent_type: AgentFamily) -> HealthCheck {
        self.check_at(pane_id, agent_type, Utc::now())
    }

    /// Time-injected variant of [`check`](Self::check).
    pub fn check_at(
        &self,
        pane_id: &str,
        agent_type: AgentFamily,
        now: DateTime<Utc>,
    ) -> HealthCheck {
        let capture = self
            .adapter
            .capture(pane_id, CHECK_LINES, Some(CAPTURE_DEADLINE));

        let (process, error) = match &capture {
            Ok(content) => {
                self.classifier.observe_at(pane_id, content, now);
                self.captures.record_at(pane_id, content.clone(), now);
                (process_check(content), error_check(content))
            }
            Err(err) => {
                debug!(pane_id = %pane_id, error = %err, "Capture failed during health check");
                (
                    incomplete_process(format!("capture failed: {err}")),
                    incomplete_error(format!("capture failed: {err}")),
                )
            }
        };

        let sample = self.classifier.classify_at(pane_id, agent_type, now);
        let idle_secs = sample
            .last_output_at
            .map(|at| now.signed_duration_since(at).num_seconds().max(0) as u64);
        let idle_exceeds = |threshold: Duration| {
            idle_secs.is_some_and(|idle| idle >= threshold.as_secs())
        };
        let stalled = matches!(sample.state, AgentState::Stalled | AgentState::Error)
            || (sample.state == AgentState::Unknown && idle_exceeds(self.stall_threshold));
        let stall = StallCheck {
            stalled,
            idle_secs,
            confidence: sample.confidence,
            complete: true,
            reason: stalled.then(|| format!("activity state {}", sample.state)),
        };

        let hard_error = error
            .categories
            .iter()
            .any(|c| *c != ErrorCategory::RateLimit);
        let state = if process.crashed || hard_error {
            HealthState::Unhealthy
        } else if error.categories.contains(&ErrorCategory::RateLimit) {
            HealthState::RateLimited
        } else if stall.stalled || idle_exceeds(IDLE_DEGRADED) {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        let mut confidence = process.confidence * stall.confidence * error.confidence;
        if !process.complete || !stall.complete || !error.complete {
            confidence *= INCOMPLETE_PENALTY;
        }

        HealthCheck {
            pane_id: pane_id.to_string(),
            agent_type,
            state,
            confidence,
            process,
            stall,
            error,
            checked_at: now,
        }
    }

    /// Check a pane and record the result into the tracker. A pane in
    /// rate-limit backoff does not transition back to HEALTHY until the
    /// backoff window expires.
    pub fn check_and_record(&self, pane_id: &str, agent_type: AgentFamily) -> HealthCheck {
        let mut check = self.check(pane_id, agent_type);

        if check.state == HealthState::Healthy
            && self.tracker.current_state(pane_id) == Some(HealthState::RateLimited)
            && self.backoff.is_in_backoff(pane_id)
        {
            check.state = HealthState::RateLimited;
        }

        let reason = check
            .error
            .reason
            .clone()
            .or_else(|| check.stall.reason.clone())
            .or_else(|| check.process.reason.clone())
            .unwrap_or_else(|| format!("check folded to {}", check.state));
        self.tracker
            .record_state(pane_id, agent_type, check.state, &reason);

        if check.state == HealthState::RateLimited {
            let duration = self.backoff.record_rate_limit(pane_id);
            let status = self.backoff.status(pane_id);
            self.tracker.alerts.emit(Alert::BackoffStarted {
                pane_id: pane_id.to_string(),
                duration_ms: duration.as_millis() as u64,
                backoff_count: status.map_or(0, |s| s.backoff_count),
                at: Utc::now(),
            });
        }

        check
    }

    /// Check every agent pane of a session, recording states. Per-pane
    /// failures produce an outcome with a reason instead of aborting.
    pub fn check_session(&self, session: &str) -> Result<Vec<PaneHealthOutcome>> {
        if !self.adapter.session_exists(session)? {
            return Err(Error::SessionNotFound(session.to_string()));
        }
        let panes = self.adapter.panes(session)?;

        let mut outcomes = Vec::with_capacity(panes.len());
        for pane in panes {
            let agent_type = pane.agent_family();
            if !agent_type.is_agent() {
                continue;
            }
            let check = self.check_and_record(&pane.id, agent_type);
            let reason = (!check.process.complete || !check.error.complete)
                .then(|| "capture incomplete; confidence reduced".to_string());
            outcomes.push(PaneHealthOutcome {
                pane_id: pane.id,
                agent_type,
                check: Some(check),
                reason,
            });
        }
        Ok(outcomes)
    }

    /// Restart the pane when (and only when) its recorded health warrants
    /// it. RATE_LIMITED panes wait out their backoff window first.
    pub async fn auto_restart_if_unhealthy(
        &self,
        target: &PaneTarget,
        pane_id: &str,
        agent_type: AgentFamily,
        cancel: &mut watch::Receiver<bool>,
    ) -> RestartResult {
        let check = self.check_and_record(pane_id, agent_type);

        match check.state {
            HealthState::Healthy | HealthState::Degraded => RestartResult {
                pane_id: pane_id.to_string(),
                restart_type: RestartType::None,
                success: false,
                context_lost: false,
                attempts_in_window: self.restarts.attempts_in_window(pane_id),
                reason: format!("no restart needed: state is {}", check.state),
            },
            HealthState::RateLimited => {
                let remaining = self.backoff.remaining(pane_id);
                if remaining > Duration::ZERO {
                    return RestartResult {
                        pane_id: pane_id.to_string(),
                        restart_type: RestartType::None,
                        success: false,
                        context_lost: false,
                        attempts_in_window: self.restarts.attempts_in_window(pane_id),
                        reason: format!(
                            "in rate-limit backoff ({}s remaining)",
                            remaining.as_secs()
                        ),
                    };
                }
                self.run_restart(target, pane_id, agent_type, cancel).await
            }
            HealthState::Unhealthy => {
                self.run_restart(target, pane_id, agent_type, cancel).await
            }
        }
    }

    async fn run_restart(
        &self,
        target: &PaneTarget,
        pane_id: &str,
        agent_type: AgentFamily,
        cancel: &mut watch::Receiver<bool>,
    ) -> RestartResult {
        let result = self
            .restarts
            .try_restart(target, pane_id, agent_type, cancel)
            .await;
        if result.restart_type != RestartType::None {
            self.tracker.record_restart(pane_id);
            if result.success {
                self.classifier.forget(pane_id);
                self.tracker.record_state(
                    pane_id,
                    agent_type,
                    HealthState::Healthy,
                    &format!("{} restart succeeded", result.restart_type),
                );
            } else {
                warn!(
                    pane_id = %pane_id,
                    restart_type = %result.restart_type,
                    reason = %result.reason,
                    "Restart attempt failed"
                );
            }
        }
        result
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
