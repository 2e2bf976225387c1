//! Bounded agent restarts
//!
//! Recovery escalates through two shapes: a soft restart (interrupt, then
//! wait for the agent's idle prompt to come back) and a hard restart
//! (repeated interrupts, EOF, relaunch of the agent binary). Attempts are
//! capped per pane per rolling hour, paced by an exponential pre-attempt
//! delay, and every wait honors an external cancellation signal.
//!
//! Callers must confirm the pane is UNHEALTHY or RATE_LIMITED before
//! invoking [`RestartManager::try_restart`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::alerts::{Alert, AlertSink};
use crate::activity::{is_idle_prompt_line, last_non_empty_line};
use crate::config::RestartConfig;
use crate::terminal::{AgentFamily, PaneTarget, TerminalAdapter, CAPTURE_DEADLINE};

/// Rolling window for the attempt cap.
const RESTART_WINDOW: Duration = Duration::from_secs(3600);

/// Base pre-attempt delay; doubles per prior attempt in the window.
const PRE_DELAY_BASE: Duration = Duration::from_secs(30);

/// Cap on the pre-attempt delay.
const PRE_DELAY_MAX: Duration = Duration::from_secs(300);

/// Interrupts sent before escalating to EOF during a hard restart.
const HARD_INTERRUPTS: u32 = 3;

/// Wait between hard-restart interrupts.
const INTERRUPT_SPACING: Duration = Duration::from_secs(1);

/// Wait after sending the launch command before verifying startup.
const POST_LAUNCH_WAIT: Duration = Duration::from_secs(2);

/// Lines captured when polling for a prompt.
const POLL_LINES: usize = 30;

/// Which restart shape ran (or why none did).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartType {
    /// No restart was attempted
    None,
    /// Interrupt-only recovery; context preserved
    Soft,
    /// Full relaunch; context lost
    Hard,
}

impl std::fmt::Display for RestartType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Soft => write!(f, "soft"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

/// Outcome of a restart request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartResult {
    /// Pane the attempt targeted
    pub pane_id: String,
    /// Shape that ran
    pub restart_type: RestartType,
    /// Whether the agent came back
    pub success: bool,
    /// True after a hard restart; the conversation context is gone
    pub context_lost: bool,
    /// Attempts recorded in the current rolling hour (after this one)
    pub attempts_in_window: u32,
    /// Human-readable explanation
    pub reason: String,
}

impl RestartResult {
    fn none(pane_id: &str, attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            pane_id: pane_id.to_string(),
            restart_type: RestartType::None,
            success: false,
            context_lost: false,
            attempts_in_window: attempts,
            reason: reason.into(),
        }
    }
}

/// Performs soft/hard restarts under a rolling-hour cap.
pub struct RestartManager {
    adapter: Arc<dyn TerminalAdapter>,
    alerts: Arc<dyn AlertSink>,
    config: RestartConfig,
    restart_times: RwLock<HashMap<String, Vec<Instant>>>,
}

impl std::fmt::Debug for RestartManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestartManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RestartManager {
    /// Create a manager over the given adapter and alert sink.
    #[must_use]
    pub fn new(
        adapter: Arc<dyn TerminalAdapter>,
        alerts: Arc<dyn AlertSink>,
        config: RestartConfig,
    ) -> Self {
        Self {
            adapter,
            alerts,
            config,
            restart_times: RwLock::new(HashMap::new()),
        }
    }

    /// Attempts recorded for a pane within the rolling window.
    pub fn attempts_in_window(&self, pane_id: &str) -> u32 {
        self.attempts_in_window_at(pane_id, Instant::now())
    }

    /// Time-injected variant of [`attempts_in_window`](Self::attempts_in_window).
    pub fn attempts_in_window_at(&self, pane_id: &str, now: Instant) -> u32 {
        let times = self.read();
        times.get(pane_id).map_or(0, |stamps| {
            stamps
                .iter()
                .filter(|t| now.saturating_duration_since(**t) < RESTART_WINDOW)
                .count() as u32
        })
    }

    /// Attempt to restart the agent in `target`. Soft first, hard on soft
    /// failure. Returns without attempting when the hourly cap is reached.
    pub async fn try_restart(
        &self,
        target: &PaneTarget,
        pane_id: &str,
        agent_type: AgentFamily,
        cancel: &mut watch::Receiver<bool>,
    ) -> RestartResult {
        let now = Instant::now();
        let prior = self.prune_and_count(pane_id, now);

        if prior >= self.config.max_per_hour {
            let reason = format!(
                "max restarts exceeded ({}/{} per hour)",
                prior, self.config.max_per_hour
            );
            warn!(pane_id = %pane_id, session = %target.session, "Restart suppressed: {reason}");
            self.alerts.emit(Alert::MaxRestarts {
                pane_id: pane_id.to_string(),
                session: target.session.clone(),
                attempts: prior,
                cap: self.config.max_per_hour,
                at: Utc::now(),
            });
            return RestartResult::none(pane_id, prior, reason);
        }

        // Pace repeated attempts: no delay before the first in the window,
        // then 30s, 60s, ... capped at 5 minutes.
        if prior > 0 {
            let delay = pre_attempt_delay(prior);
            if !cancellable_sleep(delay, cancel).await {
                return RestartResult::none(
                    pane_id,
                    prior,
                    "context cancelled during pre-attempt delay",
                );
            }
        }

        let soft = self.soft_restart(target, pane_id, agent_type, cancel).await;
        match soft {
            SoftOutcome::Recovered => {
                let attempts = self.record_attempt(pane_id, Instant::now());
                info!(pane_id = %pane_id, session = %target.session, "Soft restart recovered the agent");
                return RestartResult {
                    pane_id: pane_id.to_string(),
                    restart_type: RestartType::Soft,
                    success: true,
                    context_lost: false,
                    attempts_in_window: attempts,
                    reason: "idle prompt returned after interrupt".to_string(),
                };
            }
            SoftOutcome::Cancelled => {
                return RestartResult::none(pane_id, prior, "context cancelled during soft restart");
            }
            SoftOutcome::TimedOut => {}
        }

        let hard = self.hard_restart(target, pane_id, agent_type, cancel).await;
        match hard {
            HardOutcome::Cancelled => {
                RestartResult::none(pane_id, prior, "context cancelled during hard restart")
            }
            HardOutcome::Unlaunchable => {
                let attempts = self.record_attempt(pane_id, Instant::now());
                RestartResult {
                    pane_id: pane_id.to_string(),
                    restart_type: RestartType::Hard,
                    success: false,
                    context_lost: false,
                    attempts_in_window: attempts,
                    reason: format!("no launch command for agent family {agent_type}"),
                }
            }
            HardOutcome::Finished { verified } => {
                let attempts = self.record_attempt(pane_id, Instant::now());
                if verified {
                    if self.config.notify_on_context_loss {
                        self.alerts.emit(Alert::ContextLoss {
                            pane_id: pane_id.to_string(),
                            session: target.session.clone(),
                            agent_type: agent_type.to_string(),
                            at: Utc::now(),
                        });
                    }
                    warn!(
                        pane_id = %pane_id,
                        session = %target.session,
                        agent_type = %agent_type,
                        "Hard restart relaunched the agent; context lost"
                    );
                }
                RestartResult {
                    pane_id: pane_id.to_string(),
                    restart_type: RestartType::Hard,
                    success: verified,
                    context_lost: verified,
                    attempts_in_window: attempts,
                    reason: if verified {
                        "agent relaunched after hard restart".to_string()
                    } else {
                        "startup indicators missing after relaunch".to_string()
                    },
                }
            }
        }
    }

    async fn soft_restart(
        &self,
        target: &PaneTarget,
        pane_id: &str,
        agent_type: AgentFamily,
        cancel: &mut watch::Receiver<bool>,
    ) -> SoftOutcome {
        if self.adapter.send_interrupt(target).is_err() {
            return SoftOutcome::TimedOut;
        }

        let deadline = tokio::time::Instant::now() + self.config.soft_timeout();
        loop {
            if !cancellable_sleep(self.config.poll_interval(), cancel).await {
                return SoftOutcome::Cancelled;
            }
            if let Ok(content) = self
                .adapter
                .capture(pane_id, POLL_LINES, Some(CAPTURE_DEADLINE))
            {
                let prompt = last_non_empty_line(&content)
                    .is_some_and(|line| is_idle_prompt_line(agent_type, line));
                if prompt {
                    return SoftOutcome::Recovered;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return SoftOutcome::TimedOut;
            }
        }
    }

    async fn hard_restart(
        &self,
        target: &PaneTarget,
        pane_id: &str,
        agent_type: AgentFamily,
        cancel: &mut watch::Receiver<bool>,
    ) -> HardOutcome {
        let Some(launch) = agent_type.launch_command() else {
            return HardOutcome::Unlaunchable;
        };

        for _ in 0..HARD_INTERRUPTS {
            let _ = self.adapter.send_interrupt(target);
            if !cancellable_sleep(INTERRUPT_SPACING, cancel).await {
                return HardOutcome::Cancelled;
            }
        }

        // Still no shell prompt after the interrupts: close the process
        // with EOF before relaunching.
        let shell_prompt = self
            .adapter
            .capture(pane_id, POLL_LINES, Some(CAPTURE_DEADLINE))
            .ok()
            .as_deref()
            .and_then(last_non_empty_line)
            .is_some_and(|line| is_idle_prompt_line(AgentFamily::Unknown, line) || is_shellish(line));
        if !shell_prompt {
            let _ = self.adapter.send_eof(target);
            if !cancellable_sleep(INTERRUPT_SPACING, cancel).await {
                return HardOutcome::Cancelled;
            }
        }

        let _ = self.adapter.send_keys(target, launch, true);
        if !cancellable_sleep(POST_LAUNCH_WAIT, cancel).await {
            return HardOutcome::Cancelled;
        }

        let verified = self
            .adapter
            .capture(pane_id, POLL_LINES, Some(CAPTURE_DEADLINE))
            .map(|content| startup_verified(agent_type, &content))
            .unwrap_or(false);
        HardOutcome::Finished { verified }
    }

    fn prune_and_count(&self, pane_id: &str, now: Instant) -> u32 {
        let mut times = self.write();
        let stamps = times.entry(pane_id.to_string()).or_default();
        stamps.retain(|t| now.saturating_duration_since(*t) < RESTART_WINDOW);
        stamps.len() as u32
    }

    fn record_attempt(&self, pane_id: &str, now: Instant) -> u32 {
        let mut times = self.write();
        let stamps = times.entry(pane_id.to_string()).or_default();
        stamps.push(now);
        stamps.retain(|t| now.saturating_duration_since(*t) < RESTART_WINDOW);
        stamps.len() as u32
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Vec<Instant>>> {
        match self.restart_times.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Vec<Instant>>> {
        match self.restart_times.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

enum SoftOutcome {
    Recovered,
    TimedOut,
    Cancelled,
}

enum HardOutcome {
    Finished { verified: bool },
    Unlaunchable,
    Cancelled,
}

/// Exponential pre-attempt delay for the Nth attempt in the window.
fn pre_attempt_delay(prior_attempts: u32) -> Duration {
    let exponent = prior_attempts.saturating_sub(1).min(10);
    PRE_DELAY_BASE
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(PRE_DELAY_MAX)
}

/// Sleep that resolves early on cancellation. Returns false when cancelled.
async fn cancellable_sleep(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    if *cancel.borrow() {
        return false;
    }
    tokio::select! {
        () = sleep(duration) => true,
        changed = cancel.changed() => {
            // A dropped sender counts as cancellation.
            !(changed.is_err() || *cancel.borrow())
        }
    }
}

/// Loose shell-prompt check used between hard-restart stages.
fn is_shellish(line: &str) -> bool {
    let trimmed = line.trim_end();
    trimmed.ends_with('$') || trimmed.ends_with('%') || trimmed.ends_with('#')
}

/// Startup indicators per agent family after a relaunch.
fn startup_verified(agent_type: AgentFamily, content: &str) -> bool {
    let lower = content.to_ascii_lowercase();
    let name_visible = match agent_type {
        AgentFamily::Claude => lower.contains("claude"),
        AgentFamily::Codex => lower.contains("codex"),
        AgentFamily::Gemini => lower.contains("gemini"),
        AgentFamily::User | AgentFamily::Unknown => false,
    };
    let prompt_visible = last_non_empty_line(content)
        .is_some_and(|line| is_idle_prompt_line(agent_type, line));
    name_visible || prompt_visible
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::BufferingAlertSink;
    use crate::terminal::InMemoryTerminal;

    fn manager(
        terminal: Arc<InMemoryTerminal>,
        sink: Arc<BufferingAlertSink>,
    ) -> RestartManager {
        RestartManager::new(terminal, sink, RestartConfig {
            max_per_hour: 3,
            soft_timeout_secs: 2,
            poll_interval_ms: 10,
            notify_on_context_loss: true,
        })
    }

    fn no_cancel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn soft_restart_recovers_when_prompt_returns() {
        let terminal = Arc::new(InMemoryTerminal::new());
        let pane = terminal.add_pane("agents", 0, "cc");
        terminal.push_output(&pane.id, "stuck output");
        terminal.push_output(&pane.id, "stuck output\nclaude>");
        let sink = Arc::new(BufferingAlertSink::new());
        let manager = manager(terminal.clone(), sink.clone());
        let (_tx, mut rx) = no_cancel();

        let target = PaneTarget::new("agents", 0);
        let result = manager
            .try_restart(&target, &pane.id, AgentFamily::Claude, &mut rx)
            .await;

        assert!(result.success);
        assert_eq!(result.restart_type, RestartType::Soft);
        assert!(!result.context_lost);
        assert_eq!(result.attempts_in_window, 1);
        assert_eq!(terminal.interrupts().len(), 1);
        assert!(sink.snapshot().is_empty());
    }

    #[tokio::test]
    async fn hard_restart_relaunches_and_alerts_context_loss() {
        let terminal = Arc::new(InMemoryTerminal::new());
        let pane = terminal.add_pane("agents", 0, "cc");
        // Never shows a prompt during soft polling; after relaunch the
        // startup banner appears.
        terminal.set_output(&pane.id, "wedged");
        let sink = Arc::new(BufferingAlertSink::new());
        let manager = manager(terminal.clone(), sink.clone());
        let (_tx, mut rx) = no_cancel();

        tokio::time::pause();
        let target = PaneTarget::new("agents", 0);
        let handle = {
            let terminal = terminal.clone();
            let pane_id = pane.id.clone();
            tokio::spawn(async move {
                // Let the soft phase exhaust, then script the relaunch banner.
                tokio::time::sleep(Duration::from_millis(2500)).await;
                terminal.set_output(&pane_id, "Welcome to Claude Code\nclaude>");
            })
        };

        let result = manager
            .try_restart(&target, &pane.id, AgentFamily::Claude, &mut rx)
            .await;
        handle.await.unwrap();

        assert_eq!(result.restart_type, RestartType::Hard);
        assert!(result.success);
        assert!(result.context_lost);
        let keys = terminal.sent_keys();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].text, "claude");
        assert!(keys[0].press_enter);
        let alerts = sink.snapshot();
        assert!(matches!(alerts.as_slice(), [Alert::ContextLoss { .. }]));
    }

    #[tokio::test]
    async fn cap_rejects_fourth_attempt_with_alert() {
        let terminal = Arc::new(InMemoryTerminal::new());
        let pane = terminal.add_pane("agents", 0, "cc");
        terminal.set_output(&pane.id, "busy\nclaude>");
        let sink = Arc::new(BufferingAlertSink::new());
        let manager = manager(terminal.clone(), sink.clone());
        let target = PaneTarget::new("agents", 0);

        tokio::time::pause();
        for attempt in 0..3 {
            let (_tx, mut rx) = no_cancel();
            // Paced delays auto-advance under the paused clock.
            let result = manager
                .try_restart(&target, &pane.id, AgentFamily::Claude, &mut rx)
                .await;
            assert!(result.success, "attempt {attempt} should succeed");
            assert_eq!(result.attempts_in_window, attempt + 1);
        }

        let (_tx, mut rx) = no_cancel();
        let rejected = manager
            .try_restart(&target, &pane.id, AgentFamily::Claude, &mut rx)
            .await;
        assert_eq!(rejected.restart_type, RestartType::None);
        assert!(!rejected.success);
        assert!(rejected.reason.contains("max restarts exceeded (3/3 per hour)"));
        let alerts = sink.snapshot();
        assert!(alerts
            .iter()
            .any(|a| matches!(a, Alert::MaxRestarts { attempts: 3, cap: 3, .. })));
    }

    #[tokio::test]
    async fn cancellation_returns_promptly_and_records_nothing() {
        let terminal = Arc::new(InMemoryTerminal::new());
        let pane = terminal.add_pane("agents", 0, "cc");
        terminal.set_output(&pane.id, "no prompt here");
        let sink = Arc::new(BufferingAlertSink::new());
        let manager = manager(terminal.clone(), sink.clone());
        let target = PaneTarget::new("agents", 0);

        let (tx, mut rx) = no_cancel();
        tx.send(true).unwrap();
        let result = manager
            .try_restart(&target, &pane.id, AgentFamily::Claude, &mut rx)
            .await;

        assert_eq!(result.restart_type, RestartType::None);
        assert!(result.reason.contains("cancelled"));
        assert_eq!(manager.attempts_in_window(&pane.id), 0);
    }

    #[test]
    fn pre_attempt_delays_double_then_cap() {
        assert_eq!(pre_attempt_delay(1), Duration::from_secs(30));
        assert_eq!(pre_attempt_delay(2), Duration::from_secs(60));
        assert_eq!(pre_attempt_delay(3), Duration::from_secs(120));
        assert_eq!(pre_attempt_delay(9), Duration::from_secs(300));
    }
}
