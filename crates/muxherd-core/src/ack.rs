//! Acknowledgment detection after sending a message to agent panes
//!
//! After a send, each target pane's output is captured as a baseline and
//! re-captured on a poll interval. New content is classified, in priority
//! order, as an explicit acknowledgment, an echo of the message, the start
//! of output, or the prompt returning. Panes still unclassified when the
//! deadline passes mark the run as timed out.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::debug;

use crate::activity::{is_idle_prompt_line, last_non_empty_line};
use crate::terminal::{AgentFamily, TerminalAdapter, CAPTURE_DEADLINE};

/// Max bytes of the message used for echo matching.
const MATCH_BYTES: usize = 50;

/// Lines captured per ack poll.
const ACK_LINES: usize = 50;

/// Acknowledgment verbs for the explicit check (case-insensitive).
const ACK_VERBS: &[&str] = &[
    "understood",
    "got it",
    "let me",
    "i'll",
    "okay",
    "ok,",
    "sure",
    "working on",
    "processing",
    "looking at",
    "analyzing",
    "checking",
    "yes",
];

/// How a pane acknowledged (or failed to acknowledge) a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckType {
    /// The idle prompt came back
    PromptReturned,
    /// The message was echoed with follow-up content
    EchoDetected,
    /// An acknowledgment verb appeared
    ExplicitAck,
    /// Fresh output started flowing
    OutputStarted,
    /// Nothing detected
    None,
}

impl fmt::Display for AckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PromptReturned => write!(f, "prompt_returned"),
            Self::EchoDetected => write!(f, "echo_detected"),
            Self::ExplicitAck => write!(f, "explicit_ack"),
            Self::OutputStarted => write!(f, "output_started"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Parameters for one acknowledgment watch.
#[derive(Debug, Clone)]
pub struct AckRequest {
    /// Session the panes belong to
    pub session: String,
    /// Target pane ids
    pub panes: Vec<String>,
    /// Message that was sent
    pub message: String,
    /// Overall deadline
    pub timeout: Duration,
    /// Poll interval
    pub poll: Duration,
}

impl AckRequest {
    /// Request with the default 30 s timeout and 500 ms poll.
    #[must_use]
    pub fn new(session: impl Into<String>, panes: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            panes,
            message: message.into(),
            timeout: Duration::from_secs(30),
            poll: Duration::from_millis(500),
        }
    }
}

/// A confirmed acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckConfirmation {
    pub pane_id: String,
    pub ack_type: AckType,
    pub ack_at: DateTime<Utc>,
    pub latency_ms: u64,
}

/// Result of an acknowledgment watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckReport {
    /// Panes that acknowledged, in detection order
    pub confirmations: Vec<AckConfirmation>,
    /// Panes still unconfirmed at the deadline
    pub pending: Vec<String>,
    /// True when any pane was still pending at the deadline
    pub timed_out: bool,
}

/// Polls panes for acknowledgment of a sent message.
pub struct AckMonitor {
    adapter: Arc<dyn TerminalAdapter>,
}

impl fmt::Debug for AckMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckMonitor").finish_non_exhaustive()
    }
}

impl AckMonitor {
    /// Create a monitor over the given adapter.
    #[must_use]
    pub fn new(adapter: Arc<dyn TerminalAdapter>) -> Self {
        Self { adapter }
    }

    /// Watch the request's panes until every one acknowledges or the
    /// deadline passes. Cancellation resolves within one poll interval.
    pub async fn monitor(
        &self,
        request: &AckRequest,
        families: &HashMap<String, AgentFamily>,
        cancel: &mut watch::Receiver<bool>,
    ) -> AckReport {
        let sent_at = tokio::time::Instant::now();
        let deadline = sent_at + request.timeout;

        let mut initial: HashMap<String, String> = HashMap::new();
        for pane in &request.panes {
            let baseline = self
                .adapter
                .capture(pane, ACK_LINES, Some(CAPTURE_DEADLINE))
                .unwrap_or_default();
            initial.insert(pane.clone(), baseline);
        }

        let mut pending: Vec<String> = request.panes.clone();
        let mut confirmations = Vec::new();

        while !pending.is_empty() && tokio::time::Instant::now() < deadline {
            if !cancellable_sleep(request.poll, cancel).await {
                debug!(session = %request.session, "Ack watch cancelled");
                break;
            }

            pending.retain(|pane| {
                let Ok(current) = self
                    .adapter
                    .capture(pane, ACK_LINES, Some(CAPTURE_DEADLINE))
                else {
                    return true;
                };
                let family = families
                    .get(pane)
                    .copied()
                    .unwrap_or(AgentFamily::Unknown);
                let baseline = initial.get(pane).map_or("", String::as_str);
                let fresh = new_content(baseline, &current);
                let ack_type = classify_ack(family, &request.message, &fresh);
                if ack_type == AckType::None {
                    return true;
                }
                confirmations.push(AckConfirmation {
                    pane_id: pane.clone(),
                    ack_type,
                    ack_at: Utc::now(),
                    latency_ms: sent_at.elapsed().as_millis() as u64,
                });
                false
            });
        }

        AckReport {
            timed_out: !pending.is_empty(),
            confirmations,
            pending,
        }
    }
}

/// Sleep that resolves early on cancellation. Returns false when cancelled.
async fn cancellable_sleep(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    if *cancel.borrow() {
        return false;
    }
    tokio::select! {
        () = sleep(duration) => true,
        changed = cancel.changed() => !(changed.is_err() || *cancel.borrow()),
    }
}

/// Normalize a message for echo matching: first line, at most 50 bytes,
/// truncated on a character boundary.
#[must_use]
pub fn truncate_for_match(message: &str) -> &str {
    let first_line = message.lines().next().unwrap_or("");
    if first_line.len() <= MATCH_BYTES {
        return first_line;
    }
    let mut end = MATCH_BYTES;
    while end > 0 && !first_line.is_char_boundary(end) {
        end -= 1;
    }
    &first_line[..end]
}

/// Content that appeared since the baseline capture. When the pane buffer
/// rolled (the baseline's lines scrolled off), fall back to everything after
/// the last occurrence of the baseline's final line.
#[must_use]
pub fn new_content(initial: &str, current: &str) -> String {
    if initial.is_empty() {
        return current.to_string();
    }
    if let Some(tail) = current.strip_prefix(initial) {
        return tail.to_string();
    }
    if let Some(anchor) = last_non_empty_line(initial) {
        if let Some(pos) = current.rfind(anchor) {
            return current[pos + anchor.len()..].to_string();
        }
    }
    current.to_string()
}

/// Classify new pane content against the sent message.
#[must_use]
pub fn classify_ack(agent_type: AgentFamily, message: &str, new_content: &str) -> AckType {
    if new_content.trim().is_empty() {
        return AckType::None;
    }

    let lower = new_content.to_ascii_lowercase();
    if ACK_VERBS.iter().any(|verb| lower.contains(verb)) {
        return AckType::ExplicitAck;
    }

    // Echo: the full truncated message, with real content following it.
    // A bare partial prefix of the message does not count.
    let needle = truncate_for_match(message);
    if !needle.is_empty() {
        if let Some(pos) = new_content.find(needle) {
            let after = &new_content[pos + needle.len()..];
            let has_follow_up = after.lines().any(|line| {
                let trimmed = line.trim();
                !trimmed.is_empty() && !is_idle_prompt_line(agent_type, trimmed)
            });
            if has_follow_up {
                return AckType::EchoDetected;
            }
        }
    }

    let content_lines = new_content
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !is_idle_prompt_line(agent_type, trimmed)
        })
        .count();
    if content_lines >= 2 {
        return AckType::OutputStarted;
    }

    if last_non_empty_line(new_content)
        .is_some_and(|line| is_idle_prompt_line(agent_type, line))
    {
        return AckType::PromptReturned;
    }

    AckType::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::InMemoryTerminal;

    #[test]
    fn truncation_takes_first_line_and_caps_bytes() {
        assert_eq!(truncate_for_match("short message\nsecond line"), "short message");
        let long = "x".repeat(80);
        assert_eq!(truncate_for_match(&long).len(), 50);
        // Multi-byte truncation lands on a char boundary.
        let wide = "é".repeat(40);
        let truncated = truncate_for_match(&wide);
        assert!(truncated.len() <= 50);
        assert!(wide.starts_with(truncated));
    }

    #[test]
    fn new_content_uses_common_prefix_then_rolling_anchor() {
        assert_eq!(new_content("> ", "> \nhello"), "\nhello");
        // Rolling window: the baseline scrolled off; anchor on its last line.
        let rolled = new_content("old line\nanchor here", "anchor here\nfresh output");
        assert_eq!(rolled, "\nfresh output");
        // No anchor found at all: treat everything as new.
        assert_eq!(new_content("gone", "entirely new"), "entirely new");
    }

    #[test]
    fn explicit_ack_is_case_insensitive() {
        assert_eq!(
            classify_ack(AgentFamily::Claude, "do the thing", "\nLooking at the code\n"),
            AckType::ExplicitAck
        );
        assert_eq!(
            classify_ack(AgentFamily::Claude, "do the thing", "OKAY, starting now"),
            AckType::ExplicitAck
        );
    }

    #[test]
    fn echo_requires_full_truncated_message_and_follow_up() {
        let message = "refactor the parser module";
        // Echo plus trailing content.
        assert_eq!(
            classify_ack(
                AgentFamily::Claude,
                message,
                "refactor the parser module\nstarting with lexer.rs edits",
            ),
            AckType::EchoDetected
        );
        // Echo alone, no follow-up: falls through to the prompt check.
        assert_eq!(
            classify_ack(AgentFamily::Claude, message, "refactor the parser module\n"),
            AckType::None
        );
        // A partial prefix of the message is not an echo.
        assert_eq!(
            classify_ack(
                AgentFamily::Claude,
                message,
                "refactor the parser\nmodule changes pending review",
            ),
            AckType::OutputStarted
        );
    }

    #[test]
    fn output_started_needs_two_content_lines() {
        assert_eq!(
            classify_ack(AgentFamily::Claude, "msg", "one output line\nand another"),
            AckType::OutputStarted
        );
        assert_eq!(
            classify_ack(AgentFamily::Claude, "msg", "single line only"),
            AckType::None
        );
    }

    #[test]
    fn prompt_returned_when_idle_prompt_ends_content() {
        assert_eq!(
            classify_ack(AgentFamily::Claude, "msg", "done\nclaude>"),
            AckType::PromptReturned
        );
    }

    #[test]
    fn classification_is_deterministic() {
        let a = classify_ack(AgentFamily::Codex, "msg", "working on it\nmore");
        let b = classify_ack(AgentFamily::Codex, "msg", "working on it\nmore");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn monitor_confirms_explicit_ack_with_latency() {
        let terminal = Arc::new(InMemoryTerminal::new());
        let pane = terminal.add_pane("agents", 0, "cc");
        terminal.push_output(&pane.id, "> ");
        terminal.push_output(&pane.id, "> \nLooking at the code\n");
        let monitor = AckMonitor::new(terminal);

        let request = AckRequest {
            poll: Duration::from_millis(10),
            timeout: Duration::from_secs(2),
            ..AckRequest::new("agents", vec![pane.id.clone()], "check the tests")
        };
        let families = HashMap::from([(pane.id.clone(), AgentFamily::Claude)]);
        let (_tx, mut rx) = watch::channel(false);

        let report = monitor.monitor(&request, &families, &mut rx).await;
        assert!(!report.timed_out);
        assert_eq!(report.confirmations.len(), 1);
        let confirmation = &report.confirmations[0];
        assert_eq!(confirmation.ack_type, AckType::ExplicitAck);
        assert!(confirmation.latency_ms > 0);
        assert!(report.pending.is_empty());
    }

    #[tokio::test]
    async fn monitor_times_out_with_pending_panes() {
        let terminal = Arc::new(InMemoryTerminal::new());
        let pane = terminal.add_pane("agents", 0, "cc");
        terminal.set_output(&pane.id, "> ");
        let monitor = AckMonitor::new(terminal);

        let request = AckRequest {
            poll: Duration::from_millis(10),
            timeout: Duration::from_millis(50),
            ..AckRequest::new("agents", vec![pane.id.clone()], "hello")
        };
        let families = HashMap::new();
        let (_tx, mut rx) = watch::channel(false);

        let report = monitor.monitor(&request, &families, &mut rx).await;
        assert!(report.timed_out);
        assert_eq!(report.pending, vec![pane.id]);
        assert!(report.confirmations.is_empty());
    }
}
