//! Terminal multiplexer adapter
//!
//! Everything upstream talks to the multiplexer through the
//! [`TerminalAdapter`] trait: enumerate sessions and panes, capture recent
//! output, read last-activity timestamps, and send keystrokes, interrupts or
//! EOF. The real binary lives behind an out-of-tree implementation; the
//! [`InMemoryTerminal`] here backs deterministic tests.
//!
//! Pane titles follow the `"<session>__<type>_<index>"` convention, from
//! which the agent family is inferred.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Agent families we can host in panes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentFamily {
    /// Claude Code (Anthropic)
    Claude,
    /// Codex CLI (OpenAI)
    Codex,
    /// Gemini CLI (Google)
    Gemini,
    /// The user's own shell; never routed to
    User,
    /// Unrecognized pane type
    Unknown,
}

impl fmt::Display for AgentFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Claude => write!(f, "claude"),
            Self::Codex => write!(f, "codex"),
            Self::Gemini => write!(f, "gemini"),
            Self::User => write!(f, "user"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl AgentFamily {
    /// Map a pane-type token to a family.
    #[must_use]
    pub fn from_token(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "cc" | "claude" => Self::Claude,
            "cod" | "codex" => Self::Codex,
            "gmi" | "gemini" => Self::Gemini,
            "user" => Self::User,
            _ => Self::Unknown,
        }
    }

    /// Infer the family from a pane title of the form
    /// `"<session>__<type>_<index>"`. Titles that do not follow the
    /// convention map to [`AgentFamily::Unknown`].
    #[must_use]
    pub fn from_title(title: &str) -> Self {
        let Some((_, rest)) = title.split_once("__") else {
            return Self::Unknown;
        };
        let token = rest.rsplit_once('_').map_or(rest, |(ty, _)| ty);
        Self::from_token(token)
    }

    /// Launch command for a hard restart, when the family has one.
    #[must_use]
    pub fn launch_command(self) -> Option<&'static str> {
        match self {
            Self::Claude => Some("claude"),
            Self::Codex => Some("codex"),
            Self::Gemini => Some("gemini"),
            Self::User | Self::Unknown => None,
        }
    }

    /// Whether panes of this family are agent processes we supervise.
    #[must_use]
    pub const fn is_agent(self) -> bool {
        matches!(self, Self::Claude | Self::Codex | Self::Gemini)
    }
}

/// Address of a pane for key/interrupt delivery: `"<session>:<pane_index>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaneTarget {
    /// Session name
    pub session: String,
    /// Pane index within the session
    pub index: u32,
}

impl PaneTarget {
    /// Create a target from session and pane index.
    #[must_use]
    pub fn new(session: impl Into<String>, index: u32) -> Self {
        Self {
            session: session.into(),
            index,
        }
    }

    /// Parse a `"<session>:<pane_index>"` string.
    pub fn parse(target: &str) -> Result<Self> {
        let (session, index) = target
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidFlag(format!("malformed pane target: {target}")))?;
        let index = index
            .parse()
            .map_err(|_| Error::InvalidFlag(format!("malformed pane index in target: {target}")))?;
        Ok(Self::new(session, index))
    }
}

impl fmt::Display for PaneTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session, self.index)
    }
}

/// Metadata for a single pane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaneInfo {
    /// Multiplexer-assigned pane identifier (stable while the pane lives)
    pub id: String,
    /// Pane index within the session
    pub index: u32,
    /// Pane title
    pub title: String,
    /// Pane type token from the title convention (e.g. "cc", "user")
    pub pane_type: String,
    /// Command currently running in the pane
    pub current_command: String,
}

impl PaneInfo {
    /// Agent family inferred from the pane title.
    #[must_use]
    pub fn agent_family(&self) -> AgentFamily {
        let from_title = AgentFamily::from_title(&self.title);
        if from_title == AgentFamily::Unknown {
            AgentFamily::from_token(&self.pane_type)
        } else {
            from_title
        }
    }
}

/// Interface to the terminal multiplexer. Implementations wrap the real
/// binary; tests use [`InMemoryTerminal`].
pub trait TerminalAdapter: Send + Sync {
    /// Enumerate session names.
    fn list_sessions(&self) -> Result<Vec<String>>;

    /// Whether a session with the given name exists.
    fn session_exists(&self, name: &str) -> Result<bool>;

    /// Enumerate the panes of a session.
    fn panes(&self, session: &str) -> Result<Vec<PaneInfo>>;

    /// Capture the last `lines` lines of a pane's output. Implementations
    /// must bound the call by `deadline` when one is given (the core passes
    /// 2 seconds).
    fn capture(&self, pane_id: &str, lines: usize, deadline: Option<Duration>) -> Result<String>;

    /// Timestamp of the pane's most recent output activity.
    fn last_activity(&self, pane_id: &str) -> Result<DateTime<Utc>>;

    /// Send literal text to a pane, optionally followed by Enter.
    fn send_keys(&self, target: &PaneTarget, text: &str, press_enter: bool) -> Result<()>;

    /// Send an interrupt (Ctrl-C) to a pane.
    fn send_interrupt(&self, target: &PaneTarget) -> Result<()>;

    /// Send EOF (Ctrl-D) to a pane.
    fn send_eof(&self, target: &PaneTarget) -> Result<()>;
}

/// Default capture deadline used by the core when sampling panes.
pub const CAPTURE_DEADLINE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// In-memory adapter
// ---------------------------------------------------------------------------

/// A keystroke recorded by [`InMemoryTerminal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentKeys {
    /// Target the keys were sent to
    pub target: PaneTarget,
    /// Literal text
    pub text: String,
    /// Whether Enter followed
    pub press_enter: bool,
}

#[derive(Debug, Default)]
struct InMemoryState {
    sessions: BTreeMap<String, Vec<PaneInfo>>,
    /// Scripted capture outputs per pane; the front is returned next.
    /// When only one entry remains it is returned repeatedly.
    outputs: HashMap<String, VecDeque<String>>,
    last_activity: HashMap<String, DateTime<Utc>>,
    sent_keys: Vec<SentKeys>,
    interrupts: Vec<PaneTarget>,
    eofs: Vec<PaneTarget>,
}

/// Deterministic in-memory [`TerminalAdapter`] for tests.
///
/// Pane output is scripted: each [`push_output`](Self::push_output) call
/// enqueues the content returned by one future capture, and the final entry
/// repeats forever, so polling loops observe an evolving then stable pane.
#[derive(Debug, Default)]
pub struct InMemoryTerminal {
    state: Mutex<InMemoryState>,
}

impl InMemoryTerminal {
    /// Create an empty in-memory terminal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session (idempotent).
    pub fn add_session(&self, name: &str) {
        let mut state = self.lock();
        state.sessions.entry(name.to_string()).or_default();
    }

    /// Add a pane to a session, creating the session if needed. The title
    /// follows the `"<session>__<type>_<index>"` convention.
    pub fn add_pane(&self, session: &str, index: u32, pane_type: &str) -> PaneInfo {
        let info = PaneInfo {
            id: format!("%{session}-{index}"),
            index,
            title: format!("{session}__{pane_type}_{index}"),
            pane_type: pane_type.to_string(),
            current_command: AgentFamily::from_token(pane_type)
                .launch_command()
                .unwrap_or("bash")
                .to_string(),
        };
        let mut state = self.lock();
        state
            .sessions
            .entry(session.to_string())
            .or_default()
            .push(info.clone());
        info
    }

    /// Replace the scripted output of a pane with a single stable capture.
    pub fn set_output(&self, pane_id: &str, content: &str) {
        let mut state = self.lock();
        let queue = state.outputs.entry(pane_id.to_string()).or_default();
        queue.clear();
        queue.push_back(content.to_string());
    }

    /// Enqueue one future capture's content for a pane.
    pub fn push_output(&self, pane_id: &str, content: &str) {
        let mut state = self.lock();
        state
            .outputs
            .entry(pane_id.to_string())
            .or_default()
            .push_back(content.to_string());
    }

    /// Set the last-activity timestamp for a pane.
    pub fn set_last_activity(&self, pane_id: &str, at: DateTime<Utc>) {
        let mut state = self.lock();
        state.last_activity.insert(pane_id.to_string(), at);
    }

    /// All keystrokes sent so far.
    pub fn sent_keys(&self) -> Vec<SentKeys> {
        self.lock().sent_keys.clone()
    }

    /// All interrupts sent so far.
    pub fn interrupts(&self) -> Vec<PaneTarget> {
        self.lock().interrupts.clone()
    }

    /// All EOFs sent so far.
    pub fn eofs(&self) -> Vec<PaneTarget> {
        self.lock().eofs.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl TerminalAdapter for InMemoryTerminal {
    fn list_sessions(&self) -> Result<Vec<String>> {
        Ok(self.lock().sessions.keys().cloned().collect())
    }

    fn session_exists(&self, name: &str) -> Result<bool> {
        Ok(self.lock().sessions.contains_key(name))
    }

    fn panes(&self, session: &str) -> Result<Vec<PaneInfo>> {
        self.lock()
            .sessions
            .get(session)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(session.to_string()))
    }

    fn capture(&self, pane_id: &str, lines: usize, _deadline: Option<Duration>) -> Result<String> {
        let mut state = self.lock();
        let queue = state
            .outputs
            .get_mut(pane_id)
            .ok_or_else(|| Error::Internal(format!("no scripted output for pane {pane_id}")))?;
        let content = if queue.len() > 1 {
            queue.pop_front().unwrap_or_default()
        } else {
            queue.front().cloned().unwrap_or_default()
        };
        let tail: Vec<&str> = content.lines().collect();
        let start = tail.len().saturating_sub(lines);
        Ok(tail[start..].join("\n"))
    }

    fn last_activity(&self, pane_id: &str) -> Result<DateTime<Utc>> {
        self.lock()
            .last_activity
            .get(pane_id)
            .copied()
            .ok_or_else(|| Error::Internal(format!("no activity recorded for pane {pane_id}")))
    }

    fn send_keys(&self, target: &PaneTarget, text: &str, press_enter: bool) -> Result<()> {
        self.lock().sent_keys.push(SentKeys {
            target: target.clone(),
            text: text.to_string(),
            press_enter,
        });
        Ok(())
    }

    fn send_interrupt(&self, target: &PaneTarget) -> Result<()> {
        self.lock().interrupts.push(target.clone());
        Ok(())
    }

    fn send_eof(&self, target: &PaneTarget) -> Result<()> {
        self.lock().eofs.push(target.clone());
        Ok(())
    }
}
