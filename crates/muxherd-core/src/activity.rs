//! Activity state classification
//!
//! Answers "what is the agent doing right now?" from sampled pane output.
//! The classifier keeps a small ring of recent snapshots per pane and
//! derives a state, a confidence, and an output velocity from them.
//!
//! Classification priority:
//!
//! | Rule | State | Confidence |
//! |------|-------|------------|
//! | error pattern in newest snapshot | ERROR | 0.9 |
//! | idle prompt on last non-empty line | WAITING | 0.9 |
//! | velocity > 20 chars/s over ≥ 2 snapshots | GENERATING | up to 0.95 |
//! | zero velocity ≥ stall threshold, no prompt | STALLED | 0.8 |
//! | small bursty velocity, no prompt | THINKING | 0.6 |
//! | otherwise | UNKNOWN | 0.3 |

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ActivityConfig;
use crate::error::Result;
use crate::terminal::{AgentFamily, TerminalAdapter, CAPTURE_DEADLINE};

/// Snapshots retained per pane for velocity estimation.
const SNAPSHOT_RING: usize = 8;

/// Lines requested from the terminal per sample.
const SAMPLE_LINES: usize = 50;

/// Sustained chars/s above which a pane counts as generating.
const GENERATING_VELOCITY: f64 = 20.0;

/// Minimum time span used in velocity division.
const MIN_VELOCITY_SPAN_SECS: f64 = 0.25;

/// Error patterns that force an ERROR classification (case-insensitive).
const ERROR_PATTERNS: &[&str] = &[
    "rate limit",
    "429",
    "authentication failed",
    "401",
    "panic:",
    "fatal error",
    "segmentation fault",
    "stack trace",
    "connection refused",
    "connection reset",
    "connection timed out",
    "network unreachable",
];

/// What an agent is doing, as inferred from its pane output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Idle prompt visible; ready for input
    Waiting,
    /// Low, bursty output with no prompt
    Thinking,
    /// Sustained high-velocity output
    Generating,
    /// Prolonged silence with no prompt
    Stalled,
    /// Error pattern in recent output
    Error,
    /// Not enough signal to decide
    Unknown,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Thinking => write!(f, "thinking"),
            Self::Generating => write!(f, "generating"),
            Self::Stalled => write!(f, "stalled"),
            Self::Error => write!(f, "error"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One classification result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivitySample {
    /// Classified state
    pub state: AgentState,
    /// Confidence in the classification, 0.0–1.0
    pub confidence: f64,
    /// Smoothed output rate in chars/s
    pub velocity: f64,
    /// When the pane last produced new output
    pub last_output_at: Option<DateTime<Utc>>,
    /// Start of the current run of identical states
    pub state_since: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Snapshot {
    content: String,
    at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StateRun {
    state: AgentState,
    since: DateTime<Utc>,
    last_output_at: Option<DateTime<Utc>>,
}

/// Classifies agent activity from pane output snapshots.
#[derive(Debug)]
pub struct ActivityClassifier {
    stall_threshold: Duration,
    snapshots: RwLock<HashMap<String, VecDeque<Snapshot>>>,
    runs: RwLock<HashMap<String, StateRun>>,
    error_matcher: AhoCorasick,
}

impl Default for ActivityClassifier {
    fn default() -> Self {
        Self::new(&ActivityConfig::default())
    }
}

impl ActivityClassifier {
    /// Create a classifier with the given thresholds.
    #[must_use]
    pub fn new(config: &ActivityConfig) -> Self {
        let error_matcher = AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .build(ERROR_PATTERNS)
            .expect("static error patterns compile");
        Self {
            stall_threshold: config.stall_threshold(),
            snapshots: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            error_matcher,
        }
    }

    /// Capture a pane through the adapter, record the snapshot, and classify.
    pub fn sample(
        &self,
        adapter: &dyn TerminalAdapter,
        pane_id: &str,
        agent_type: AgentFamily,
    ) -> Result<ActivitySample> {
        let content = adapter.capture(pane_id, SAMPLE_LINES, Some(CAPTURE_DEADLINE))?;
        let now = Utc::now();
        self.observe_at(pane_id, &content, now);
        Ok(self.classify_at(pane_id, agent_type, now))
    }

    /// Record a snapshot taken now.
    pub fn observe(&self, pane_id: &str, content: &str) {
        self.observe_at(pane_id, content, Utc::now());
    }

    /// Record a snapshot with an explicit timestamp.
    pub fn observe_at(&self, pane_id: &str, content: &str, now: DateTime<Utc>) {
        let changed = {
            let mut snapshots = write(&self.snapshots);
            let ring = snapshots.entry(pane_id.to_string()).or_default();
            let changed = ring.back().is_none_or(|prev| prev.content != content);
            ring.push_back(Snapshot {
                content: content.to_string(),
                at: now,
            });
            while ring.len() > SNAPSHOT_RING {
                ring.pop_front();
            }
            changed
        };

        if changed && !content.is_empty() {
            let mut runs = write(&self.runs);
            let run = runs.entry(pane_id.to_string()).or_insert(StateRun {
                state: AgentState::Unknown,
                since: now,
                last_output_at: None,
            });
            run.last_output_at = Some(now);
        }
    }

    /// Classify the pane from its recorded snapshots, as of now.
    pub fn classify(&self, pane_id: &str, agent_type: AgentFamily) -> ActivitySample {
        self.classify_at(pane_id, agent_type, Utc::now())
    }

    /// Time-injected variant of [`classify`](Self::classify).
    pub fn classify_at(
        &self,
        pane_id: &str,
        agent_type: AgentFamily,
        now: DateTime<Utc>,
    ) -> ActivitySample {
        let (state, confidence, velocity) = self.decide(pane_id, agent_type, now);

        let mut runs = write(&self.runs);
        let run = runs.entry(pane_id.to_string()).or_insert(StateRun {
            state,
            since: now,
            last_output_at: None,
        });
        if run.state != state {
            run.state = state;
            run.since = now;
        }

        ActivitySample {
            state,
            confidence,
            velocity,
            last_output_at: run.last_output_at,
            state_since: run.since,
        }
    }

    /// Forget all snapshots and state runs for a pane.
    pub fn forget(&self, pane_id: &str) {
        write(&self.snapshots).remove(pane_id);
        write(&self.runs).remove(pane_id);
    }

    fn decide(&self, pane_id: &str, agent_type: AgentFamily, now: DateTime<Utc>) -> (AgentState, f64, f64) {
        let snapshots = read(&self.snapshots);
        let Some(ring) = snapshots.get(pane_id).filter(|r| !r.is_empty()) else {
            return (AgentState::Unknown, 0.3, 0.0);
        };

        let newest = ring.back().map_or("", |s| s.content.as_str());

        if self.error_matcher.is_match(newest) {
            return (AgentState::Error, 0.9, 0.0);
        }

        let prompt_visible =
            last_non_empty_line(newest).is_some_and(|line| is_idle_prompt_line(agent_type, line));
        if prompt_visible {
            return (AgentState::Waiting, 0.9, 0.0);
        }

        let velocities = pair_velocities(ring);
        let velocity = overall_velocity(ring);

        // Sustained means the most recent intervals (up to two) all ran hot.
        let window = velocities.len().min(2);
        let sustained = window >= 1
            && velocities[velocities.len() - window..]
                .iter()
                .all(|v| *v > GENERATING_VELOCITY);
        if sustained {
            let confidence = (0.75 + 0.025 * ring.len() as f64).min(0.95);
            return (AgentState::Generating, confidence, velocity);
        }

        let last_output_at = read(&self.runs)
            .get(pane_id)
            .and_then(|run| run.last_output_at);
        let silent_for = last_output_at.map(|at| now.signed_duration_since(at));
        let stalled = velocity == 0.0
            && silent_for.is_some_and(|d| {
                d.to_std()
                    .map(|d| d >= self.stall_threshold)
                    .unwrap_or(false)
            });
        if stalled {
            return (AgentState::Stalled, 0.8, 0.0);
        }

        if velocity > 0.0 {
            return (AgentState::Thinking, 0.6, velocity);
        }

        (AgentState::Unknown, 0.3, velocity)
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

/// Per-pair output rates (chars/s) between consecutive snapshots.
fn pair_velocities(ring: &VecDeque<Snapshot>) -> Vec<f64> {
    let mut velocities = Vec::with_capacity(ring.len().saturating_sub(1));
    let mut iter = ring.iter();
    let Some(mut prev) = iter.next() else {
        return velocities;
    };
    for snap in iter {
        let appended = appended_bytes(&prev.content, &snap.content);
        let span = snap
            .at
            .signed_duration_since(prev.at)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        velocities.push(appended as f64 / span.max(MIN_VELOCITY_SPAN_SECS));
        prev = snap;
    }
    velocities
}

/// Bytes appended across the whole ring divided by its time span.
fn overall_velocity(ring: &VecDeque<Snapshot>) -> f64 {
    if ring.len() < 2 {
        return 0.0;
    }
    let mut appended = 0usize;
    let mut iter = ring.iter();
    let Some(mut prev) = iter.next() else {
        return 0.0;
    };
    for snap in iter {
        appended += appended_bytes(&prev.content, &snap.content);
        prev = snap;
    }
    let span = ring
        .back()
        .zip(ring.front())
        .map_or(0.0, |(newest, oldest)| {
            newest
                .at
                .signed_duration_since(oldest.at)
                .num_milliseconds()
                .max(0) as f64
                / 1000.0
        });
    appended as f64 / span.max(MIN_VELOCITY_SPAN_SECS)
}

/// Bytes present in `new` beyond its common prefix with `old`. Approximates
/// "bytes appended" for rolling capture windows where early lines scroll off.
fn appended_bytes(old: &str, new: &str) -> usize {
    let common = old
        .as_bytes()
        .iter()
        .zip(new.as_bytes())
        .take_while(|(a, b)| a == b)
        .count();
    new.len().saturating_sub(common)
}

/// Last non-empty line of a capture, scanning backwards with `memchr`.
#[must_use]
pub fn last_non_empty_line(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut end = bytes.len();
    loop {
        let start = memchr::memrchr(b'\n', &bytes[..end]).map_or(0, |i| i + 1);
        let line = text[start..end].trim();
        if !line.is_empty() {
            return Some(line);
        }
        if start == 0 {
            return None;
        }
        end = start - 1;
    }
}

/// Whether a line is an idle prompt for the given agent family.
///
/// Generic shell prompts (`>`, `$`, `%`) count for every family; each agent
/// family additionally recognizes its own `name>` prompt.
#[must_use]
pub fn is_idle_prompt_line(agent_type: AgentFamily, line: &str) -> bool {
    let trimmed = line.trim();
    if matches!(trimmed, ">" | "$" | "%") {
        return true;
    }
    let family_prompt = match agent_type {
        AgentFamily::Claude => Some("claude>"),
        AgentFamily::Codex => Some("codex>"),
        AgentFamily::Gemini => Some("gemini>"),
        AgentFamily::User | AgentFamily::Unknown => None,
    };
    match family_prompt {
        Some(prompt) => trimmed.eq_ignore_ascii_case(prompt),
        // Unknown families still recognize any agent-style prompt.
        None => matches!(trimmed, "claude>" | "codex>" | "gemini>"),
    }
}
