//! Cross-agent file conflict detection
//!
//! Correlates three signals per modified file: which panes were active
//! around the modification time, which agents held matching reservations,
//! and what git reports about the file. The join produces graded
//! [`DetectedConflict`] records; only findings with confidence ≥ 0.5 are
//! emitted.
//!
//! Confidence table:
//!
//! | modifiers | holders | confidence | reason |
//! |-----------|---------|------------|--------|
//! | >1 | any | 0.90 | concurrent_activity |
//! | 1 | ≥1, modifier not holder | 0.85 | reservation_violation |
//! | 1 | ≥1, modifier is holder | 0.30 | concurrent_activity |
//! | 0 | >1 | 0.75 | overlapping_reservations |
//! | 0 | 0 | 0.60 | unclaimed_modification |
//! | 1 | 0 | 0.40 | concurrent_activity |
//! | other | other | 0.50 | unclaimed_modification |

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::process::Command;
use std::sync::RwLock;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::reservations::{matches_pattern, FileReservation};
use crate::terminal::AgentFamily;

/// Window retention bound.
const WINDOW_RETENTION_SECS: i64 = 3600;

/// Half-width of the modification correlation window.
const MODIFY_SLACK_SECS: i64 = 60;

/// Minimum confidence for a conflict to be emitted.
const EMIT_THRESHOLD: f64 = 0.5;

/// A recorded span of pane activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityWindow {
    /// Pane that was active
    pub pane_id: String,
    /// Agent family in the pane
    pub agent_type: AgentFamily,
    /// Window start
    pub start: DateTime<Utc>,
    /// Window end (≥ start)
    pub end: DateTime<Utc>,
    /// Whether the pane produced output during the window
    pub has_output: bool,
}

impl ActivityWindow {
    fn overlaps(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.start <= to && self.end >= from
    }
}

/// Why a conflict was flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    ConcurrentActivity,
    ReservationViolation,
    OverlappingReservations,
    UnclaimedModification,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConcurrentActivity => write!(f, "concurrent_activity"),
            Self::ReservationViolation => write!(f, "reservation_violation"),
            Self::OverlappingReservations => write!(f, "overlapping_reservations"),
            Self::UnclaimedModification => write!(f, "unclaimed_modification"),
        }
    }
}

/// One modified file as reported by git.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    /// Path relative to the repository root (rename destination for renames)
    pub path: String,
    /// Two-letter porcelain status, verbatim
    pub status: String,
    /// Whether the index side of the status is set
    pub staged: bool,
    /// Filesystem modification time, when available
    pub modified_at: Option<DateTime<Utc>>,
}

/// Source of git-reported file changes.
pub trait GitStatusSource: Send + Sync {
    /// Current changed files.
    fn changes(&self) -> Result<Vec<FileChange>>;
}

/// Runs `git status --porcelain` in a working directory and resolves
/// modification times from the filesystem.
#[derive(Debug, Clone)]
pub struct GitCli {
    workdir: std::path::PathBuf,
}

impl GitCli {
    /// Create a source rooted at the given working directory.
    #[must_use]
    pub fn new(workdir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

impl GitStatusSource for GitCli {
    fn changes(&self) -> Result<Vec<FileChange>> {
        let output = Command::new("git")
            .arg("status")
            .arg("--porcelain")
            .current_dir(&self.workdir)
            .output()
            .map_err(|e| Error::DependencyMissing {
                name: "git".to_string(),
                hint: format!("failed to run git status: {e}"),
            })?;
        if !output.status.success() {
            return Err(Error::Internal(format!(
                "git status failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let workdir = self.workdir.clone();
        Ok(parse_porcelain(&text, |path| file_mtime(&workdir.join(path))))
    }
}

fn file_mtime(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

/// Parse porcelain status output. Each record is `XY<space>path`; renames
/// resolve to the destination path; CRLF is stripped; status is verbatim.
pub fn parse_porcelain<F>(text: &str, modified_at: F) -> Vec<FileChange>
where
    F: Fn(&str) -> Option<DateTime<Utc>>,
{
    let mut changes = Vec::new();
    for raw in text.lines() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.len() < 4 {
            continue;
        }
        let status = &line[..2];
        let rest = &line[3..];
        let path = rest
            .rsplit_once(" -> ")
            .map_or(rest, |(_, dst)| dst)
            .to_string();
        let staged = {
            let x = status.as_bytes()[0] as char;
            x != ' ' && x != '?'
        };
        changes.push(FileChange {
            modified_at: modified_at(&path),
            path,
            status: status.to_string(),
            staged,
        });
    }
    changes
}

/// A graded conflict finding for one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedConflict {
    /// File the conflict concerns
    pub path: String,
    /// Panes whose activity windows overlap the modification
    pub likely_modifiers: Vec<String>,
    /// Porcelain status of the file
    pub git_status: String,
    /// Confidence 0.0–1.0 (≥ 0.5 for emitted conflicts)
    pub confidence: f64,
    /// Why this was flagged
    pub reason: ConflictReason,
    /// Agents holding reservations matching the file
    pub reservation_holders: Vec<String>,
    /// When the file was modified
    pub modified_at: DateTime<Utc>,
    /// Human-readable explanation
    pub details: String,
}

/// Records pane activity windows and joins them with git changes and
/// reservations on demand.
#[derive(Debug, Default)]
pub struct ConflictDetector {
    windows: RwLock<Vec<ActivityWindow>>,
    /// Pane id → reservation-system agent name.
    agent_names: RwLock<HashMap<String, String>>,
}

impl ConflictDetector {
    /// Create an empty detector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an activity window and prune expired ones.
    pub fn record_activity(
        &self,
        pane_id: &str,
        agent_type: AgentFamily,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        has_output: bool,
    ) {
        self.record_activity_at(pane_id, agent_type, start, end, has_output, Utc::now());
    }

    /// Time-injected variant of [`record_activity`](Self::record_activity).
    pub fn record_activity_at(
        &self,
        pane_id: &str,
        agent_type: AgentFamily,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        has_output: bool,
        now: DateTime<Utc>,
    ) {
        let end = end.max(start);
        let cutoff = now - ChronoDuration::seconds(WINDOW_RETENTION_SECS);
        let mut windows = write(&self.windows);
        windows.push(ActivityWindow {
            pane_id: pane_id.to_string(),
            agent_type,
            start,
            end,
            has_output,
        });
        windows.retain(|w| w.end >= cutoff);
    }

    /// Associate a pane with its reservation-system agent name.
    pub fn map_agent(&self, pane_id: &str, agent_name: &str) {
        write(&self.agent_names).insert(pane_id.to_string(), agent_name.to_string());
    }

    /// Snapshot of the retained windows.
    pub fn windows(&self) -> Vec<ActivityWindow> {
        read(&self.windows).clone()
    }

    /// Drop all windows and agent mappings.
    pub fn clear(&self) {
        write(&self.windows).clear();
        write(&self.agent_names).clear();
    }

    /// Join changes, windows and reservations into graded conflicts.
    pub fn detect_conflicts(
        &self,
        changes: &[FileChange],
        reservations: &[FileReservation],
    ) -> Vec<DetectedConflict> {
        self.detect_conflicts_at(changes, reservations, Utc::now())
    }

    /// Time-injected variant of [`detect_conflicts`](Self::detect_conflicts).
    pub fn detect_conflicts_at(
        &self,
        changes: &[FileChange],
        reservations: &[FileReservation],
        now: DateTime<Utc>,
    ) -> Vec<DetectedConflict> {
        let windows = read(&self.windows);
        let agent_names = read(&self.agent_names);
        let mut conflicts = Vec::new();

        for change in changes {
            let Some(modified_at) = change.modified_at else {
                debug!(path = %change.path, "Skipping change without modification time");
                continue;
            };

            let holders: BTreeSet<&str> = reservations
                .iter()
                .filter(|r| r.is_active_at(now))
                .filter(|r| matches_pattern(&change.path, &r.path_pattern))
                .map(|r| r.agent_name.as_str())
                .collect();

            let from = modified_at - ChronoDuration::seconds(MODIFY_SLACK_SECS);
            let to = modified_at + ChronoDuration::seconds(MODIFY_SLACK_SECS);
            let modifiers: BTreeSet<&str> = windows
                .iter()
                .filter(|w| w.overlaps(from, to))
                .map(|w| w.pane_id.as_str())
                .collect();

            let (confidence, reason, details) = match (modifiers.len(), holders.len()) {
                (m, _) if m > 1 => (
                    0.90,
                    ConflictReason::ConcurrentActivity,
                    "multiple agents active during modification".to_string(),
                ),
                (1, h) if h >= 1 => {
                    let modifier = modifiers.iter().next().copied().unwrap_or_default();
                    let modifier_agent = agent_names.get(modifier).map(String::as_str);
                    if modifier_agent.is_some_and(|agent| holders.contains(agent)) {
                        (
                            0.30,
                            ConflictReason::ConcurrentActivity,
                            "modified by reservation holder".to_string(),
                        )
                    } else {
                        (
                            0.85,
                            ConflictReason::ReservationViolation,
                            format!(
                                "modified by non-holder {}",
                                modifier_agent.unwrap_or(modifier)
                            ),
                        )
                    }
                }
                (1, 0) => (
                    0.40,
                    ConflictReason::ConcurrentActivity,
                    "single modifier, no reservation".to_string(),
                ),
                (0, h) if h > 1 => (
                    0.75,
                    ConflictReason::OverlappingReservations,
                    "multiple holders, no detected activity".to_string(),
                ),
                (0, 0) => (
                    0.60,
                    ConflictReason::UnclaimedModification,
                    "no tracked activity, no reservation".to_string(),
                ),
                _ => (
                    0.50,
                    ConflictReason::UnclaimedModification,
                    "single holder, no detected activity".to_string(),
                ),
            };

            if confidence < EMIT_THRESHOLD {
                continue;
            }

            conflicts.push(DetectedConflict {
                path: change.path.clone(),
                likely_modifiers: modifiers.iter().map(|s| (*s).to_string()).collect(),
                git_status: change.status.clone(),
                confidence,
                reason,
                reservation_holders: holders.iter().map(|s| (*s).to_string()).collect(),
                modified_at,
                details,
            });
        }

        conflicts
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

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn change(path: &str, modified_at: DateTime<Utc>) -> FileChange {
        FileChange {
            path: path.to_string(),
            status: " M".to_string(),
            staged: false,
            modified_at: Some(modified_at),
        }
    }

    fn reservation(agent: &str, pattern: &str, now: DateTime<Utc>) -> FileReservation {
        FileReservation {
            id: format!("{agent}:{pattern}"),
            agent_name: agent.to_string(),
            path_pattern: pattern.to_string(),
            created_at: now,
            expires_at: now + ChronoDuration::seconds(600),
            released_at: None,
        }
    }

    #[test]
    fn porcelain_parses_statuses_renames_and_crlf() {
        let text = " M src/main.rs\r\nA  src/new.rs\nR  old.rs -> new_name.rs\n?? scratch.txt\n";
        let changes = parse_porcelain(text, |_| Some(at(0)));
        assert_eq!(changes.len(), 4);
        assert_eq!(changes[0].status, " M");
        assert!(!changes[0].staged);
        assert_eq!(changes[1].status, "A ");
        assert!(changes[1].staged);
        assert_eq!(changes[2].path, "new_name.rs");
        assert_eq!(changes[3].status, "??");
        assert!(!changes[3].staged);
    }

    #[test]
    fn two_overlapping_panes_is_high_confidence_concurrent() {
        let detector = ConflictDetector::new();
        detector.record_activity_at("P1", AgentFamily::Claude, at(0), at(30), true, at(60));
        detector.record_activity_at("P2", AgentFamily::Codex, at(25), at(45), true, at(60));

        let conflicts =
            detector.detect_conflicts_at(&[change("src/m.go", at(28))], &[], at(60));
        assert_eq!(conflicts.len(), 1);
        let conflict = &conflicts[0];
        assert_eq!(conflict.confidence, 0.90);
        assert_eq!(conflict.reason, ConflictReason::ConcurrentActivity);
        assert_eq!(conflict.likely_modifiers, vec!["P1", "P2"]);
    }

    #[test]
    fn non_holder_modification_is_a_reservation_violation() {
        let detector = ConflictDetector::new();
        detector.record_activity_at("P1", AgentFamily::Claude, at(0), at(30), true, at(60));
        detector.map_agent("P1", "Blue");

        let reservations = vec![reservation("Green", "internal/**", at(0))];
        let conflicts = detector.detect_conflicts_at(
            &[change("internal/x.go", at(10))],
            &reservations,
            at(60),
        );
        assert_eq!(conflicts.len(), 1);
        let conflict = &conflicts[0];
        assert_eq!(conflict.confidence, 0.85);
        assert_eq!(conflict.reason, ConflictReason::ReservationViolation);
        assert_eq!(conflict.reservation_holders, vec!["Green"]);
        assert_eq!(conflict.likely_modifiers, vec!["P1"]);
    }

    #[test]
    fn holder_modifying_its_own_reservation_is_not_emitted() {
        let detector = ConflictDetector::new();
        detector.record_activity_at("P1", AgentFamily::Claude, at(0), at(30), true, at(60));
        detector.map_agent("P1", "Green");

        let reservations = vec![reservation("Green", "internal/**", at(0))];
        let conflicts = detector.detect_conflicts_at(
            &[change("internal/x.go", at(10))],
            &reservations,
            at(60),
        );
        assert!(conflicts.is_empty());
    }

    #[test]
    fn overlapping_reservations_without_activity() {
        let detector = ConflictDetector::new();
        let reservations = vec![
            reservation("Green", "internal/**", at(0)),
            reservation("Blue", "internal/", at(0)),
        ];
        let conflicts = detector.detect_conflicts_at(
            &[change("internal/x.go", at(10))],
            &reservations,
            at(60),
        );
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].confidence, 0.75);
        assert_eq!(conflicts[0].reason, ConflictReason::OverlappingReservations);
        assert_eq!(conflicts[0].reservation_holders, vec!["Blue", "Green"]);
    }

    #[test]
    fn unclaimed_modification_with_no_signals() {
        let detector = ConflictDetector::new();
        let conflicts = detector.detect_conflicts_at(&[change("x.go", at(10))], &[], at(60));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].confidence, 0.60);
        assert_eq!(conflicts[0].reason, ConflictReason::UnclaimedModification);
        assert!(conflicts[0].likely_modifiers.is_empty());
    }

    #[test]
    fn single_modifier_without_reservation_is_suppressed() {
        let detector = ConflictDetector::new();
        detector.record_activity_at("P1", AgentFamily::Claude, at(0), at(30), true, at(60));
        let conflicts =
            detector.detect_conflicts_at(&[change("x.go", at(10))], &[], at(60));
        // Confidence 0.40 sits below the emission threshold.
        assert!(conflicts.is_empty());
    }

    #[test]
    fn fallback_single_holder_no_activity_is_borderline() {
        let detector = ConflictDetector::new();
        let reservations = vec![reservation("Green", "internal/**", at(0))];
        let conflicts = detector.detect_conflicts_at(
            &[change("internal/x.go", at(10))],
            &reservations,
            at(60),
        );
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].confidence, 0.50);
        assert_eq!(conflicts[0].reason, ConflictReason::UnclaimedModification);
    }

    #[test]
    fn expired_reservations_do_not_count_as_holders() {
        let detector = ConflictDetector::new();
        let mut expired = reservation("Green", "internal/**", at(0));
        expired.expires_at = at(5);
        let conflicts = detector.detect_conflicts_at(
            &[change("internal/x.go", at(10))],
            &[expired],
            at(60),
        );
        assert_eq!(conflicts[0].reason, ConflictReason::UnclaimedModification);
        assert!(conflicts[0].reservation_holders.is_empty());
    }

    #[test]
    fn windows_outside_the_slack_do_not_count() {
        let detector = ConflictDetector::new();
        detector.record_activity_at("P1", AgentFamily::Claude, at(0), at(30), true, at(400));
        // Modification 5 minutes after the window closed.
        let conflicts = detector.detect_conflicts_at(&[change("x.go", at(330))], &[], at(400));
        assert_eq!(conflicts[0].reason, ConflictReason::UnclaimedModification);
        assert!(conflicts[0].likely_modifiers.is_empty());
    }

    #[test]
    fn windows_are_pruned_after_an_hour() {
        let detector = ConflictDetector::new();
        detector.record_activity_at("P1", AgentFamily::Claude, at(0), at(10), true, at(10));
        assert_eq!(detector.windows().len(), 1);
        detector.record_activity_at("P2", AgentFamily::Codex, at(4000), at(4010), true, at(4010));
        let windows = detector.windows();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].pane_id, "P2");
    }
}
