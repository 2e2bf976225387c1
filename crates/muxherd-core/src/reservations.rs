//! File reservations and the reservation cache
//!
//! Reservations are externally held, time-bounded claims by a named agent on
//! a path pattern. The core never writes them; it lists them through the
//! [`ReservationStore`] trait and matches file paths against patterns with
//! the dialect below.
//!
//! # Pattern dialect
//!
//! | Pattern | Matches |
//! |---------|---------|
//! | `src/main.go` | exactly that path |
//! | `src/` | anything under `src/` |
//! | `src/*.go` | one segment (delegates to standard glob) |
//! | `src/**` | anything under `src/`, any depth |
//! | `src/**/test.go` | `test.go` at any depth under `src/` |
//! | `Makefile` | the path itself or anything under `Makefile/` |

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// An externally held claim on a path pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReservation {
    /// Store-assigned identifier
    pub id: String,
    /// Holder agent name
    pub agent_name: String,
    /// Claimed path pattern
    pub path_pattern: String,
    /// When the reservation was created
    pub created_at: DateTime<Utc>,
    /// When the reservation lapses
    pub expires_at: DateTime<Utc>,
    /// Set when the holder released early
    pub released_at: Option<DateTime<Utc>>,
}

impl FileReservation {
    /// Active = not released and not yet expired.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.released_at.is_none() && now < self.expires_at
    }

    /// [`is_active_at`](Self::is_active_at) against the current time.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now())
    }
}

/// Read-only interface to the external reservation service. Implementations
/// must bound the listing call by roughly 30 seconds.
pub trait ReservationStore: Send + Sync {
    /// List reservations for a project, optionally filtered by agent, and
    /// optionally restricted to active ones.
    fn list_reservations(
        &self,
        project_key: &str,
        agent_name: Option<&str>,
        only_active: bool,
    ) -> Result<Vec<FileReservation>>;
}

/// Fixed in-memory store for tests and offline evaluation.
#[derive(Debug, Default)]
pub struct StaticReservationStore {
    reservations: Vec<FileReservation>,
}

impl StaticReservationStore {
    /// Create a store holding the given reservations.
    #[must_use]
    pub fn new(reservations: Vec<FileReservation>) -> Self {
        Self { reservations }
    }
}

impl ReservationStore for StaticReservationStore {
    fn list_reservations(
        &self,
        _project_key: &str,
        agent_name: Option<&str>,
        only_active: bool,
    ) -> Result<Vec<FileReservation>> {
        let now = Utc::now();
        Ok(self
            .reservations
            .iter()
            .filter(|r| agent_name.is_none_or(|name| r.agent_name == name))
            .filter(|r| !only_active || r.is_active_at(now))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Pattern matching
// ---------------------------------------------------------------------------

/// Match a file path against a reservation pattern using the module dialect.
#[must_use]
pub fn matches_pattern(path: &str, pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    if path == pattern {
        return true;
    }

    // Trailing slash: directory prefix.
    if pattern.ends_with('/') {
        return path.starts_with(pattern);
    }

    // `**`: prefix, then an optional single-segment suffix at any depth.
    if let Some(idx) = pattern.find("**") {
        let prefix = &pattern[..idx];
        let suffix = pattern[idx + 2..].trim_start_matches('/');
        if !path.starts_with(prefix) {
            return false;
        }
        if suffix.is_empty() {
            return true;
        }
        let rest = &path[prefix.len()..];
        return segment_tails(rest).any(|tail| single_segment_glob(tail, suffix));
    }

    // Plain glob: `*` stays within one segment.
    if pattern.contains('*') || pattern.contains('?') || pattern.contains('[') {
        return single_segment_glob(path, pattern);
    }

    // Bare name: the path itself or a directory of that name.
    if !pattern.contains('/') {
        return path
            .strip_prefix(pattern)
            .is_some_and(|rest| rest.starts_with('/'));
    }

    false
}

/// Standard glob where `*` does not cross `/`.
fn single_segment_glob(path: &str, pattern: &str) -> bool {
    let options = glob::MatchOptions {
        require_literal_separator: true,
        ..glob::MatchOptions::new()
    };
    glob::Pattern::new(pattern)
        .map(|p| p.matches_with(path, options))
        .unwrap_or(false)
}

/// The string itself plus every suffix starting after a `/`.
fn segment_tails(rest: &str) -> impl Iterator<Item = &str> {
    std::iter::once(rest).chain(rest.match_indices('/').map(|(i, _)| &rest[i + 1..]))
}

// ---------------------------------------------------------------------------
// Reservation cache
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CacheInner {
    holders_by_pattern: HashMap<String, BTreeSet<String>>,
    last_fetch: Option<Instant>,
}

/// TTL cache of active reservations, indexed by path pattern.
///
/// Fetch errors are advisory: the cache stays stale and affinity scoring
/// degrades to zero rather than failing routing.
pub struct ReservationCache {
    store: Arc<dyn ReservationStore>,
    project_key: String,
    ttl: Duration,
    inner: RwLock<CacheInner>,
}

impl std::fmt::Debug for ReservationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationCache")
            .field("project_key", &self.project_key)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ReservationCache {
    /// Create a cache over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn ReservationStore>, project_key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            project_key: project_key.into(),
            ttl,
            inner: RwLock::new(CacheInner::default()),
        }
    }

    /// Whether the cached index is older than the TTL (or never fetched).
    pub fn is_stale(&self) -> bool {
        self.read()
            .last_fetch
            .is_none_or(|at| at.elapsed() > self.ttl)
    }

    /// Refresh if stale. Fetch failures leave the previous index in place.
    pub fn ensure_fresh(&self) {
        if !self.is_stale() {
            return;
        }
        if let Err(err) = self.refresh() {
            debug!(error = %err, "Reservation refresh failed; cache stays stale");
        }
    }

    /// Fetch active reservations and rebuild the index. Concurrent refreshes
    /// are tolerated; the last writer wins.
    pub fn refresh(&self) -> Result<()> {
        let reservations = self
            .store
            .list_reservations(&self.project_key, None, true)?;

        let mut holders_by_pattern: HashMap<String, BTreeSet<String>> = HashMap::new();
        for reservation in reservations {
            holders_by_pattern
                .entry(reservation.path_pattern)
                .or_default()
                .insert(reservation.agent_name);
        }

        let mut inner = self.write();
        inner.holders_by_pattern = holders_by_pattern;
        inner.last_fetch = Some(Instant::now());
        Ok(())
    }

    /// Agents holding reservations that match the given path.
    pub fn holders_for_path(&self, path: &str) -> BTreeSet<String> {
        let inner = self.read();
        let mut holders = BTreeSet::new();
        for (pattern, agents) in &inner.holders_by_pattern {
            if matches_pattern(path, pattern) {
                holders.extend(agents.iter().cloned());
            }
        }
        holders
    }

    /// Whether the named agent holds a reservation matching the path.
    pub fn agent_holds_path(&self, agent_name: &str, path: &str) -> bool {
        self.holders_for_path(path).contains(agent_name)
    }

    /// Snapshot of the pattern index (pattern, holders), sorted by pattern.
    pub fn patterns(&self) -> Vec<(String, BTreeSet<String>)> {
        let inner = self.read();
        let mut patterns: Vec<_> = inner
            .holders_by_pattern
            .iter()
            .map(|(pattern, holders)| (pattern.clone(), holders.clone()))
            .collect();
        patterns.sort_by(|a, b| a.0.cmp(&b.0));
        patterns
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CacheInner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CacheInner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
