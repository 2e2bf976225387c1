//! Process-lifetime registries keyed by session name
//!
//! Health trackers, backoff managers and restart managers are singletons per
//! session. Keeping them in one flat registry layer, reached by lookup
//! rather than stored references, breaks the ownership cycles that would
//! otherwise form between the supervision components.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::alerts::AlertSink;
use crate::backoff::BackoffManager;
use crate::config::MuxherdConfig;
use crate::health::HealthTracker;
use crate::restart::RestartManager;
use crate::terminal::TerminalAdapter;

/// A keyed map of lazily created, shared singletons.
pub struct SessionRegistry<T: ?Sized> {
    make: Box<dyn Fn(&str) -> Arc<T> + Send + Sync>,
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: ?Sized> std::fmt::Debug for SessionRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = match self.entries.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        f.debug_struct("SessionRegistry")
            .field("entries", &len)
            .finish_non_exhaustive()
    }
}

impl<T: ?Sized> SessionRegistry<T> {
    /// Create a registry with a factory for missing entries.
    pub fn new(make: impl Fn(&str) -> Arc<T> + Send + Sync + 'static) -> Self {
        Self {
            make: Box::new(make),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the session's singleton, creating it on first use.
    pub fn get_or_create(&self, session: &str) -> Arc<T> {
        if let Some(existing) = self.get(session) {
            return existing;
        }
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // A concurrent caller may have created it between our read and write.
        entries
            .entry(session.to_string())
            .or_insert_with(|| (self.make)(session))
            .clone()
    }

    /// Fetch the session's singleton without creating it.
    pub fn get(&self, session: &str) -> Option<Arc<T>> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.get(session).cloned()
    }

    /// Drop the session's singleton.
    pub fn remove(&self, session: &str) -> Option<Arc<T>> {
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.remove(session)
    }

    /// Sessions currently registered.
    pub fn sessions(&self) -> Vec<String> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.keys().cloned().collect()
    }
}

/// The three supervision registries, constructed once per process.
pub struct Registries {
    /// Health trackers by session
    pub trackers: SessionRegistry<HealthTracker>,
    /// Backoff managers by session
    pub backoffs: SessionRegistry<BackoffManager>,
    /// Restart managers by session
    pub restarts: SessionRegistry<RestartManager>,
}

impl std::fmt::Debug for Registries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registries")
            .field("trackers", &self.trackers)
            .field("backoffs", &self.backoffs)
            .field("restarts", &self.restarts)
            .finish()
    }
}

impl Registries {
    /// Build the registries over shared collaborators.
    #[must_use]
    pub fn new(
        adapter: Arc<dyn TerminalAdapter>,
        alerts: Arc<dyn AlertSink>,
        config: &MuxherdConfig,
    ) -> Self {
        let backoff_config = config.backoff.clone();
        let restart_config = config.restart.clone();
        let tracker_alerts = alerts.clone();
        Self {
            trackers: SessionRegistry::new(move |_| {
                Arc::new(HealthTracker::new(tracker_alerts.clone()))
            }),
            backoffs: SessionRegistry::new(move |_| {
                Arc::new(BackoffManager::new(&backoff_config))
            }),
            restarts: SessionRegistry::new(move |_| {
                Arc::new(RestartManager::new(
                    adapter.clone(),
                    alerts.clone(),
                    restart_config.clone(),
                ))
            }),
        }
    }
}
