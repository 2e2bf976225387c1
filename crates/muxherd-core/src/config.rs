//! Configuration management
//!
//! All tunables from the routing, supervision and capture layers live here,
//! loadable from `muxherd.toml` with serde defaults for every field so a
//! partial config file is always valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::logging::LogConfig;

/// Tolerance when validating that scorer weights sum to 1.0.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

/// Top-level configuration for muxherd.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxherdConfig {
    /// Routing scorer and strategy options
    pub routing: RoutingConfig,
    /// Reservation-store (Agent Mail) integration
    pub agent_mail: AgentMailConfig,
    /// Rate-limit backoff schedule
    pub backoff: BackoffConfig,
    /// Restart supervisor limits
    pub restart: RestartConfig,
    /// Activity classification thresholds
    pub activity: ActivityConfig,
    /// Captured-output retention
    pub capture: CaptureConfig,
    /// Logging setup
    pub log: LogConfig,
}

impl MuxherdConfig {
    /// Load configuration from `path`, or from the default location when
    /// `path` is `None`. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let resolved = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path(),
        };

        let config = match resolved {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(&p)?;
                toml::from_str(&text)
                    .map_err(|e| Error::Config(format!("{}: {e}", p.display())))?
            }
            _ => Self::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        self.routing.validate()
    }
}

/// Default config path: `<config_dir>/muxherd/muxherd.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("muxherd").join("muxherd.toml"))
}

/// Routing scorer weights and exclusion thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Weight of the context-headroom component
    pub context_weight: f64,
    /// Weight of the activity-state component
    pub state_weight: f64,
    /// Weight of the recency component
    pub recency_weight: f64,
    /// Enable reservation-based affinity scoring
    pub affinity_enabled: bool,
    /// Affinity bonus cap; when unset, 30 with Agent Mail enabled, 20 without
    pub affinity_bonus: Option<f64>,
    /// Exclude agents whose context usage exceeds this percentage
    pub exclude_context_above: f64,
    /// Exclude agents currently generating output
    pub exclude_if_generating: bool,
    /// Exclude agents currently rate limited
    pub exclude_if_rate_limited: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            context_weight: 0.4,
            state_weight: 0.4,
            recency_weight: 0.2,
            affinity_enabled: false,
            affinity_bonus: None,
            exclude_context_above: 85.0,
            exclude_if_generating: true,
            exclude_if_rate_limited: true,
        }
    }
}

impl RoutingConfig {
    /// Check that the three scorer weights sum to 1.0.
    pub fn validate(&self) -> Result<()> {
        let sum = self.context_weight + self.state_weight + self.recency_weight;
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(Error::InvalidFlag(format!(
                "scorer weights must sum to 1.0 (got {sum})"
            )));
        }
        Ok(())
    }

    /// Affinity bonus cap, falling back per Agent Mail mode.
    #[must_use]
    pub fn effective_affinity_bonus(&self, agent_mail_enabled: bool) -> f64 {
        self.affinity_bonus
            .unwrap_or(if agent_mail_enabled { 30.0 } else { 20.0 })
    }
}

/// Reservation store integration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentMailConfig {
    /// Use the reservation cache for affinity scoring
    pub enabled: bool,
    /// Reservation cache TTL in seconds
    pub cache_ttl_secs: u64,
    /// Exclude non-holders from routing instead of attaching a warning
    pub respect_reservations: bool,
}

impl Default for AgentMailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_ttl_secs: 30,
            respect_reservations: false,
        }
    }
}

impl AgentMailConfig {
    /// Cache TTL as a [`Duration`].
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Rate-limit backoff schedule. The schedule shape (doubling with a cap)
/// is fixed; only the endpoints are tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First backoff duration in seconds
    pub base_secs: u64,
    /// Maximum backoff duration in seconds
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: 30,
            max_secs: 300,
        }
    }
}

impl BackoffConfig {
    /// Base duration as a [`Duration`].
    #[must_use]
    pub fn base(&self) -> Duration {
        Duration::from_secs(self.base_secs)
    }

    /// Cap duration as a [`Duration`].
    #[must_use]
    pub fn max(&self) -> Duration {
        Duration::from_secs(self.max_secs)
    }
}

/// Restart supervisor limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Cap on restart attempts per pane in any rolling hour
    pub max_per_hour: u32,
    /// Max wait for an idle prompt during a soft restart, in seconds
    pub soft_timeout_secs: u64,
    /// Poll interval while waiting for an idle prompt, in milliseconds
    pub poll_interval_ms: u64,
    /// Emit a context-loss alert after a successful hard restart
    pub notify_on_context_loss: bool,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_per_hour: 3,
            soft_timeout_secs: 10,
            poll_interval_ms: 500,
            notify_on_context_loss: true,
        }
    }
}

impl RestartConfig {
    /// Soft restart timeout as a [`Duration`].
    #[must_use]
    pub fn soft_timeout(&self) -> Duration {
        Duration::from_secs(self.soft_timeout_secs)
    }

    /// Idle-prompt poll interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Activity classification thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// Zero-velocity silence before a pane counts as stalled, in seconds
    pub stall_threshold_secs: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            stall_threshold_secs: 120,
        }
    }
}

impl ActivityConfig {
    /// Stall threshold as a [`Duration`].
    #[must_use]
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }
}

/// Captured-output retention bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Maximum retained captures per pane
    pub max_per_pane: usize,
    /// Maximum capture age in seconds
    pub max_retention_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_per_pane: 100,
            max_retention_secs: 3600,
        }
    }
}

impl CaptureConfig {
    /// Retention window as a [`Duration`].
    #[must_use]
    pub fn max_retention(&self) -> Duration {
        Duration::from_secs(self.max_retention_secs)
    }
}
