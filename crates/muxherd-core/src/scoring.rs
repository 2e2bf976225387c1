//! Composite agent scoring for routing
//!
//! Every candidate pane gets a score in [0, 100] from three weighted
//! components (context headroom, activity state, recency) plus an optional
//! reservation-affinity bonus. Exclusion rules run before scoring; an
//! excluded agent scores zero and carries the reason.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::activity::AgentState;
use crate::config::{AgentMailConfig, RoutingConfig};
use crate::error::Result;
use crate::health::HealthState;
use crate::reservations::ReservationCache;
use crate::terminal::AgentFamily;

/// Recognized code-file extensions for prompt path extraction.
const CODE_EXTENSIONS: &[&str] = &[
    "rs", "go", "py", "js", "ts", "tsx", "jsx", "java", "c", "h", "cpp", "hpp", "cc", "rb",
    "php", "swift", "kt", "scala", "sh", "toml", "yaml", "yml", "json", "md", "sql", "proto",
    "css", "html",
];

/// A candidate agent pane, as observed by the activity and health layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCandidate {
    /// Pane identifier
    pub pane_id: String,
    /// Agent family in the pane
    pub agent_type: AgentFamily,
    /// Pane index within the session
    pub pane_index: u32,
    /// Reservation-system agent name mapped to the pane, when known
    pub agent_name: Option<String>,
    /// Current activity state
    pub state: AgentState,
    /// Classifier confidence for the state
    pub confidence: f64,
    /// Output velocity in chars/s
    pub velocity: f64,
    /// Context window usage percentage, 0–100
    pub context_usage: f64,
    /// Last observed activity, when known
    pub last_activity: Option<DateTime<Utc>>,
    /// Supervised health state
    pub health_state: HealthState,
    /// Whether the pane is currently rate limited
    pub rate_limited: bool,
}

/// Component scores and their weighted contributions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub context_score: f64,
    pub state_score: f64,
    pub recency_score: f64,
    pub context_contrib: f64,
    pub state_contrib: f64,
    pub recency_contrib: f64,
    pub affinity_bonus: f64,
}

/// A scored (possibly excluded) candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredAgent {
    pub pane_id: String,
    pub agent_type: AgentFamily,
    pub pane_index: u32,
    pub agent_name: Option<String>,
    pub state: AgentState,
    pub confidence: f64,
    pub velocity: f64,
    pub context_usage: f64,
    pub last_activity: Option<DateTime<Utc>>,
    pub health_state: HealthState,
    pub rate_limited: bool,
    /// Composite score in [0, 100]; zero when excluded
    pub score: f64,
    /// Whether the agent is excluded from selection
    pub excluded: bool,
    /// Why the agent was excluded
    pub exclude_reason: Option<String>,
    /// Component detail behind the score
    pub score_detail: ScoreBreakdown,
}

/// Scores candidates under a routing configuration.
pub struct AgentScorer {
    config: RoutingConfig,
    affinity_bonus_cap: f64,
    respect_reservations: bool,
    cache: Option<Arc<ReservationCache>>,
}

impl std::fmt::Debug for AgentScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentScorer")
            .field("config", &self.config)
            .field("affinity_bonus_cap", &self.affinity_bonus_cap)
            .finish_non_exhaustive()
    }
}

impl AgentScorer {
    /// Create a scorer. The reservation cache is optional; without it the
    /// affinity bonus is always zero.
    pub fn new(
        routing: RoutingConfig,
        agent_mail: &AgentMailConfig,
        cache: Option<Arc<ReservationCache>>,
    ) -> Result<Self> {
        routing.validate()?;
        let affinity_bonus_cap = routing.effective_affinity_bonus(agent_mail.enabled);
        Ok(Self {
            config: routing,
            affinity_bonus_cap,
            respect_reservations: agent_mail.respect_reservations,
            cache,
        })
    }

    /// Scorer with all defaults and no reservation integration.
    pub fn with_defaults() -> Self {
        Self::new(
            RoutingConfig::default(),
            &AgentMailConfig::default(),
            None,
        )
        .unwrap_or_else(|_| unreachable!("default weights sum to 1.0"))
    }

    /// Whether non-holders should be excluded rather than warned about.
    #[must_use]
    pub fn respect_reservations(&self) -> bool {
        self.respect_reservations
    }

    /// The reservation cache, when integration is enabled.
    #[must_use]
    pub fn reservation_cache(&self) -> Option<&Arc<ReservationCache>> {
        self.cache.as_ref()
    }

    /// Score every candidate. The prompt, when given, feeds path extraction
    /// for the affinity bonus.
    pub fn score_all(&self, candidates: &[AgentCandidate], prompt: Option<&str>) -> Vec<ScoredAgent> {
        self.score_all_at(candidates, prompt, Utc::now())
    }

    /// Time-injected variant of [`score_all`](Self::score_all).
    pub fn score_all_at(
        &self,
        candidates: &[AgentCandidate],
        prompt: Option<&str>,
        now: DateTime<Utc>,
    ) -> Vec<ScoredAgent> {
        let paths = prompt.map(extract_paths).unwrap_or_default();
        if self.config.affinity_enabled && !paths.is_empty() {
            if let Some(cache) = &self.cache {
                cache.ensure_fresh();
            }
        }
        candidates
            .iter()
            .map(|candidate| self.score_one(candidate, &paths, now))
            .collect()
    }

    fn score_one(
        &self,
        candidate: &AgentCandidate,
        prompt_paths: &[String],
        now: DateTime<Utc>,
    ) -> ScoredAgent {
        if let Some(reason) = self.exclusion_reason(candidate) {
            return scored(candidate, 0.0, true, Some(reason), ScoreBreakdown::default());
        }

        let context_score = (100.0 - candidate.context_usage).max(0.0);
        let state_score = (state_raw(candidate.state) + 100.0) / 2.0;
        let recency_score = recency_score(candidate.last_activity, now);
        let affinity_bonus = self.affinity_bonus(candidate, prompt_paths);

        let breakdown = ScoreBreakdown {
            context_score,
            state_score,
            recency_score,
            context_contrib: context_score * self.config.context_weight,
            state_contrib: state_score * self.config.state_weight,
            recency_contrib: recency_score * self.config.recency_weight,
            affinity_bonus,
        };

        let raw = breakdown.context_contrib
            + breakdown.state_contrib
            + breakdown.recency_contrib
            + breakdown.affinity_bonus;
        let score = round2(raw.clamp(0.0, 100.0));

        trace!(
            pane_id = %candidate.pane_id,
            score,
            state = %candidate.state,
            "Scored candidate"
        );
        scored(candidate, score, false, None, breakdown)
    }

    fn exclusion_reason(&self, candidate: &AgentCandidate) -> Option<String> {
        if candidate.state == AgentState::Error {
            return Some("state is error".to_string());
        }
        if self.config.exclude_if_rate_limited && candidate.rate_limited {
            return Some("rate limited".to_string());
        }
        if candidate.health_state == HealthState::Unhealthy {
            return Some("unhealthy".to_string());
        }
        if candidate.context_usage > self.config.exclude_context_above {
            return Some(format!(
                "context usage {:.0}% above {:.0}%",
                candidate.context_usage, self.config.exclude_context_above
            ));
        }
        if self.config.exclude_if_generating && candidate.state == AgentState::Generating {
            return Some("generating".to_string());
        }
        None
    }

    fn affinity_bonus(&self, candidate: &AgentCandidate, prompt_paths: &[String]) -> f64 {
        if !self.config.affinity_enabled || prompt_paths.is_empty() {
            return 0.0;
        }
        let (Some(cache), Some(agent_name)) = (&self.cache, &candidate.agent_name) else {
            return 0.0;
        };
        let matches = prompt_paths
            .iter()
            .filter(|path| cache.agent_holds_path(agent_name, path))
            .count();
        if matches == 0 {
            return 0.0;
        }
        let bonus = self.affinity_bonus_cap * matches as f64 / prompt_paths.len() as f64;
        bonus.min(self.affinity_bonus_cap)
    }
}

fn scored(
    candidate: &AgentCandidate,
    score: f64,
    excluded: bool,
    exclude_reason: Option<String>,
    score_detail: ScoreBreakdown,
) -> ScoredAgent {
    ScoredAgent {
        pane_id: candidate.pane_id.clone(),
        agent_type: candidate.agent_type,
        pane_index: candidate.pane_index,
        agent_name: candidate.agent_name.clone(),
        state: candidate.state,
        confidence: candidate.confidence,
        velocity: candidate.velocity,
        context_usage: candidate.context_usage,
        last_activity: candidate.last_activity,
        health_state: candidate.health_state,
        rate_limited: candidate.rate_limited,
        score,
        excluded,
        exclude_reason,
        score_detail,
    }
}

/// Raw state value before normalization.
#[must_use]
pub fn state_raw(state: AgentState) -> f64 {
    match state {
        AgentState::Waiting => 100.0,
        AgentState::Thinking => 50.0,
        AgentState::Generating => 0.0,
        AgentState::Stalled => -50.0,
        AgentState::Error => -100.0,
        AgentState::Unknown => 25.0,
    }
}

/// Piecewise recency score by age of last activity.
#[must_use]
pub fn recency_score(last_activity: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(last) = last_activity else {
        return 50.0;
    };
    let age_secs = now.signed_duration_since(last).num_seconds().max(0);
    if age_secs < 60 {
        20.0
    } else if age_secs < 300 {
        50.0
    } else if age_secs < 1800 {
        80.0
    } else {
        70.0
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Extract path-like substrings from a prompt: must contain `/` or start
/// with `./`, must carry a recognized code extension, must not look like a
/// URL or a version number. De-duplicated, first occurrence first.
#[must_use]
pub fn extract_paths(prompt: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut paths = Vec::new();

    for token in prompt.split_whitespace() {
        let token = token.trim_matches(|c: char| {
            matches!(c, '"' | '\'' | '`' | ',' | ';' | ':' | '(' | ')' | '[' | ']' | '{' | '}' | '<' | '>')
        });
        if token.is_empty() {
            continue;
        }
        if token.contains("://") || token.starts_with("http") {
            continue;
        }
        if !token.contains('/') && !token.starts_with("./") {
            continue;
        }
        if !has_code_extension(token) {
            continue;
        }
        if looks_like_version(token) {
            continue;
        }
        if seen.insert(token.to_string()) {
            paths.push(token.to_string());
        }
    }
    paths
}

fn has_code_extension(token: &str) -> bool {
    let Some((stem, ext)) = token.rsplit_once('.') else {
        return false;
    };
    !stem.is_empty() && CODE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
}

fn looks_like_version(token: &str) -> bool {
    let stripped = token.trim_start_matches('v');
    !stripped.is_empty()
        && stripped
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.' || c == '/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reservations::{FileReservation, StaticReservationStore};
    use std::time::Duration as StdDuration;

    fn candidate(pane_id: &str, index: u32, state: AgentState, ctx: f64) -> AgentCandidate {
        AgentCandidate {
            pane_id: pane_id.to_string(),
            agent_type: AgentFamily::Claude,
            pane_index: index,
            agent_name: None,
            state,
            confidence: 0.9,
            velocity: 0.0,
            context_usage: ctx,
            last_activity: None,
            health_state: HealthState::Healthy,
            rate_limited: false,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn reference_scoring_scenario() {
        let now = at(0);
        let scorer = AgentScorer::with_defaults();

        let a = AgentCandidate {
            last_activity: Some(now - chrono::Duration::minutes(10)),
            ..candidate("A", 0, AgentState::Waiting, 30.0)
        };
        let b = AgentCandidate {
            last_activity: Some(now - chrono::Duration::seconds(30)),
            ..candidate("B", 1, AgentState::Generating, 10.0)
        };
        let c = candidate("C", 2, AgentState::Waiting, 90.0);

        let scored = scorer.score_all_at(&[a, b, c], None, now);

        // A: 70·0.4 + 100·0.4 + 80·0.2 = 84.0
        assert!(!scored[0].excluded);
        assert_eq!(scored[0].score, 84.0);

        // B excluded: generating.
        assert!(scored[1].excluded);
        assert_eq!(scored[1].score, 0.0);
        assert_eq!(scored[1].exclude_reason.as_deref(), Some("generating"));

        // C excluded: context usage above threshold.
        assert!(scored[2].excluded);
        assert!(scored[2]
            .exclude_reason
            .as_deref()
            .unwrap_or("")
            .contains("context usage"));
    }

    #[test]
    fn breakdown_sums_to_score() {
        let now = at(0);
        let scorer = AgentScorer::with_defaults();
        let agent = AgentCandidate {
            last_activity: Some(now - chrono::Duration::minutes(3)),
            ..candidate("A", 0, AgentState::Thinking, 42.0)
        };
        let scored = &scorer.score_all_at(&[agent], None, now)[0];
        let detail = &scored.score_detail;
        let sum = detail.context_contrib
            + detail.state_contrib
            + detail.recency_contrib
            + detail.affinity_bonus;
        assert!((sum - scored.score).abs() < 0.005);
    }

    #[test]
    fn error_state_is_always_excluded() {
        let scorer = AgentScorer::with_defaults();
        let scored = &scorer.score_all(&[candidate("A", 0, AgentState::Error, 0.0)], None)[0];
        assert!(scored.excluded);
        assert_eq!(scored.exclude_reason.as_deref(), Some("state is error"));
        assert_eq!(scored.score, 0.0);
    }

    #[test]
    fn unhealthy_and_rate_limited_are_excluded() {
        let scorer = AgentScorer::with_defaults();
        let mut unhealthy = candidate("A", 0, AgentState::Waiting, 10.0);
        unhealthy.health_state = HealthState::Unhealthy;
        let mut limited = candidate("B", 1, AgentState::Waiting, 10.0);
        limited.rate_limited = true;

        let scored = scorer.score_all(&[unhealthy, limited], None);
        assert_eq!(scored[0].exclude_reason.as_deref(), Some("unhealthy"));
        assert_eq!(scored[1].exclude_reason.as_deref(), Some("rate limited"));
    }

    #[test]
    fn state_mapping_is_total() {
        assert_eq!(state_raw(AgentState::Waiting), 100.0);
        assert_eq!(state_raw(AgentState::Thinking), 50.0);
        assert_eq!(state_raw(AgentState::Generating), 0.0);
        assert_eq!(state_raw(AgentState::Stalled), -50.0);
        assert_eq!(state_raw(AgentState::Error), -100.0);
        assert_eq!(state_raw(AgentState::Unknown), 25.0);
    }

    #[test]
    fn recency_piecewise_table() {
        let now = at(1_000_000);
        assert_eq!(recency_score(None, now), 50.0);
        assert_eq!(recency_score(Some(now - chrono::Duration::seconds(30)), now), 20.0);
        assert_eq!(recency_score(Some(now - chrono::Duration::seconds(120)), now), 50.0);
        assert_eq!(recency_score(Some(now - chrono::Duration::seconds(900)), now), 80.0);
        assert_eq!(recency_score(Some(now - chrono::Duration::seconds(3600)), now), 70.0);
    }

    #[test]
    fn path_extraction_rules() {
        let prompt = "Fix src/main.rs and ./lib/util.py, see https://example.com/a.rs \
                      version 1.2/3.4 and src/main.rs again plus notes.txt and core/mod.rs";
        let paths = extract_paths(prompt);
        assert_eq!(
            paths,
            vec![
                "src/main.rs".to_string(),
                "./lib/util.py".to_string(),
                "core/mod.rs".to_string(),
            ]
        );
    }

    #[test]
    fn affinity_bonus_scales_with_matches() {
        let now = Utc::now();
        let store = Arc::new(StaticReservationStore::new(vec![FileReservation {
            id: "1".to_string(),
            agent_name: "Green".to_string(),
            path_pattern: "src/**".to_string(),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(600),
            released_at: None,
        }]));
        let cache = Arc::new(ReservationCache::new(
            store,
            "proj",
            StdDuration::from_secs(30),
        ));
        cache.refresh().unwrap();

        let routing = RoutingConfig {
            affinity_enabled: true,
            affinity_bonus: Some(30.0),
            ..RoutingConfig::default()
        };
        let scorer =
            AgentScorer::new(routing, &AgentMailConfig::default(), Some(cache)).unwrap();

        let mut green = candidate("A", 0, AgentState::Waiting, 50.0);
        green.agent_name = Some("Green".to_string());
        let mut blue = candidate("B", 1, AgentState::Waiting, 50.0);
        blue.agent_name = Some("Blue".to_string());

        let prompt = "edit src/a.rs and docs/readme.md";
        let scored = scorer.score_all(&[green, blue], Some(prompt));

        // One of two extracted paths is reserved by Green: bonus 30·(1/2).
        assert_eq!(scored[0].score_detail.affinity_bonus, 15.0);
        assert_eq!(scored[1].score_detail.affinity_bonus, 0.0);
        assert!(scored[0].score > scored[1].score);
    }

    #[test]
    fn scores_stay_in_bounds() {
        let scorer = AgentScorer::with_defaults();
        let best = candidate("A", 0, AgentState::Waiting, 0.0);
        let scored = &scorer.score_all(&[best], None)[0];
        assert!(scored.score <= 100.0);
        assert!(scored.score >= 0.0);
    }
}
