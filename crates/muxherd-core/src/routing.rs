//! Routing strategies and the router
//!
//! A strategy is a narrow capability: given the scored candidates and a
//! routing context, pick one (or none). The router runs a primary strategy,
//! then a fixed fallback chain, optionally relaxes THINKING exclusions, and
//! annotates the result with reservation warnings when the prompt mentions
//! reserved paths.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::activity::{ActivityClassifier, AgentState};
use crate::backoff::BackoffManager;
use crate::error::{Error, Result};
use crate::health::{HealthState, HealthTracker};
use crate::reservations::ReservationCache;
use crate::scoring::{extract_paths, AgentCandidate, AgentScorer, ScoredAgent};
use crate::terminal::TerminalAdapter;

/// Context threaded through a routing decision.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    /// Pane id of the agent that last received work (sticky strategy)
    pub last_agent: Option<String>,
    /// Pane index requested by the caller (explicit strategy)
    pub explicit_pane: Option<u32>,
}

/// Selection capability: one method.
pub trait Strategy: Send + Sync {
    /// Stable strategy name.
    fn name(&self) -> &'static str;

    /// Pick an index into `agents`, or none.
    fn select(&self, agents: &[ScoredAgent], ctx: &RoutingContext) -> Option<usize>;
}

/// The named strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    LeastLoaded,
    FirstAvailable,
    RoundRobin,
    RoundRobinAvailable,
    Random,
    Sticky,
    Explicit,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl StrategyKind {
    /// Stable kebab-case name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::LeastLoaded => "least-loaded",
            Self::FirstAvailable => "first-available",
            Self::RoundRobin => "round-robin",
            Self::RoundRobinAvailable => "round-robin-available",
            Self::Random => "random",
            Self::Sticky => "sticky",
            Self::Explicit => "explicit",
        }
    }

    /// Parse a kebab-case strategy name.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "least-loaded" => Ok(Self::LeastLoaded),
            "first-available" => Ok(Self::FirstAvailable),
            "round-robin" => Ok(Self::RoundRobin),
            "round-robin-available" => Ok(Self::RoundRobinAvailable),
            "random" => Ok(Self::Random),
            "sticky" => Ok(Self::Sticky),
            "explicit" => Ok(Self::Explicit),
            other => Err(Error::InvalidFlag(format!("unknown strategy: {other}"))),
        }
    }

    fn build(self, seed: Option<u64>) -> Box<dyn Strategy> {
        match self {
            Self::LeastLoaded => Box::new(LeastLoaded),
            Self::FirstAvailable => Box::new(FirstAvailable),
            Self::RoundRobin => Box::new(RoundRobin::default()),
            Self::RoundRobinAvailable => Box::new(RoundRobinAvailable::default()),
            Self::Random => Box::new(Random::new(seed)),
            Self::Sticky => Box::new(Sticky),
            Self::Explicit => Box::new(Explicit),
        }
    }
}

/// Highest score among non-excluded agents; ties break on pane index.
fn least_loaded_index(agents: &[ScoredAgent]) -> Option<usize> {
    agents
        .iter()
        .enumerate()
        .filter(|(_, a)| !a.excluded)
        .max_by(|(_, a), (_, b)| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.pane_index.cmp(&a.pane_index))
        })
        .map(|(i, _)| i)
}

struct LeastLoaded;

impl Strategy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least-loaded"
    }

    fn select(&self, agents: &[ScoredAgent], _ctx: &RoutingContext) -> Option<usize> {
        least_loaded_index(agents)
    }
}

struct FirstAvailable;

impl Strategy for FirstAvailable {
    fn name(&self) -> &'static str {
        "first-available"
    }

    fn select(&self, agents: &[ScoredAgent], _ctx: &RoutingContext) -> Option<usize> {
        agents
            .iter()
            .position(|a| !a.excluded && a.state == AgentState::Waiting)
    }
}

#[derive(Default)]
struct RoundRobin {
    cursor: AtomicUsize,
}

impl Strategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(&self, agents: &[ScoredAgent], _ctx: &RoutingContext) -> Option<usize> {
        if agents.is_empty() {
            return None;
        }
        // Rotates over all agents, exclusion included.
        Some(self.cursor.fetch_add(1, Ordering::SeqCst) % agents.len())
    }
}

#[derive(Default)]
struct RoundRobinAvailable {
    cursor: AtomicUsize,
}

impl Strategy for RoundRobinAvailable {
    fn name(&self) -> &'static str {
        "round-robin-available"
    }

    fn select(&self, agents: &[ScoredAgent], _ctx: &RoutingContext) -> Option<usize> {
        let available: Vec<usize> = agents
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.excluded)
            .map(|(i, _)| i)
            .collect();
        if available.is_empty() {
            return None;
        }
        let slot = self.cursor.fetch_add(1, Ordering::SeqCst) % available.len();
        Some(available[slot])
    }
}

struct Random {
    rng: Mutex<StdRng>,
}

impl Random {
    fn new(seed: Option<u64>) -> Self {
        let rng = seed.map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);
        Self {
            rng: Mutex::new(rng),
        }
    }
}

impl Strategy for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(&self, agents: &[ScoredAgent], _ctx: &RoutingContext) -> Option<usize> {
        let available: Vec<usize> = agents
            .iter()
            .enumerate()
            .filter(|(_, a)| !a.excluded)
            .map(|(i, _)| i)
            .collect();
        if available.is_empty() {
            return None;
        }
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let slot = rng.random_range(0..available.len());
        Some(available[slot])
    }
}

struct Sticky;

impl Strategy for Sticky {
    fn name(&self) -> &'static str {
        "sticky"
    }

    fn select(&self, agents: &[ScoredAgent], ctx: &RoutingContext) -> Option<usize> {
        if let Some(last) = &ctx.last_agent {
            let sticky = agents
                .iter()
                .position(|a| !a.excluded && a.pane_id == *last);
            if sticky.is_some() {
                return sticky;
            }
        }
        least_loaded_index(agents)
    }
}

struct Explicit;

impl Strategy for Explicit {
    fn name(&self) -> &'static str {
        "explicit"
    }

    fn select(&self, agents: &[ScoredAgent], ctx: &RoutingContext) -> Option<usize> {
        let wanted = ctx.explicit_pane?;
        // Explicit requests bypass exclusion.
        agents.iter().position(|a| a.pane_index == wanted)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Fixed fallback order, tried after the primary strategy fails.
const FALLBACK_CHAIN: &[StrategyKind] = &[
    StrategyKind::LeastLoaded,
    StrategyKind::FirstAvailable,
    StrategyKind::RoundRobinAvailable,
];

/// A prompt-mentioned path that is reserved, and by whom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservedPath {
    pub path: String,
    pub holders: Vec<String>,
}

/// Reservation annotation on a routing result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationWarning {
    /// Mentioned paths that are reserved
    pub reserved_paths: Vec<ReservedPath>,
    /// Whether the selected pane's mapped agent holds any of them
    pub selected_agent_is_holder: Option<bool>,
}

/// Outcome of a routing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingResult {
    /// Chosen agent, when any strategy succeeded
    pub selected: Option<ScoredAgent>,
    /// Strategy that made the selection (or the primary, when none did)
    pub strategy: String,
    /// Every scored candidate; excluded ones carry `excluded = true`
    pub candidates: Vec<ScoredAgent>,
    /// Pane ids of the excluded candidates
    pub excluded: Vec<String>,
    /// Whether a fallback strategy made the selection
    pub fallback_used: bool,
    /// Human-readable explanation
    pub reason: String,
    /// Present when the prompt mentions reserved paths
    pub reservation_warning: Option<ReservationWarning>,
}

/// Runs a primary strategy with a fallback chain and reservation checks.
pub struct Router {
    primary: StrategyKind,
    strategies: Vec<(StrategyKind, Box<dyn Strategy>)>,
    relaxation: bool,
    cache: Option<Arc<ReservationCache>>,
    respect_reservations: bool,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("primary", &self.primary)
            .field("relaxation", &self.relaxation)
            .field("respect_reservations", &self.respect_reservations)
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Create a router with the given primary strategy.
    #[must_use]
    pub fn new(primary: StrategyKind) -> Self {
        Self::with_options(primary, false, None, None, false)
    }

    /// Fully configured constructor.
    #[must_use]
    pub fn with_options(
        primary: StrategyKind,
        relaxation: bool,
        seed: Option<u64>,
        cache: Option<Arc<ReservationCache>>,
        respect_reservations: bool,
    ) -> Self {
        let mut kinds = vec![primary];
        kinds.extend(FALLBACK_CHAIN.iter().copied().filter(|k| *k != primary));
        let strategies = kinds
            .into_iter()
            .map(|kind| (kind, kind.build(seed)))
            .collect();
        Self {
            primary,
            strategies,
            relaxation,
            cache,
            respect_reservations,
        }
    }

    /// Route a prompt over the scored candidates.
    pub fn route(
        &self,
        mut agents: Vec<ScoredAgent>,
        ctx: &RoutingContext,
        prompt: Option<&str>,
    ) -> RoutingResult {
        let mentioned = self.reserved_mentions(prompt);

        if self.respect_reservations && !mentioned.is_empty() {
            let holders: BTreeSet<&str> = mentioned
                .iter()
                .flat_map(|p| p.holders.iter().map(String::as_str))
                .collect();
            for agent in &mut agents {
                if agent.excluded {
                    continue;
                }
                let is_holder = agent
                    .agent_name
                    .as_deref()
                    .is_some_and(|name| holders.contains(name));
                if !is_holder {
                    agent.excluded = true;
                    agent.score = 0.0;
                    agent.exclude_reason =
                        Some("not a holder of mentioned reservations".to_string());
                }
            }
        }

        let mut selection = self.try_strategies(&agents, ctx);

        if selection.is_none() && self.relaxation {
            let mut relaxed = false;
            for agent in &mut agents {
                if agent.excluded && agent.state == AgentState::Thinking {
                    agent.excluded = false;
                    agent.exclude_reason = None;
                    relaxed = true;
                }
            }
            if relaxed {
                debug!("Relaxed thinking exclusions; retrying selection");
                selection = self.try_strategies(&agents, ctx);
            }
        }

        let excluded: Vec<String> = agents
            .iter()
            .filter(|a| a.excluded)
            .map(|a| a.pane_id.clone())
            .collect();

        let (selected, strategy, fallback_used, reason) = match selection {
            Some((index, kind, fallback_used)) => {
                let agent = agents[index].clone();
                let reason = if fallback_used {
                    format!("fallback to {kind}")
                } else {
                    format!("selected by {kind}")
                };
                (Some(agent), kind.name().to_string(), fallback_used, reason)
            }
            None => (
                None,
                self.primary.name().to_string(),
                false,
                "no eligible agent".to_string(),
            ),
        };

        let reservation_warning = if mentioned.is_empty() {
            None
        } else {
            let selected_agent_is_holder = selected.as_ref().map(|agent| {
                agent.agent_name.as_deref().is_some_and(|name| {
                    mentioned
                        .iter()
                        .any(|p| p.holders.iter().any(|h| h == name))
                })
            });
            Some(ReservationWarning {
                reserved_paths: mentioned,
                selected_agent_is_holder,
            })
        };

        RoutingResult {
            selected,
            strategy,
            candidates: agents,
            excluded,
            fallback_used,
            reason,
            reservation_warning,
        }
    }

    fn try_strategies(
        &self,
        agents: &[ScoredAgent],
        ctx: &RoutingContext,
    ) -> Option<(usize, StrategyKind, bool)> {
        for (position, (kind, strategy)) in self.strategies.iter().enumerate() {
            if let Some(index) = strategy.select(agents, ctx) {
                return Some((index, *kind, position > 0));
            }
        }
        None
    }

    /// Prompt-mentioned paths that have active reservation holders.
    fn reserved_mentions(&self, prompt: Option<&str>) -> Vec<ReservedPath> {
        let (Some(cache), Some(prompt)) = (&self.cache, prompt) else {
            return Vec::new();
        };
        let paths = extract_paths(prompt);
        if paths.is_empty() {
            return Vec::new();
        }
        cache.ensure_fresh();
        paths
            .into_iter()
            .filter_map(|path| {
                let holders = cache.holders_for_path(&path);
                if holders.is_empty() {
                    None
                } else {
                    Some(ReservedPath {
                        path,
                        holders: holders.into_iter().collect(),
                    })
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Session-level routing
// ---------------------------------------------------------------------------

/// Resolves externally computed per-pane facts (context usage, reservation
/// agent names) during session routing. Function-valued so callers can wire
/// in whatever bookkeeping they maintain.
pub struct PaneFacts {
    /// Context window usage percentage for a pane, when known
    pub context_usage: Box<dyn Fn(&str) -> Option<f64> + Send + Sync>,
    /// Reservation-system agent name mapped to a pane, when known
    pub agent_name: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl Default for PaneFacts {
    fn default() -> Self {
        Self {
            context_usage: Box::new(|_| None),
            agent_name: Box::new(|_| None),
        }
    }
}

impl fmt::Debug for PaneFacts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaneFacts").finish_non_exhaustive()
    }
}

/// Routes a prompt to the best agent pane of a session: enumerates panes,
/// classifies each, folds in health and backoff state, scores, and selects.
pub struct SessionRouting {
    adapter: Arc<dyn TerminalAdapter>,
    classifier: Arc<ActivityClassifier>,
    tracker: Arc<HealthTracker>,
    backoff: Arc<BackoffManager>,
    scorer: AgentScorer,
    router: Router,
    facts: PaneFacts,
}

impl fmt::Debug for SessionRouting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRouting")
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl SessionRouting {
    /// Assemble the session-routing pipeline.
    #[must_use]
    pub fn new(
        adapter: Arc<dyn TerminalAdapter>,
        classifier: Arc<ActivityClassifier>,
        tracker: Arc<HealthTracker>,
        backoff: Arc<BackoffManager>,
        scorer: AgentScorer,
        router: Router,
        facts: PaneFacts,
    ) -> Self {
        Self {
            adapter,
            classifier,
            tracker,
            backoff,
            scorer,
            router,
            facts,
        }
    }

    /// Route a prompt over the session's agent panes. Per-pane sampling
    /// failures are absorbed (the pane is classified from whatever
    /// snapshots it already has); a missing session is an error.
    pub fn route_prompt(
        &self,
        session: &str,
        prompt: Option<&str>,
        ctx: &RoutingContext,
    ) -> Result<RoutingResult> {
        if !self.adapter.session_exists(session)? {
            return Err(Error::SessionNotFound(session.to_string()));
        }
        let panes = self.adapter.panes(session)?;

        let mut candidates = Vec::with_capacity(panes.len());
        for pane in panes {
            let agent_type = pane.agent_family();
            if !agent_type.is_agent() {
                continue;
            }
            let sample = match self.classifier.sample(self.adapter.as_ref(), &pane.id, agent_type)
            {
                Ok(sample) => sample,
                Err(err) => {
                    debug!(pane_id = %pane.id, error = %err, "Sampling failed; using prior snapshots");
                    self.classifier.classify(&pane.id, agent_type)
                }
            };
            let health_state = self
                .tracker
                .current_state(&pane.id)
                .unwrap_or(HealthState::Healthy);
            let last_activity = sample
                .last_output_at
                .or_else(|| self.adapter.last_activity(&pane.id).ok());
            candidates.push(AgentCandidate {
                context_usage: (self.facts.context_usage)(&pane.id).unwrap_or(0.0),
                agent_name: (self.facts.agent_name)(&pane.id),
                pane_id: pane.id.clone(),
                agent_type,
                pane_index: pane.index,
                state: sample.state,
                confidence: sample.confidence,
                velocity: sample.velocity,
                last_activity,
                health_state,
                rate_limited: self.backoff.is_in_backoff(&pane.id),
            });
        }

        let scored = self.scorer.score_all(&candidates, prompt);
        Ok(self.router.route(scored, ctx, prompt))
    }
}
