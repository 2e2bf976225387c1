//! Cross-module integration tests: capture → classify → score → route,
//! plus supervised recovery over an in-memory terminal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::watch;

use muxherd_core::activity::{ActivityClassifier, AgentState};
use muxherd_core::alerts::{Alert, BufferingAlertSink};
use muxherd_core::backoff::BackoffManager;
use muxherd_core::config::{ActivityConfig, BackoffConfig, MuxherdConfig, RestartConfig};
use muxherd_core::conflict::{parse_porcelain, ConflictDetector, ConflictReason};
use muxherd_core::health::{HealthState, HealthSupervisor, HealthTracker};
use muxherd_core::registry::Registries;
use muxherd_core::reservations::{FileReservation, ReservationCache, StaticReservationStore};
use muxherd_core::restart::{RestartManager, RestartType};
use muxherd_core::routing::{Router, RoutingContext, StrategyKind};
use muxherd_core::scoring::{AgentCandidate, AgentScorer};
use muxherd_core::terminal::{AgentFamily, InMemoryTerminal, PaneTarget, TerminalAdapter};

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("valid timestamp")
}

fn candidate_from_sample(
    pane_id: &str,
    index: u32,
    classifier: &ActivityClassifier,
    context_usage: f64,
    now: DateTime<Utc>,
) -> AgentCandidate {
    let sample = classifier.classify_at(pane_id, AgentFamily::Claude, now);
    AgentCandidate {
        pane_id: pane_id.to_string(),
        agent_type: AgentFamily::Claude,
        pane_index: index,
        agent_name: None,
        state: sample.state,
        confidence: sample.confidence,
        velocity: sample.velocity,
        context_usage,
        last_activity: sample.last_output_at,
        health_state: HealthState::Healthy,
        rate_limited: false,
    }
}

#[test]
fn classify_score_route_end_to_end() {
    let terminal = InMemoryTerminal::new();
    let waiting = terminal.add_pane("agents", 0, "cc");
    let generating = terminal.add_pane("agents", 1, "cc");
    let full = terminal.add_pane("agents", 2, "cc");

    let classifier = ActivityClassifier::new(&ActivityConfig::default());
    let now = at(600);

    // Pane 0 sits at an idle prompt.
    terminal.set_output(&waiting.id, "edits applied\nclaude>");
    let content = terminal.capture(&waiting.id, 50, None).expect("capture");
    classifier.observe_at(&waiting.id, &content, at(0));

    // Pane 1 streams output fast enough to classify as generating.
    let mut streamed = String::from("building\n");
    classifier.observe_at(&generating.id, &streamed, at(597));
    for i in 598..=600 {
        streamed.push_str(&"y".repeat(120));
        streamed.push('\n');
        classifier.observe_at(&generating.id, &streamed, at(i));
    }

    // Pane 2 is waiting too, but its context window is nearly spent.
    terminal.set_output(&full.id, "claude>");
    let content = terminal.capture(&full.id, 50, None).expect("capture");
    classifier.observe_at(&full.id, &content, at(0));

    let candidates = vec![
        candidate_from_sample(&waiting.id, 0, &classifier, 30.0, now),
        candidate_from_sample(&generating.id, 1, &classifier, 10.0, now),
        candidate_from_sample(&full.id, 2, &classifier, 90.0, now),
    ];
    assert_eq!(candidates[0].state, AgentState::Waiting);
    assert_eq!(candidates[1].state, AgentState::Generating);

    let scorer = AgentScorer::with_defaults();
    let scored = scorer.score_all_at(&candidates, None, now);
    assert!(!scored[0].excluded);
    assert!(scored[1].excluded, "generating pane is excluded");
    assert!(scored[2].excluded, "context-heavy pane is excluded");

    let router = Router::new(StrategyKind::LeastLoaded);
    let result = router.route(scored, &RoutingContext::default(), None);
    let selected = result.selected.expect("one eligible agent");
    assert_eq!(selected.pane_id, waiting.id);
    assert_eq!(result.candidates.len(), 3);
    assert_eq!(result.excluded.len(), 2);
}

#[test]
fn affinity_prefers_the_reservation_holder() {
    let now = Utc::now();
    let store = Arc::new(StaticReservationStore::new(vec![FileReservation {
        id: "r1".to_string(),
        agent_name: "Green".to_string(),
        path_pattern: "internal/**".to_string(),
        created_at: now,
        expires_at: now + ChronoDuration::seconds(600),
        released_at: None,
    }]));
    let cache = Arc::new(ReservationCache::new(
        store,
        "proj",
        Duration::from_secs(30),
    ));
    cache.refresh().expect("refresh succeeds");

    let routing = muxherd_core::config::RoutingConfig {
        affinity_enabled: true,
        ..Default::default()
    };
    let agent_mail = muxherd_core::config::AgentMailConfig {
        enabled: true,
        ..Default::default()
    };
    let scorer = AgentScorer::new(routing, &agent_mail, Some(cache.clone())).expect("valid weights");

    let base = AgentCandidate {
        pane_id: String::new(),
        agent_type: AgentFamily::Claude,
        pane_index: 0,
        agent_name: None,
        state: AgentState::Waiting,
        confidence: 0.9,
        velocity: 0.0,
        context_usage: 50.0,
        last_activity: None,
        health_state: HealthState::Healthy,
        rate_limited: false,
    };
    let green = AgentCandidate {
        pane_id: "G".to_string(),
        agent_name: Some("Green".to_string()),
        ..base.clone()
    };
    let blue = AgentCandidate {
        pane_id: "B".to_string(),
        pane_index: 1,
        agent_name: Some("Blue".to_string()),
        ..base
    };

    let scored = scorer.score_all(&[blue, green], Some("touch internal/service.go next"));
    let router = Router::with_options(
        StrategyKind::LeastLoaded,
        false,
        None,
        Some(cache),
        false,
    );
    let result = router.route(
        scored,
        &RoutingContext::default(),
        Some("touch internal/service.go next"),
    );

    let selected = result.selected.expect("selection succeeds");
    assert_eq!(selected.pane_id, "G", "affinity bonus breaks the tie");
    let warning = result.reservation_warning.expect("warning attached");
    assert_eq!(warning.selected_agent_is_holder, Some(true));
}

#[tokio::test]
async fn supervised_recovery_after_crash() {
    let terminal = Arc::new(InMemoryTerminal::new());
    let pane = terminal.add_pane("agents", 0, "cc");
    // The first checks see a crash; after the interrupt the prompt returns.
    terminal.push_output(&pane.id, "fatal error: agent wedged");
    terminal.push_output(&pane.id, "fatal error: agent wedged");
    terminal.push_output(&pane.id, "claude>");

    let sink = Arc::new(BufferingAlertSink::new());
    let classifier = Arc::new(ActivityClassifier::new(&ActivityConfig::default()));
    let tracker = Arc::new(HealthTracker::new(sink.clone()));
    let backoff = Arc::new(BackoffManager::new(&BackoffConfig::default()));
    let restarts = Arc::new(RestartManager::new(
        terminal.clone(),
        sink.clone(),
        RestartConfig {
            soft_timeout_secs: 1,
            poll_interval_ms: 10,
            ..RestartConfig::default()
        },
    ));
    let captures = Arc::new(muxherd_core::capture::OutputCapture::with_defaults());
    let supervisor = HealthSupervisor::new(
        terminal.clone(),
        classifier,
        tracker,
        backoff,
        restarts,
        captures,
        Duration::from_secs(120),
    );

    let (_tx, mut cancel) = watch::channel(false);
    let target = PaneTarget::new("agents", 0);
    let result = supervisor
        .auto_restart_if_unhealthy(&target, &pane.id, AgentFamily::Claude, &mut cancel)
        .await;

    assert!(result.success);
    assert_eq!(result.restart_type, RestartType::Soft);
    assert_eq!(terminal.interrupts(), vec![target]);

    let metrics = supervisor.tracker().metrics(&pane.id).expect("tracked");
    assert_eq!(metrics.current_state, HealthState::Healthy);
    assert_eq!(metrics.total_restarts, 1);
    assert!(sink
        .snapshot()
        .iter()
        .any(|a| matches!(a, Alert::HealthTransition { .. })));
}

#[test]
fn registries_hand_out_independent_sessions() {
    let terminal: Arc<InMemoryTerminal> = Arc::new(InMemoryTerminal::new());
    let sink = Arc::new(BufferingAlertSink::new());
    let registries = Registries::new(terminal, sink, &MuxherdConfig::default());

    let alpha = registries.backoffs.get_or_create("alpha");
    let beta = registries.backoffs.get_or_create("beta");
    alpha.record_rate_limit("%1");
    assert!(alpha.is_in_backoff("%1"));
    assert!(!beta.is_in_backoff("%1"));

    assert!(Arc::ptr_eq(
        &registries.trackers.get_or_create("alpha"),
        &registries.trackers.get_or_create("alpha")
    ));
}

#[test]
fn git_changes_feed_conflict_detection() {
    let detector = ConflictDetector::new();
    detector.record_activity_at("P1", AgentFamily::Claude, at(0), at(30), true, at(60));
    detector.record_activity_at("P2", AgentFamily::Codex, at(25), at(45), true, at(60));

    let porcelain = " M src/service.go\n?? notes/tmp.md\n";
    let changes = parse_porcelain(porcelain, |path| {
        (path == "src/service.go").then(|| at(28))
    });

    let conflicts = detector.detect_conflicts_at(&changes, &[], at(60));
    assert_eq!(conflicts.len(), 1, "change without mtime is skipped");
    let conflict = &conflicts[0];
    assert_eq!(conflict.path, "src/service.go");
    assert_eq!(conflict.git_status, " M");
    assert_eq!(conflict.confidence, 0.90);
    assert_eq!(conflict.reason, ConflictReason::ConcurrentActivity);
    assert_eq!(conflict.likely_modifiers, vec!["P1", "P2"]);
}

#[tokio::test]
async fn ack_watch_over_terminal_adapter() {
    let terminal = Arc::new(InMemoryTerminal::new());
    let pane = terminal.add_pane("agents", 0, "cc");
    terminal.push_output(&pane.id, "claude>");
    terminal.push_output(&pane.id, "claude> refactor the scorer\nworking on it now\nedits incoming");

    let monitor = muxherd_core::ack::AckMonitor::new(terminal);
    let request = muxherd_core::ack::AckRequest {
        poll: Duration::from_millis(10),
        timeout: Duration::from_secs(2),
        ..muxherd_core::ack::AckRequest::new(
            "agents",
            vec![pane.id.clone()],
            "refactor the scorer",
        )
    };
    let families = HashMap::from([(pane.id.clone(), AgentFamily::Claude)]);
    let (_tx, mut cancel) = watch::channel(false);

    let report = monitor.monitor(&request, &families, &mut cancel).await;
    assert!(!report.timed_out);
    assert_eq!(report.confirmations.len(), 1);
    assert_eq!(
        report.confirmations[0].ack_type,
        muxherd_core::ack::AckType::ExplicitAck
    );
}
