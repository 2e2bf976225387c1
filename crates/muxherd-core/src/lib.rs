//! muxherd-core: orchestration fabric for terminal-hosted AI coding agents
//!
//! Observes agent panes inside a terminal multiplexer, classifies what each
//! agent is doing, routes new work to the most suitable agent, detects
//! file-edit conflicts between agents, and recovers misbehaving agents with
//! bounded automatic restarts.
//!
//! # Architecture
//!
//! ```text
//! TerminalAdapter ──► ActivityClassifier ──► HealthSupervisor ──► RestartManager
//!        │                    │                     │                  │
//!        │                    ▼                     ▼                  ▼
//!        │              AgentScorer ──► Router             BackoffManager
//!        │                    ▲
//! ReservationStore ──► ReservationCache        ConflictDetector ◄── git status
//! ```
//!
//! # Modules
//!
//! - `terminal`: multiplexer adapter trait, pane targets, agent families
//! - `capture`: bounded retention of captured pane output
//! - `activity`: activity state classification with velocity estimation
//! - `health`: health checks, transition tracking, restart supervision
//! - `backoff`: exponential rate-limit backoff
//! - `restart`: bounded soft/hard restarts with cancellation
//! - `conflict`: activity windows joined with git status and reservations
//! - `reservations`: reservation store trait, glob dialect, TTL cache
//! - `scoring`: composite agent scoring with exclusions and affinity
//! - `routing`: strategies, fallback chain, reservation warnings
//! - `ack`: acknowledgment detection after message sends
//! - `registry`: per-session singletons of the supervision components
//! - `alerts`: operator alerts and sinks
//! - `config`: tunables with serde defaults and TOML loading
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod ack;
pub mod activity;
pub mod alerts;
pub mod backoff;
pub mod capture;
pub mod config;
pub mod conflict;
pub mod error;
pub mod health;
pub mod logging;
pub mod registry;
pub mod reservations;
pub mod restart;
pub mod routing;
pub mod scoring;
pub mod terminal;

pub use error::{Error, Result};

/// Crate version, for reports and diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
