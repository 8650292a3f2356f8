//! Stampede: the execution core of a distributed load generator.
//!
//! Stampede runs a [`Benchmark`]: a set of phases, each starting simulated users
//! (sessions) according to a [`ScalingStrategy`] and walking them through a
//! [`Scenario`]. The protocol work (HTTP, databases, anything) is done by plugins;
//! the core only schedules, tracks and measures.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`Runner`]: the phase scheduler and lifecycle API (`init`, `open_connections`,
//!   `start_phase`, `finish_phase`, `try_terminate_phase`, `terminate_phase`,
//!   `shutdown`) plus statistics and session pulls for progress reporting.
//! - Executor shards: single-task executors, each owning its sessions, pools,
//!   statistics and plugin instances. They only communicate with the runner
//!   through messages.
//! - [`Session`]: the state machine of one simulated user, with forked branches,
//!   joins, delays and generation-tagged callbacks.
//! - [`Pool`]: bounded object pool. Exhaustion is backpressure, counted as
//!   `blocked`, never an error.
//! - [`SearchValidator`]: incremental pattern matching over fragmented responses.
//! - [`Aggregate`]: mergeable statistics (counters plus HDR histograms).
//! - [`Report`]: derived summaries (percentiles, ratios) of merged aggregates.
//! - [`Sla`]: limits on error ratio and response times, checked when a phase
//!   terminates and reported per phase.
//! - [`Plugin`]: the seam to protocol implementations, looked up by tag in a
//!   [`PluginRegistry`].
//!
//! # Errors
//!
//! Broken benchmarks are rejected before anything runs ([`ConfigError`]).
//! Operation failures are data, recorded per outcome. Engine faults
//! ([`ContractViolation`]) abort the run and are flagged distinctly in the
//! [`RunReport`].
//!
//! # Feature flags
//! - `internals`: expose the unstable arrival arithmetic in `executor::rate`

/// Metric aggregators
pub mod aggregate;
/// Benchmark and phase definitions
pub mod benchmark;
/// Runtime settings
pub mod config;
pub mod error;
/// Shards and rate arithmetic
pub mod executor;
/// Streaming response validation
pub mod matcher;
/// Single measurements
pub mod metric;
pub mod phase;
/// Protocol plugins
pub mod plugin;
pub mod pool;
/// Derived reports
pub mod report;
pub mod runner;
/// Static description of what a session does
pub mod scenario;
pub mod session;
/// Service level agreements over phase statistics
pub mod sla;

pub use aggregate::{Aggregate, SessionCounters, StatisticsSet, StatisticsSnapshot};
pub use benchmark::{Benchmark, Dependency, Phase, ScalingStrategy};
pub use config::RuntimeConfig;
pub use error::{ConfigError, ContractViolation, Error, PluginError, Result};
pub use matcher::{MatchCount, SearchValidator};
pub use metric::{Outcome, Sample};
pub use phase::PhaseStatus;
pub use plugin::{Completer, Completion, FailureKind, Plugin, PluginFactory, PluginRegistry, Request};
pub use pool::{Acquire, Pool, SlotId};
pub use report::{PhaseReport, Report, RunOutcome, RunReport, StatisticsSummary};
pub use runner::Runner;
pub use scenario::{Action, OperationStep, Scenario, Sequence, Step};
pub use session::{Session, SessionView};
pub use sla::{PercentileLimit, Sla, SlaFailure};
