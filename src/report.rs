use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::aggregate::{Aggregate, SessionCounters, StatisticsSnapshot};
use crate::phase::PhaseStatus;
use crate::sla::SlaFailure;

/// A human- or machine-friendly view derived from an [`Aggregate`].
///
/// Aggregates only hold what can be merged. Everything derived (ratios, means,
/// percentiles) is computed here, once, from the merged aggregate.
pub trait Report<A>
where
    Self: Send + Sync + Debug + Serialize + DeserializeOwned,
    A: Aggregate,
{
    fn summarize(source: &A, percentiles: &[f64]) -> Self;
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Percentile {
    pub percentile: f64,
    pub latency: Duration,
}

/// Summary of one operation kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSummary {
    pub requests: u64,
    pub responses: u64,
    pub successes: u64,
    pub invalid: u64,
    pub connection_errors: u64,
    pub timeouts: u64,
    pub internal_errors: u64,
    /// Successful share of completed operations, in percent.
    pub success_ratio: f64,
    pub min: Duration,
    pub mean: Duration,
    pub stddev: Duration,
    pub max: Duration,
    pub percentiles: Vec<Percentile>,
}

impl Report<StatisticsSnapshot> for StatisticsSummary {
    fn summarize(snapshot: &StatisticsSnapshot, percentiles: &[f64]) -> Self {
        let histogram = snapshot.histogram();
        let empty = histogram.is_empty();
        let latency = |nanos: f64| {
            if empty || !nanos.is_finite() {
                Duration::ZERO
            } else {
                Duration::from_nanos(nanos as u64)
            }
        };
        let completed = snapshot.completed();
        Self {
            requests: snapshot.requests,
            responses: snapshot.responses,
            successes: snapshot.successes,
            invalid: snapshot.invalid,
            connection_errors: snapshot.connection_errors,
            timeouts: snapshot.timeouts,
            internal_errors: snapshot.internal_errors,
            success_ratio: if completed == 0 {
                0.
            } else {
                snapshot.successes as f64 / completed as f64 * 100.
            },
            min: latency(histogram.min() as f64),
            mean: latency(histogram.mean()),
            stddev: latency(histogram.stdev()),
            max: latency(histogram.max() as f64),
            percentiles: percentiles
                .iter()
                .map(|&percentile| Percentile {
                    percentile,
                    latency: latency(histogram.value_at_percentile(percentile) as f64),
                })
                .collect(),
        }
    }
}

/// What happened in one phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub name: String,
    pub status: PhaseStatus,
    pub strategy: String,
    /// From start to the moment the phase stopped starting sessions.
    pub duration: Duration,
    pub sessions: SessionCounters,
    /// Highest number of concurrent sessions, summed over shards.
    pub max_sessions_used: usize,
    pub statistics: BTreeMap<String, StatisticsSummary>,
    /// Empty when every SLA of the phase held.
    #[serde(default)]
    pub sla_failures: Vec<SlaFailure>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every phase terminated. Says nothing about the health of the target.
    Completed,
    /// The engine hit an internal fault and stopped early.
    Aborted { reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub name: String,
    pub outcome: RunOutcome,
    pub duration: Duration,
    pub phases: Vec<PhaseReport>,
}

impl RunReport {
    pub fn is_aborted(&self) -> bool {
        matches!(self.outcome, RunOutcome::Aborted { .. })
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseReport> {
        self.phases.iter().find(|phase| phase.name == name)
    }

    /// The run completed and no phase failed an SLA.
    pub fn is_passing(&self) -> bool {
        !self.is_aborted() && self.phases.iter().all(|phase| phase.sla_failures.is_empty())
    }
}
