use std::collections::BTreeMap;
use std::fmt::Debug;

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ContractViolation};
use crate::metric::{Outcome, Sample};

/// The `Aggregate` trait defines how raw measurements are folded into a compact,
/// mergeable representation.
///
/// Each executor shard owns its aggregates exclusively and feeds them from the hot
/// path. At reporting boundaries (phase end, run end) the shards hand copies to the
/// controller, which merges them. Aggregates store counters and histograms only;
/// derived values (percentiles, ratios) belong to [`crate::report`].
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative**: partial aggregates from any
///   subset of shards, combined in any order, must equal the full aggregate.
/// - `merge` combines structure (bucket counts, sums). It never replays samples.
/// - Merging aggregates of different shapes is a contract violation, not a silent
///   approximation.
pub trait Aggregate
where
    Self: Send + Debug + Clone,
{
    /// The measurement this aggregate summarizes.
    type Metric;

    /// Aggregate multiple metrics into the current instance.
    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    /// Incorporate a single metric into the aggregate.
    fn consume(&mut self, metric: &Self::Metric);

    /// Combine another aggregate into this one.
    fn merge(&mut self, other: &Self) -> Result<(), ContractViolation>;
}

/// Dimensions of the latency histograms, in nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramShape {
    pub highest_nanos: u64,
    pub sigfig: u8,
}

impl Default for HistogramShape {
    fn default() -> Self {
        Self {
            highest_nanos: 60_000_000_000,
            sigfig: 2,
        }
    }
}

/// Counters and latency distribution of one operation kind.
#[derive(Clone, Debug, PartialEq)]
pub struct StatisticsSnapshot {
    histogram: Histogram<u64>,
    pub requests: u64,
    pub responses: u64,
    pub successes: u64,
    pub invalid: u64,
    pub connection_errors: u64,
    pub timeouts: u64,
    pub internal_errors: u64,
}

impl StatisticsSnapshot {
    pub fn new(shape: HistogramShape) -> Result<Self, ConfigError> {
        let histogram = Histogram::new_with_bounds(1, shape.highest_nanos, shape.sigfig)
            .map_err(|e| ConfigError::Histogram(format!("{e:?}")))?;
        Ok(Self {
            histogram,
            requests: 0,
            responses: 0,
            successes: 0,
            invalid: 0,
            connection_errors: 0,
            timeouts: 0,
            internal_errors: 0,
        })
    }

    pub fn histogram(&self) -> &Histogram<u64> {
        &self.histogram
    }

    /// Failed operations of any category.
    pub fn failures(&self) -> u64 {
        self.invalid + self.connection_errors + self.timeouts + self.internal_errors
    }

    /// Operations that reached an outcome.
    pub fn completed(&self) -> u64 {
        self.successes + self.failures()
    }

    pub fn is_empty(&self) -> bool {
        self.requests == 0 && self.completed() == 0
    }

    pub fn record_request(&mut self) {
        self.requests += 1;
    }

    pub fn reset(&mut self) {
        self.histogram.reset();
        self.requests = 0;
        self.responses = 0;
        self.successes = 0;
        self.invalid = 0;
        self.connection_errors = 0;
        self.timeouts = 0;
        self.internal_errors = 0;
    }
}

impl Aggregate for StatisticsSnapshot {
    type Metric = Sample;

    fn consume(&mut self, sample: &Sample) {
        if sample.outcome.has_response() {
            self.responses += 1;
            if sample.latency_nanos > self.histogram.high() {
                tracing::warn!(
                    "Latency {}ns exceeds the highest trackable value {}ns",
                    sample.latency_nanos,
                    self.histogram.high()
                );
            }
            self.histogram.saturating_record(sample.latency_nanos);
        }
        match sample.outcome {
            Outcome::Success => self.successes += 1,
            Outcome::Invalid => self.invalid += 1,
            Outcome::ConnectionError => self.connection_errors += 1,
            Outcome::Timeout => self.timeouts += 1,
            Outcome::InternalError => self.internal_errors += 1,
        }
    }

    fn merge(&mut self, other: &Self) -> Result<(), ContractViolation> {
        let incompatible = |reason: String| ContractViolation::IncompatibleSnapshots {
            metric: String::new(),
            reason,
        };
        if self.histogram.high() != other.histogram.high()
            || self.histogram.sigfig() != other.histogram.sigfig()
        {
            return Err(incompatible(format!(
                "histogram bounds {}/{} vs {}/{}",
                self.histogram.high(),
                self.histogram.sigfig(),
                other.histogram.high(),
                other.histogram.sigfig()
            )));
        }
        self.histogram
            .add(&other.histogram)
            .map_err(|e| incompatible(format!("{e:?}")))?;
        self.requests += other.requests;
        self.responses += other.responses;
        self.successes += other.successes;
        self.invalid += other.invalid;
        self.connection_errors += other.connection_errors;
        self.timeouts += other.timeouts;
        self.internal_errors += other.internal_errors;
        Ok(())
    }
}

/// Immutable per-operation-kind statistics, keyed by metric name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatisticsSet {
    by_metric: BTreeMap<String, StatisticsSnapshot>,
}

impl StatisticsSet {
    pub fn get(&self, metric: &str) -> Option<&StatisticsSnapshot> {
        self.by_metric.get(metric)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StatisticsSnapshot)> {
        self.by_metric.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.by_metric.values().all(StatisticsSnapshot::is_empty)
    }

    pub fn len(&self) -> usize {
        self.by_metric.len()
    }

    /// Merges `other` into `self`, metric by metric.
    pub fn merge(&mut self, other: &StatisticsSet) -> Result<(), ContractViolation> {
        for (metric, theirs) in &other.by_metric {
            match self.by_metric.get_mut(metric) {
                Some(mine) => mine.merge(theirs).map_err(|e| match e {
                    ContractViolation::IncompatibleSnapshots { reason, .. } => {
                        ContractViolation::IncompatibleSnapshots {
                            metric: metric.clone(),
                            reason,
                        }
                    }
                    other => other,
                })?,
                None => {
                    self.by_metric.insert(metric.clone(), theirs.clone());
                }
            }
        }
        Ok(())
    }
}

/// Combines two snapshot sets into a new one.
pub fn merge(a: &StatisticsSet, b: &StatisticsSet) -> Result<StatisticsSet, ContractViolation> {
    let mut merged = a.clone();
    merged.merge(b)?;
    Ok(merged)
}

/// Single-writer statistics recorder of one phase on one shard.
#[derive(Clone, Debug)]
pub struct Statistics {
    template: StatisticsSnapshot,
    current: StatisticsSet,
}

impl Statistics {
    pub fn new(shape: HistogramShape) -> Result<Self, ConfigError> {
        Ok(Self {
            template: StatisticsSnapshot::new(shape)?,
            current: StatisticsSet::default(),
        })
    }

    fn with_entry(&mut self, metric: &str, f: impl FnOnce(&mut StatisticsSnapshot)) {
        match self.current.by_metric.get_mut(metric) {
            Some(snapshot) => f(snapshot),
            None => {
                let mut snapshot = self.template.clone();
                f(&mut snapshot);
                self.current.by_metric.insert(metric.to_owned(), snapshot);
            }
        }
    }

    /// Counts an attempted operation.
    pub fn record_request(&mut self, metric: &str) {
        self.with_entry(metric, StatisticsSnapshot::record_request);
    }

    /// Records the outcome of an operation.
    pub fn record(&mut self, metric: &str, outcome: Outcome, latency_nanos: u64) {
        let sample = Sample {
            outcome,
            latency_nanos,
        };
        self.with_entry(metric, |snapshot| snapshot.consume(&sample));
    }

    /// An immutable copy of everything recorded since the last reset.
    pub fn snapshot(&self) -> StatisticsSet {
        self.current.clone()
    }

    /// Forgets everything recorded so far. Called at phase boundaries.
    pub fn reset(&mut self) {
        for snapshot in self.current.by_metric.values_mut() {
            snapshot.reset();
        }
    }
}

/// Session lifecycle events of a phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    Started,
    /// A session start was skipped because the pool was exhausted.
    Blocked,
    Completed,
    Failed,
    Terminated,
}

/// Per-phase session counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounters {
    pub started: u64,
    pub blocked: u64,
    pub completed: u64,
    pub failed: u64,
    pub terminated: u64,
}

impl SessionCounters {
    /// Sessions that have reached a terminal state.
    pub fn ended(&self) -> u64 {
        self.completed + self.failed + self.terminated
    }

    pub fn live(&self) -> u64 {
        self.started.saturating_sub(self.ended())
    }
}

impl Aggregate for SessionCounters {
    type Metric = SessionEvent;

    fn consume(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Started => self.started += 1,
            SessionEvent::Blocked => self.blocked += 1,
            SessionEvent::Completed => self.completed += 1,
            SessionEvent::Failed => self.failed += 1,
            SessionEvent::Terminated => self.terminated += 1,
        }
    }

    fn merge(&mut self, other: &Self) -> Result<(), ContractViolation> {
        self.started += other.started;
        self.blocked += other.blocked;
        self.completed += other.completed;
        self.failed += other.failed;
        self.terminated += other.terminated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statistics() -> Statistics {
        Statistics::new(HistogramShape::default()).unwrap()
    }

    #[test]
    fn record_by_outcome() {
        let mut stats = statistics();
        stats.record_request("get");
        stats.record_request("get");
        stats.record_request("get");
        stats.record("get", Outcome::Success, 1_000);
        stats.record("get", Outcome::Invalid, 3_000);
        stats.record("get", Outcome::Timeout, 0);

        let snapshot = stats.snapshot();
        let get = snapshot.get("get").unwrap();
        assert_eq!(get.requests, 3);
        assert_eq!(get.responses, 2);
        assert_eq!(get.successes, 1);
        assert_eq!(get.invalid, 1);
        assert_eq!(get.timeouts, 1);
        assert_eq!(get.failures(), 2);
        assert_eq!(get.histogram().len(), 2);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let mut stats = statistics();
        stats.record("get", Outcome::Success, 10);
        let before = stats.snapshot();
        stats.record("get", Outcome::Success, 10);
        assert_eq!(before.get("get").unwrap().successes, 1);
        assert_eq!(stats.snapshot().get("get").unwrap().successes, 2);
    }

    #[test]
    fn reset_clears_metrics_of_the_same_name() {
        let mut stats = statistics();
        stats.record_request("get");
        stats.record("get", Outcome::Success, 10);
        stats.reset();
        assert!(stats.snapshot().is_empty());
        stats.record("get", Outcome::ConnectionError, 0);
        let get = stats.snapshot().get("get").cloned().unwrap();
        assert_eq!(get.successes, 0);
        assert_eq!(get.connection_errors, 1);
    }

    #[test]
    fn merge_sums_counters_and_histograms() {
        let mut a = statistics();
        let mut b = statistics();
        a.record("get", Outcome::Success, 100);
        b.record("get", Outcome::Success, 200);
        b.record("post", Outcome::InternalError, 0);

        let merged = merge(&a.snapshot(), &b.snapshot()).unwrap();
        let get = merged.get("get").unwrap();
        assert_eq!(get.successes, 2);
        assert_eq!(get.histogram().len(), 2);
        assert_eq!(merged.get("post").unwrap().internal_errors, 1);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn merge_of_different_shapes_is_rejected() {
        let mut a = statistics();
        let mut b = Statistics::new(HistogramShape {
            highest_nanos: 1_000_000,
            sigfig: 3,
        })
        .unwrap();
        a.record("get", Outcome::Success, 1);
        b.record("get", Outcome::Success, 1);
        let err = merge(&a.snapshot(), &b.snapshot()).unwrap_err();
        assert!(matches!(
            err,
            ContractViolation::IncompatibleSnapshots { ref metric, .. } if metric == "get"
        ));
    }

    #[test]
    fn latency_above_range_is_clamped() {
        let mut stats = Statistics::new(HistogramShape {
            highest_nanos: 1_000_000,
            sigfig: 2,
        })
        .unwrap();
        stats.record("get", Outcome::Success, 5_000_000);
        let snapshot = stats.snapshot();
        let histogram = snapshot.get("get").unwrap().histogram();
        assert_eq!(histogram.len(), 1);
        assert!(histogram.max() <= 1_100_000);
    }

    #[test]
    fn invalid_shape_is_a_config_error() {
        assert!(matches!(
            Statistics::new(HistogramShape {
                highest_nanos: 1,
                sigfig: 2
            }),
            Err(ConfigError::Histogram(_))
        ));
    }

    #[test]
    fn session_counters() {
        let mut counters = SessionCounters::default();
        counters.aggregate(&[
            SessionEvent::Started,
            SessionEvent::Started,
            SessionEvent::Blocked,
            SessionEvent::Completed,
        ]);
        assert_eq!(counters.live(), 1);
        let mut other = SessionCounters::default();
        other.consume(&SessionEvent::Terminated);
        counters.merge(&other).unwrap();
        assert_eq!(counters.ended(), 2);
        assert_eq!(counters.blocked, 1);
    }
}
