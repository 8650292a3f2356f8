//! Service level agreements checked against the statistics of a terminated phase.
//!
//! An [`Sla`] never stops a run. Violations end up in the phase report as
//! [`SlaFailure`]s, one per agreement and metric, naming the first limit that was
//! exceeded.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::aggregate::{StatisticsSet, StatisticsSnapshot};

/// Highest tolerated response time at one percentile.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PercentileLimit {
    pub percentile: f64,
    pub response_time: Duration,
}

impl PercentileLimit {
    pub fn new(percentile: f64, response_time: Duration) -> Self {
        Self {
            percentile,
            response_time,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct Sla {
    /// Metric the limits apply to. Every metric of the phase when absent.
    #[builder(default, setter(strip_option, into))]
    #[serde(default)]
    pub metric: Option<String>,
    /// Highest tolerated share of failed requests, between 0 and 1.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub error_ratio: Option<f64>,
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub mean_response_time: Option<Duration>,
    #[builder(default)]
    #[serde(default)]
    pub percentile_limits: Vec<PercentileLimit>,
}

/// A limit exceeded by one metric.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaFailure {
    pub metric: String,
    pub message: String,
}

impl Sla {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if let Some(ratio) = self.error_ratio
            && !(0. ..=1.).contains(&ratio)
        {
            return Err(format!("sla error ratio must be within [0, 1], got {ratio}"));
        }
        if let Some(limit) = self
            .percentile_limits
            .iter()
            .find(|limit| !(limit.percentile > 0. && limit.percentile <= 100.))
        {
            return Err(format!(
                "sla percentile must be within (0, 100], got {}",
                limit.percentile
            ));
        }
        Ok(())
    }

    /// Checks every metric the agreement covers.
    pub fn check(&self, statistics: &StatisticsSet) -> Vec<SlaFailure> {
        statistics
            .iter()
            .filter(|(metric, _)| self.metric.as_deref().is_none_or(|name| name == *metric))
            .filter_map(|(metric, snapshot)| {
                self.violation(snapshot).map(|message| SlaFailure {
                    metric: metric.to_owned(),
                    message,
                })
            })
            .collect()
    }

    fn violation(&self, snapshot: &StatisticsSnapshot) -> Option<String> {
        if let Some(limit) = self.error_ratio
            && snapshot.requests > 0
        {
            let actual = snapshot.failures() as f64 / snapshot.requests as f64;
            if actual > limit {
                return Some(format!(
                    "error ratio exceeded: limit {limit:.3}, actual {actual:.3}"
                ));
            }
        }
        let histogram = snapshot.histogram();
        if histogram.is_empty() {
            return None;
        }
        if let Some(limit) = self.mean_response_time {
            let actual = Duration::from_nanos(histogram.mean() as u64);
            if actual > limit {
                return Some(format!(
                    "mean response time exceeded: limit {limit:?}, actual {actual:?}"
                ));
            }
        }
        self.percentile_limits.iter().find_map(|limit| {
            let actual = Duration::from_nanos(histogram.value_at_percentile(limit.percentile));
            (actual > limit.response_time).then(|| {
                format!(
                    "response time at percentile {} exceeded: limit {:?}, actual {actual:?}",
                    limit.percentile, limit.response_time
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{HistogramShape, Statistics};
    use crate::metric::Outcome;

    /// 100 `get` successes of 1..=100ms, then `errors` timeouts.
    fn statistics(errors: u64) -> StatisticsSet {
        let mut statistics = Statistics::new(HistogramShape::default()).unwrap();
        for ms in 1..=100 {
            statistics.record_request("get");
            statistics.record("get", Outcome::Success, ms * 1_000_000);
        }
        for _ in 0..errors {
            statistics.record_request("get");
            statistics.record("get", Outcome::Timeout, 0);
        }
        statistics.record_request("post");
        statistics.record("post", Outcome::Success, 500_000_000);
        statistics.snapshot()
    }

    #[test]
    fn error_ratio() {
        let sla = Sla::builder().metric("get").error_ratio(0.1).build();
        assert!(sla.check(&statistics(10)).is_empty());

        let failures = sla.check(&statistics(50));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].metric, "get");
        assert!(failures[0].message.starts_with("error ratio exceeded"));
    }

    #[test]
    fn mean_response_time() {
        let sla = Sla::builder()
            .metric("get")
            .mean_response_time(Duration::from_millis(60))
            .build();
        assert!(sla.check(&statistics(0)).is_empty());

        let strict = Sla::builder()
            .metric("get")
            .mean_response_time(Duration::from_millis(40))
            .build();
        assert_eq!(strict.check(&statistics(0)).len(), 1);
    }

    #[test]
    fn percentile_limits() {
        let sla = Sla::builder()
            .metric("get")
            .percentile_limits(vec![
                PercentileLimit::new(50., Duration::from_millis(60)),
                PercentileLimit::new(99., Duration::from_millis(90)),
            ])
            .build();
        let failures = sla.check(&statistics(0));
        assert_eq!(failures.len(), 1);
        assert!(failures[0].message.contains("percentile 99"));
    }

    #[test]
    fn without_a_metric_every_metric_is_checked() {
        let sla = Sla::builder()
            .mean_response_time(Duration::from_millis(200))
            .build();
        let failures = sla.check(&statistics(0));
        assert_eq!(
            failures.iter().map(|f| f.metric.as_str()).collect::<Vec<_>>(),
            vec!["post"]
        );
    }

    #[test]
    fn invalid_limits_are_rejected() {
        assert!(Sla::builder().error_ratio(1.5).build().validate().is_err());
        assert!(
            Sla::builder()
                .percentile_limits(vec![PercentileLimit::new(0., Duration::ZERO)])
                .build()
                .validate()
                .is_err()
        );
        assert!(Sla::builder().error_ratio(0.).build().validate().is_ok());
    }
}
