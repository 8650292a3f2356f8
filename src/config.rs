use std::{env, str::FromStr, time::Duration};

use typed_builder::TypedBuilder;

use crate::aggregate::{HistogramShape, StatisticsSnapshot};
use crate::error::ConfigError;

/// Process-wide settings of the load-generation runtime.
///
/// Everything that depends on the benchmark lives in [`crate::Benchmark`]; this is
/// only about how the engine itself runs.
#[derive(Clone, Debug, PartialEq, TypedBuilder)]
pub struct RuntimeConfig {
    /// Number of single-task executor shards.
    #[builder(default = num_cpus::get())]
    pub shards: usize,
    /// Granularity of the scheduler's rate control.
    #[builder(default = Duration::from_millis(100))]
    pub tick: Duration,
    /// Highest latency the histograms can track. Larger values are clamped.
    #[builder(default = Duration::from_secs(60))]
    pub histogram_max: Duration,
    /// Significant figures kept by the histograms.
    #[builder(default = 2)]
    pub histogram_sigfig: u8,
    /// Percentiles included in every [`crate::report::StatisticsSummary`].
    #[builder(default = vec![50.0, 90.0, 99.0, 99.9, 99.99])]
    pub percentiles: Vec<f64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with `STAMPEDE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overlaid with the values returned by `lookup`.
    /// Unparsable values are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(shards) = parse(&lookup, "STAMPEDE_SHARDS") {
            config.shards = shards;
        }
        if let Some(ms) = parse::<u64>(&lookup, "STAMPEDE_TICK_MS") {
            config.tick = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&lookup, "STAMPEDE_HISTOGRAM_MAX_SECS") {
            config.histogram_max = Duration::from_secs(secs);
        }
        if let Some(sigfig) = parse(&lookup, "STAMPEDE_HISTOGRAM_SIGFIG") {
            config.histogram_sigfig = sigfig;
        }

        config
    }

    pub fn histogram_shape(&self) -> HistogramShape {
        HistogramShape {
            highest_nanos: u64::try_from(self.histogram_max.as_nanos()).unwrap_or(u64::MAX),
            sigfig: self.histogram_sigfig,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shards == 0 {
            return Err(ConfigError::Runtime("at least one shard is required".into()));
        }
        if self.tick.is_zero() {
            return Err(ConfigError::Runtime("tick must be positive".into()));
        }
        if let Some(p) = self
            .percentiles
            .iter()
            .find(|p| !(0.0..=100.0).contains(*p))
        {
            return Err(ConfigError::Runtime(format!(
                "percentile {p} is outside of 0..=100"
            )));
        }
        StatisticsSnapshot::new(self.histogram_shape()).map(|_| ())
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring {key}={raw}: not a valid value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.shards, num_cpus::get());
        assert_eq!(config.tick, Duration::from_millis(100));
        assert_eq!(
            config.histogram_shape(),
            HistogramShape {
                highest_nanos: 60_000_000_000,
                sigfig: 2
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overlay_from_lookup() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("STAMPEDE_SHARDS", "3"),
            ("STAMPEDE_TICK_MS", "10"),
            ("STAMPEDE_HISTOGRAM_MAX_SECS", "5"),
            ("STAMPEDE_HISTOGRAM_SIGFIG", " 3 "),
        ]));
        assert_eq!(config.shards, 3);
        assert_eq!(config.tick, Duration::from_millis(10));
        assert_eq!(config.histogram_max, Duration::from_secs(5));
        assert_eq!(config.histogram_sigfig, 3);
    }

    #[test]
    fn unparsable_values_are_ignored() {
        let config = RuntimeConfig::from_lookup(lookup(&[("STAMPEDE_SHARDS", "many")]));
        assert_eq!(config.shards, num_cpus::get());
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let zero_shards = RuntimeConfig::builder().shards(0).build();
        assert!(matches!(zero_shards.validate(), Err(ConfigError::Runtime(_))));

        let bad_sigfig = RuntimeConfig::builder().histogram_sigfig(9).build();
        assert!(matches!(bad_sigfig.validate(), Err(ConfigError::Histogram(_))));

        let bad_percentile = RuntimeConfig::builder().percentiles(vec![101.0]).build();
        assert!(matches!(
            bad_percentile.validate(),
            Err(ConfigError::Runtime(_))
        ));
    }
}
