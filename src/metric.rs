use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a single operation ended.
///
/// Only [`Outcome::Success`] and [`Outcome::Invalid`] carry a meaningful latency: in
/// both cases a response arrived. The remaining variants are failures where no
/// response was observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// A response arrived but did not pass validation (or the plugin rejected it).
    Invalid,
    ConnectionError,
    Timeout,
    InternalError,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }

    pub fn has_response(self) -> bool {
        matches!(self, Outcome::Success | Outcome::Invalid)
    }
}

/// The smallest unit of measurement: one finished operation.
///
/// Samples are consumed by an [`crate::Aggregate`] right where they are produced and
/// are never retained individually.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub outcome: Outcome,
    pub latency_nanos: u64,
}

impl Sample {
    pub fn new(outcome: Outcome, latency: Duration) -> Self {
        Self {
            outcome,
            latency_nanos: u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX),
        }
    }
}
