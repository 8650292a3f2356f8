//! Controller-side bookkeeping of one phase of a run.
//!
//! A [`PhaseInstance`] never talks to shards itself. Its methods return the session
//! starts to send (`(shard, count)` pairs) and the runner turns them into commands.
//! That keeps the scheduling rules testable without a runtime.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::aggregate::{Aggregate, SessionCounters, SessionEvent, StatisticsSet};
use crate::benchmark::{Phase, ScalingStrategy};
use crate::error::Error;
use crate::executor::rate;
use crate::plugin::ShardId;
use crate::report::{PhaseReport, Report, StatisticsSummary};
use crate::session::SessionEnd;
use crate::sla::SlaFailure;

/// Lifecycle of a phase.
///
/// `Finished` means the scaling strategy stopped starting sessions. `Terminated`
/// means every session it started has ended as well.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    NotStarted,
    Running,
    Finished,
    Terminating,
    Terminated,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::NotStarted => "NOT_STARTED",
            PhaseStatus::Running => "RUNNING",
            PhaseStatus::Finished => "FINISHED",
            PhaseStatus::Terminating => "TERMINATING",
            PhaseStatus::Terminated => "TERMINATED",
        }
    }

    /// The phase no longer starts sessions.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            PhaseStatus::Finished | PhaseStatus::Terminating | PhaseStatus::Terminated
        )
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session starts to send, per shard.
pub(crate) type Starts = Vec<(ShardId, u64)>;

/// Splits `capacity` over `shards`, the first ones taking the remainder.
pub(crate) fn split_capacity(capacity: usize, shards: usize) -> Vec<usize> {
    if shards == 0 {
        return Vec::new();
    }
    let base = capacity / shards;
    let remainder = capacity % shards;
    (0..shards)
        .map(|shard| base + usize::from(shard < remainder))
        .collect()
}

pub(crate) struct PhaseInstance {
    pub index: usize,
    pub def: Phase,
    status: PhaseStatus,
    started_at: Option<Instant>,
    ended_at: Option<Instant>,
    counters: SessionCounters,
    /// Sessions requested from shards whose `Started` report is pending.
    in_flight: u64,
    /// Issued-or-blocked count of the rate strategies.
    accounted: u64,
    /// Blocked starts owed to the phase when catch-up is on.
    throttled: u64,
    shard_capacity: Vec<usize>,
    cursor: usize,
    statistics: StatisticsSet,
    max_used: usize,
    sla_failures: Vec<SlaFailure>,
}

impl PhaseInstance {
    pub fn new(index: usize, def: Phase, shards: usize) -> Self {
        let shard_capacity = split_capacity(def.session_capacity(), shards);
        Self {
            index,
            def,
            status: PhaseStatus::NotStarted,
            started_at: None,
            ended_at: None,
            counters: SessionCounters::default(),
            in_flight: 0,
            accounted: 0,
            throttled: 0,
            shard_capacity,
            cursor: 0,
            statistics: StatisticsSet::default(),
            max_used: 0,
            sla_failures: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn status(&self) -> PhaseStatus {
        self.status
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    pub fn statistics(&self) -> &StatisticsSet {
        &self.statistics
    }

    pub fn shard_capacity(&self, shard: ShardId) -> usize {
        self.shard_capacity.get(shard).copied().unwrap_or(0)
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        self.started_at
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default()
    }

    /// No session of the phase is live or about to be.
    pub fn is_drained(&self) -> bool {
        self.in_flight == 0 && self.counters.live() == 0
    }

    fn set_status(&mut self, status: PhaseStatus) {
        tracing::info!(
            "Phase {} changing status from {} to {}",
            self.def.name,
            self.status,
            status
        );
        self.status = status;
    }

    fn invalid(&self, action: &'static str) -> Error {
        Error::InvalidTransition {
            phase: self.def.name.clone(),
            action,
            status: self.status.as_str(),
        }
    }

    /// Sessions the phase may still start, `None` when unlimited.
    fn iterations_left(&self) -> Option<u64> {
        let strategy_cap = match self.def.strategy {
            ScalingStrategy::Sequential { iterations } => Some(iterations),
            _ => None,
        };
        let cap = match (strategy_cap, self.def.max_iterations) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        cap.map(|cap| cap.saturating_sub(self.counters.started + self.in_flight))
    }

    /// Distributes `count` starts round-robin over the shards that have capacity
    /// for this phase.
    fn issue(&mut self, count: u64) -> Starts {
        let count = match self.iterations_left() {
            Some(left) => count.min(left),
            None => count,
        };
        let shards: Vec<ShardId> = (0..self.shard_capacity.len())
            .filter(|&shard| self.shard_capacity[shard] > 0)
            .collect();
        if count == 0 || shards.is_empty() {
            return Vec::new();
        }
        self.in_flight += count;

        let n = shards.len() as u64;
        let base = count / n;
        let remainder = (count % n) as usize;
        let first = self.cursor % shards.len();
        self.cursor = (first + remainder) % shards.len();
        (0..shards.len())
            .filter_map(|i| {
                let shard = shards[(first + i) % shards.len()];
                let count = base + u64::from(i < remainder);
                (count > 0).then_some((shard, count))
            })
            .collect()
    }

    fn issue_on(&mut self, shard: ShardId, count: u64) -> Starts {
        let count = self.iterations_left().map_or(count, |left| count.min(left));
        if count == 0 || self.shard_capacity(shard) == 0 {
            return Vec::new();
        }
        self.in_flight += count;
        vec![(shard, count)]
    }

    /// Moves the phase to `Running` and returns the initial starts.
    pub fn start(&mut self, now: Instant) -> Result<Starts, Error> {
        if self.status != PhaseStatus::NotStarted {
            return Err(self.invalid("start"));
        }
        self.started_at = Some(now);
        self.set_status(PhaseStatus::Running);
        let starts = match self.def.strategy {
            ScalingStrategy::AtOnce { users } | ScalingStrategy::Always { users } => {
                self.issue(users)
            }
            ScalingStrategy::Sequential { .. } => self.issue(1),
            ScalingStrategy::ConstantRate { .. }
            | ScalingStrategy::RampRate { .. }
            | ScalingStrategy::Noop => Vec::new(),
        };
        self.finish_if_done(now);
        Ok(starts)
    }

    /// Issues what the arrival curve owes and finishes the phase when its end
    /// condition is met.
    pub fn tick(&mut self, now: Instant) -> Starts {
        if self.status != PhaseStatus::Running {
            return Vec::new();
        }
        let mut starts = Vec::new();
        if let Some((start_rate, end_rate)) = self.def.strategy.rates() {
            let elapsed = self.elapsed(now);
            tracing::trace!(
                "Phase {} at {:.2} sessions/s",
                self.def.name,
                rate::rate_at(elapsed, self.def.duration, start_rate, end_rate)
            );
            let due = rate::due(
                elapsed,
                self.def.duration,
                start_rate,
                end_rate,
                self.accounted,
            );
            if due > 0 {
                self.accounted += due;
                starts = self.issue(due);
            }
        }
        self.finish_if_done(now);
        starts
    }

    fn finish_if_done(&mut self, now: Instant) {
        if self.status != PhaseStatus::Running {
            return;
        }
        let elapsed = self.elapsed(now);
        let time_is_up = elapsed >= self.def.duration;
        let exhausted = self.iterations_left() == Some(0);
        let done = match self.def.strategy {
            ScalingStrategy::AtOnce { .. } => true,
            ScalingStrategy::Sequential { .. } => {
                exhausted || (!self.def.duration.is_zero() && time_is_up)
            }
            _ => exhausted || time_is_up,
        };
        if done {
            self.ended_at = Some(now);
            self.set_status(PhaseStatus::Finished);
        }
    }

    /// The phase has been running longer than its `max_duration`.
    pub fn is_overdue(&self, now: Instant) -> bool {
        matches!(self.status, PhaseStatus::Running | PhaseStatus::Finished)
            && self
                .def
                .max_duration
                .is_some_and(|max| self.elapsed(now) >= max)
    }

    pub fn finish(&mut self, now: Instant) -> Result<(), Error> {
        match self.status {
            PhaseStatus::NotStarted => Err(self.invalid("finish")),
            PhaseStatus::Running => {
                self.ended_at = Some(now);
                self.set_status(PhaseStatus::Finished);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Returns true when shards must be told to terminate the phase's sessions.
    pub fn begin_termination(&mut self, now: Instant) -> bool {
        match self.status {
            PhaseStatus::NotStarted => {
                self.set_status(PhaseStatus::Terminated);
                false
            }
            PhaseStatus::Running | PhaseStatus::Finished => {
                self.ended_at.get_or_insert(now);
                self.set_status(PhaseStatus::Terminating);
                true
            }
            PhaseStatus::Terminating | PhaseStatus::Terminated => false,
        }
    }

    /// Ready to collect the phase's statistics and move to `Terminated`.
    pub fn can_terminate(&self) -> bool {
        matches!(
            self.status,
            PhaseStatus::Finished | PhaseStatus::Terminating
        ) && self.is_drained()
    }

    pub fn sla_failures(&self) -> &[SlaFailure] {
        &self.sla_failures
    }

    /// Stores the merged statistics, checks them against the phase's SLAs and
    /// moves to `Terminated`.
    pub fn complete(&mut self, statistics: StatisticsSet, max_used: usize) {
        self.sla_failures = self
            .def
            .slas
            .iter()
            .flat_map(|sla| sla.check(&statistics))
            .collect();
        for failure in &self.sla_failures {
            tracing::warn!(
                "Phase {} failed an SLA on {}: {}",
                self.def.name,
                failure.metric,
                failure.message
            );
        }
        self.statistics = statistics;
        self.max_used = max_used;
        self.set_status(PhaseStatus::Terminated);
    }

    pub fn on_started(&mut self, shard: ShardId, started: u64, blocked: u64) {
        self.in_flight = self.in_flight.saturating_sub(started + blocked);
        self.counters.started += started;
        self.counters.blocked += blocked;
        if blocked > 0 {
            tracing::warn!(
                "Phase {}: {blocked} session starts blocked by an exhausted pool on shard {shard}",
                self.def.name
            );
            if self.def.strategy.catch_up() {
                self.throttled += blocked;
            }
        }
    }

    /// Records a session end and returns the starts that replace it.
    pub fn on_ended(&mut self, shard: ShardId, end: SessionEnd, now: Instant) -> Starts {
        self.counters.consume(&SessionEvent::from(end));
        if self.status != PhaseStatus::Running {
            return Vec::new();
        }
        let starts = match self.def.strategy {
            ScalingStrategy::Always { .. } | ScalingStrategy::Sequential { .. } => {
                self.issue_on(shard, 1)
            }
            _ if self.throttled > 0 => {
                self.throttled -= 1;
                self.issue_on(shard, 1)
            }
            _ => Vec::new(),
        };
        self.finish_if_done(now);
        starts
    }

    pub fn report(&self, percentiles: &[f64], now: Instant) -> PhaseReport {
        let duration = match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => now.saturating_duration_since(start),
            _ => Duration::ZERO,
        };
        PhaseReport {
            name: self.def.name.clone(),
            status: self.status,
            strategy: self.def.strategy.label().to_owned(),
            duration,
            sessions: self.counters,
            max_sessions_used: self.max_used,
            sla_failures: self.sla_failures.clone(),
            statistics: self
                .statistics
                .iter()
                .map(|(metric, snapshot)| {
                    (
                        metric.to_owned(),
                        StatisticsSummary::summarize(snapshot, percentiles),
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::scenario::{Scenario, Sequence, Step};

    fn scenario() -> Arc<Scenario> {
        Arc::new(
            Scenario::builder()
                .initial_sequence(Sequence::new("main").step(Step::delay(Duration::from_millis(1))))
                .build()
                .unwrap(),
        )
    }

    fn instance(strategy: ScalingStrategy, duration: Duration, shards: usize) -> PhaseInstance {
        let def = Phase::builder()
            .name("main")
            .scenario(scenario())
            .strategy(strategy)
            .duration(duration)
            .build();
        PhaseInstance::new(0, def, shards)
    }

    fn total(starts: &Starts) -> u64 {
        starts.iter().map(|(_, count)| count).sum()
    }

    #[test]
    fn capacity_is_split_with_remainder_first() {
        assert_eq!(split_capacity(10, 4), vec![3, 3, 2, 2]);
        assert_eq!(split_capacity(2, 4), vec![1, 1, 0, 0]);
        assert!(split_capacity(3, 0).is_empty());
    }

    mod start {
        use super::*;

        #[test]
        fn at_once_issues_everything_and_finishes() {
            let mut phase = instance(ScalingStrategy::AtOnce { users: 10 }, Duration::ZERO, 4);
            let starts = phase.start(Instant::now()).unwrap();
            assert_eq!(starts, vec![(0, 3), (1, 3), (2, 2), (3, 2)]);
            assert_eq!(phase.status(), PhaseStatus::Finished);
            assert!(!phase.can_terminate());

            phase.on_started(0, 10, 0);
            for shard in 0..4 {
                phase.on_ended(shard, SessionEnd::Completed, Instant::now());
            }
            assert!(!phase.can_terminate());
            for _ in 0..6 {
                phase.on_ended(0, SessionEnd::Completed, Instant::now());
            }
            assert!(phase.can_terminate());
        }

        #[test]
        fn twice_is_rejected() {
            let mut phase = instance(ScalingStrategy::Noop, Duration::from_secs(1), 1);
            phase.start(Instant::now()).unwrap();
            assert!(matches!(
                phase.start(Instant::now()),
                Err(Error::InvalidTransition { action: "start", .. })
            ));
        }

        #[test]
        fn max_iterations_caps_the_first_wave() {
            let def = Phase::builder()
                .name("main")
                .scenario(scenario())
                .strategy(ScalingStrategy::Always { users: 8 })
                .duration(Duration::from_secs(10))
                .max_iterations(5)
                .build();
            let mut phase = PhaseInstance::new(0, def, 2);
            let starts = phase.start(Instant::now()).unwrap();
            assert_eq!(total(&starts), 5);
            assert_eq!(phase.status(), PhaseStatus::Finished);
        }
    }

    mod tick {
        use super::*;

        #[test]
        fn constant_rate_follows_the_integral() {
            let start = Instant::now();
            let mut phase = instance(
                ScalingStrategy::ConstantRate {
                    users_per_sec: 25.,
                    catch_up: false,
                },
                Duration::from_secs(2),
                3,
            );
            phase.start(start).unwrap();
            let mut issued = 0;
            for tick in 1..=25 {
                issued += total(&phase.tick(start + Duration::from_millis(tick * 100)));
            }
            assert_eq!(issued, 50);
            assert_eq!(phase.status(), PhaseStatus::Finished);
        }

        #[test]
        fn round_robin_moves_on() {
            let start = Instant::now();
            let mut phase = instance(
                ScalingStrategy::ConstantRate {
                    users_per_sec: 30.,
                    catch_up: false,
                },
                Duration::from_secs(10),
                3,
            );
            phase.start(start).unwrap();
            assert_eq!(phase.tick(start + Duration::from_millis(100)), vec![(0, 1), (1, 1), (2, 1)]);
            assert_eq!(phase.tick(start + Duration::from_millis(150)), vec![(0, 1)]);
            assert_eq!(phase.tick(start + Duration::from_millis(200)), vec![(1, 1), (2, 1)]);
        }

        #[test]
        fn noop_finishes_when_duration_elapses() {
            let start = Instant::now();
            let mut phase = instance(ScalingStrategy::Noop, Duration::from_secs(1), 2);
            assert!(phase.start(start).unwrap().is_empty());
            assert!(phase.tick(start + Duration::from_millis(500)).is_empty());
            assert_eq!(phase.status(), PhaseStatus::Running);
            phase.tick(start + Duration::from_secs(1));
            assert_eq!(phase.status(), PhaseStatus::Finished);
            assert!(phase.can_terminate());
        }
    }

    mod on_ended {
        use super::*;

        #[test]
        fn sequential_restarts_on_the_same_shard() {
            let now = Instant::now();
            let mut phase = instance(ScalingStrategy::Sequential { iterations: 3 }, Duration::ZERO, 4);
            assert_eq!(phase.start(now).unwrap(), vec![(0, 1)]);
            phase.on_started(0, 1, 0);
            assert_eq!(phase.on_ended(0, SessionEnd::Failed, now), vec![(0, 1)]);
            phase.on_started(0, 1, 0);
            assert_eq!(phase.on_ended(0, SessionEnd::Completed, now), vec![(0, 1)]);
            assert_eq!(phase.status(), PhaseStatus::Finished);
            phase.on_started(0, 1, 0);
            assert!(phase.on_ended(0, SessionEnd::Completed, now).is_empty());
            assert!(phase.can_terminate());
            assert_eq!(phase.counters().started, 3);
            assert_eq!(phase.counters().failed, 1);
        }

        #[test]
        fn catch_up_replays_blocked_starts() {
            let now = Instant::now();
            let mut phase = instance(
                ScalingStrategy::ConstantRate {
                    users_per_sec: 10.,
                    catch_up: true,
                },
                Duration::from_secs(10),
                1,
            );
            phase.start(now).unwrap();
            phase.on_started(0, 8, 2);
            assert_eq!(phase.on_ended(0, SessionEnd::Completed, now), vec![(0, 1)]);
            assert_eq!(phase.on_ended(0, SessionEnd::Completed, now), vec![(0, 1)]);
            assert!(phase.on_ended(0, SessionEnd::Completed, now).is_empty());
        }

        #[test]
        fn no_restart_while_terminating() {
            let now = Instant::now();
            let mut phase = instance(ScalingStrategy::Always { users: 2 }, Duration::from_secs(10), 1);
            phase.start(now).unwrap();
            phase.on_started(0, 2, 0);
            assert!(phase.begin_termination(now));
            assert!(!phase.begin_termination(now));
            assert!(phase.on_ended(0, SessionEnd::Terminated, now).is_empty());
            assert!(!phase.can_terminate());
            phase.on_ended(0, SessionEnd::Terminated, now);
            assert!(phase.can_terminate());
            phase.complete(StatisticsSet::default(), 2);
            assert_eq!(phase.status(), PhaseStatus::Terminated);
            assert_eq!(phase.counters().terminated, 2);
        }
    }

    #[test]
    fn terminating_a_phase_that_never_ran() {
        let mut phase = instance(ScalingStrategy::Noop, Duration::from_secs(1), 1);
        assert!(!phase.begin_termination(Instant::now()));
        assert_eq!(phase.status(), PhaseStatus::Terminated);
        assert!(phase.finish(Instant::now()).is_ok());
    }

    #[test]
    fn overdue_after_max_duration() {
        let start = Instant::now();
        let def = Phase::builder()
            .name("main")
            .scenario(scenario())
            .strategy(ScalingStrategy::AtOnce { users: 1 })
            .max_duration(Duration::from_secs(5))
            .build();
        let mut phase = PhaseInstance::new(0, def, 1);
        phase.start(start).unwrap();
        assert!(!phase.is_overdue(start + Duration::from_secs(4)));
        assert!(phase.is_overdue(start + Duration::from_secs(5)));
    }
}
