use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::ConfigError;
use crate::scenario::Scenario;
use crate::sla::Sla;

/// Rule deciding when and how many sessions a phase starts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScalingStrategy {
    /// Starts `users` sessions when the phase starts and nothing afterwards.
    AtOnce { users: u64 },
    /// Keeps `users` sessions running, restarting each one as it ends, until the
    /// phase duration elapses.
    Always { users: u64 },
    /// Open model with a fixed arrival rate.
    ConstantRate {
        users_per_sec: f64,
        #[serde(default)]
        catch_up: bool,
    },
    /// Open model with an arrival rate changing linearly over the phase duration.
    RampRate {
        initial_users_per_sec: f64,
        target_users_per_sec: f64,
        #[serde(default)]
        catch_up: bool,
    },
    /// One session at a time, `iterations` times.
    Sequential { iterations: u64 },
    /// Starts nothing, only gates dependent phases until its duration elapses.
    Noop,
}

impl ScalingStrategy {
    /// Start and end rate of the open-model strategies.
    pub fn rates(&self) -> Option<(f64, f64)> {
        match *self {
            ScalingStrategy::ConstantRate { users_per_sec, .. } => {
                Some((users_per_sec, users_per_sec))
            }
            ScalingStrategy::RampRate {
                initial_users_per_sec,
                target_users_per_sec,
                ..
            } => Some((initial_users_per_sec, target_users_per_sec)),
            _ => None,
        }
    }

    pub fn catch_up(&self) -> bool {
        matches!(
            self,
            ScalingStrategy::ConstantRate { catch_up: true, .. }
                | ScalingStrategy::RampRate { catch_up: true, .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ScalingStrategy::AtOnce { .. } => "at_once",
            ScalingStrategy::Always { .. } => "always",
            ScalingStrategy::ConstantRate { .. } => "constant_rate",
            ScalingStrategy::RampRate { .. } => "ramp_rate",
            ScalingStrategy::Sequential { .. } => "sequential",
            ScalingStrategy::Noop => "noop",
        }
    }
}

/// How far a dependency must have progressed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// The dependency stopped starting sessions; its sessions may still run.
    Finished,
    /// Every session of the dependency has ended.
    #[default]
    Terminated,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub phase: String,
    #[serde(default)]
    pub until: DependencyKind,
}

impl Dependency {
    pub fn terminated(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            until: DependencyKind::Terminated,
        }
    }

    pub fn finished(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            until: DependencyKind::Finished,
        }
    }
}

/// A time-bounded stage of the run.
#[derive(Clone, Debug, Serialize, Deserialize, TypedBuilder)]
pub struct Phase {
    #[builder(setter(into))]
    pub name: String,
    #[builder(setter(into))]
    pub scenario: Arc<Scenario>,
    pub strategy: ScalingStrategy,
    /// How long the phase starts sessions. Zero means no time limit for the
    /// strategies that have another end condition.
    #[builder(default)]
    #[serde(default)]
    pub duration: Duration,
    /// Sessions still running this long after the phase started are terminated.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub max_duration: Option<Duration>,
    /// Cap on started sessions. Blocked starts do not count.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub max_iterations: Option<u64>,
    /// Concurrency ceiling, the capacity of the phase's session pools.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub max_sessions: Option<usize>,
    #[builder(default)]
    #[serde(default)]
    pub depends_on: Vec<Dependency>,
    /// Earliest start, relative to the start of the run.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub start_delay: Option<Duration>,
    /// Phases that must be terminated before this one may terminate on its own.
    /// Reaching `max_duration` still terminates it.
    #[builder(default)]
    #[serde(default)]
    pub terminate_after: Vec<String>,
    /// Checked against the phase's statistics when it terminates.
    #[builder(default)]
    #[serde(default)]
    pub slas: Vec<Sla>,
}

impl Phase {
    /// Session pool capacity: explicit `max_sessions`, or what the strategy needs.
    pub fn session_capacity(&self) -> usize {
        if let Some(max) = self.max_sessions {
            return max;
        }
        match &self.strategy {
            ScalingStrategy::AtOnce { users } | ScalingStrategy::Always { users } => {
                *users as usize
            }
            ScalingStrategy::Sequential { .. } => 1,
            ScalingStrategy::Noop => 0,
            ScalingStrategy::ConstantRate { .. } | ScalingStrategy::RampRate { .. } => {
                let (initial, target) = self.strategy.rates().unwrap_or_default();
                (initial.max(target).ceil() as usize).max(1)
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidPhase {
            phase: self.name.clone(),
            reason,
        };
        if self.name.is_empty() {
            return Err(invalid("phase name is empty".into()));
        }
        match &self.strategy {
            ScalingStrategy::Always { users: 0 } => {
                return Err(invalid("always requires at least one user".into()));
            }
            ScalingStrategy::Sequential { iterations: 0 } => {
                return Err(invalid("sequential requires at least one iteration".into()));
            }
            strategy => {
                if let Some((initial, target)) = strategy.rates() {
                    if !initial.is_finite() || !target.is_finite() || initial < 0. || target < 0.
                    {
                        return Err(invalid(format!(
                            "rates must be finite and non-negative, got {initial} -> {target}"
                        )));
                    }
                    if initial == 0. && target == 0. {
                        return Err(invalid("rate is zero".into()));
                    }
                }
            }
        }
        let needs_duration = matches!(
            self.strategy,
            ScalingStrategy::Always { .. }
                | ScalingStrategy::ConstantRate { .. }
                | ScalingStrategy::RampRate { .. }
        );
        if needs_duration && self.duration.is_zero() {
            return Err(invalid(format!(
                "{} requires a duration",
                self.strategy.label()
            )));
        }
        if self.max_duration.is_some_and(|d| d.is_zero()) {
            return Err(invalid("max_duration must be positive".into()));
        }
        if self.max_sessions == Some(0) && !matches!(self.strategy, ScalingStrategy::Noop) {
            return Err(invalid("max_sessions must be positive".into()));
        }
        for sla in &self.slas {
            sla.validate().map_err(invalid)?;
            if let Some(metric) = &sla.metric
                && !self.scenario.metrics().any(|m| m == metric)
            {
                return Err(invalid(format!("sla refers to unknown metric '{metric}'")));
            }
        }
        Ok(())
    }
}

/// Immutable definition of a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Benchmark {
    pub name: String,
    pub phases: Vec<Phase>,
}

impl Benchmark {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phases: Vec::new(),
        }
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    /// Checks phase parameters, names and the dependency graph.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut index = HashMap::new();
        for (i, phase) in self.phases.iter().enumerate() {
            phase.validate()?;
            if index.insert(phase.name.as_str(), i).is_some() {
                return Err(ConfigError::DuplicatePhase(phase.name.clone()));
            }
        }

        let mut starts = Vec::with_capacity(self.phases.len());
        let mut terminations = Vec::with_capacity(self.phases.len());
        for phase in &self.phases {
            starts.push(resolve(&index, phase, phase.depends_on.iter().map(|dep| &dep.phase))?);
            terminations.push(resolve(&index, phase, phase.terminate_after.iter())?);
        }

        // either kind of cycle would wait forever
        for edges in [&starts, &terminations] {
            if let Some(cycle) = find_cycle(edges) {
                return Err(ConfigError::DependencyCycle(
                    cycle
                        .into_iter()
                        .map(|i| self.phases[i].name.clone())
                        .collect(),
                ));
            }
        }
        Ok(())
    }
}

fn resolve<'a>(
    index: &HashMap<&str, usize>,
    phase: &Phase,
    names: impl Iterator<Item = &'a String>,
) -> Result<Vec<usize>, ConfigError> {
    names
        .map(|name| {
            index
                .get(name.as_str())
                .copied()
                .ok_or_else(|| ConfigError::UnknownDependency {
                    phase: phase.name.clone(),
                    dependency: name.clone(),
                })
        })
        .collect()
}

/// Some cycle of the graph, as a path whose first and last nodes are equal.
fn find_cycle(edges: &[Vec<usize>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Visiting,
        Done,
    }

    fn visit(
        node: usize,
        edges: &[Vec<usize>],
        marks: &mut [Mark],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        match marks[node] {
            Mark::Done => return None,
            Mark::Visiting => {
                let start = path.iter().position(|&p| p == node).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(node);
                return Some(cycle);
            }
            Mark::New => {}
        }
        marks[node] = Mark::Visiting;
        path.push(node);
        for &next in &edges[node] {
            if let Some(cycle) = visit(next, edges, marks, path) {
                return Some(cycle);
            }
        }
        path.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::New; edges.len()];
    (0..edges.len()).find_map(|node| visit(node, edges, &mut marks, &mut Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Sequence;

    fn scenario() -> Arc<Scenario> {
        Arc::new(
            Scenario::builder()
                .initial_sequence(Sequence::new("main"))
                .build()
                .unwrap(),
        )
    }

    fn phase(name: &str, deps: &[&str]) -> Phase {
        Phase::builder()
            .name(name)
            .scenario(scenario())
            .strategy(ScalingStrategy::AtOnce { users: 1 })
            .depends_on(deps.iter().map(|d| Dependency::terminated(*d)).collect())
            .build()
    }

    #[test]
    fn valid_graph() {
        let benchmark = Benchmark::new("ok")
            .phase(phase("a", &[]))
            .phase(phase("b", &["a"]))
            .phase(phase("c", &["a", "b"]));
        assert!(benchmark.validate().is_ok());
        assert_eq!(benchmark.position("c"), Some(2));
    }

    #[test]
    fn duplicate_phase() {
        let benchmark = Benchmark::new("dup")
            .phase(phase("a", &[]))
            .phase(phase("a", &[]));
        assert_eq!(
            benchmark.validate(),
            Err(ConfigError::DuplicatePhase("a".into()))
        );
    }

    #[test]
    fn unknown_dependency() {
        let benchmark = Benchmark::new("unknown").phase(phase("a", &["ghost"]));
        assert_eq!(
            benchmark.validate(),
            Err(ConfigError::UnknownDependency {
                phase: "a".into(),
                dependency: "ghost".into()
            })
        );
    }

    #[test]
    fn dependency_cycle_reports_the_path() {
        let benchmark = Benchmark::new("cycle")
            .phase(phase("a", &["c"]))
            .phase(phase("b", &["a"]))
            .phase(phase("c", &["b"]));
        assert_eq!(
            benchmark.validate(),
            Err(ConfigError::DependencyCycle(vec![
                "a".into(),
                "c".into(),
                "b".into(),
                "a".into()
            ]))
        );

        let own = Benchmark::new("self").phase(phase("a", &["a"]));
        assert_eq!(
            own.validate(),
            Err(ConfigError::DependencyCycle(vec!["a".into(), "a".into()]))
        );
    }

    #[test]
    fn termination_order() {
        let mut background = phase("background", &[]);
        background.terminate_after = vec!["main".into()];
        let ok = Benchmark::new("ok")
            .phase(background.clone())
            .phase(phase("main", &[]));
        assert!(ok.validate().is_ok());

        let unknown = Benchmark::new("unknown").phase(background.clone());
        assert_eq!(
            unknown.validate(),
            Err(ConfigError::UnknownDependency {
                phase: "background".into(),
                dependency: "main".into()
            })
        );

        let mut main = phase("main", &[]);
        main.terminate_after = vec!["background".into()];
        assert!(matches!(
            Benchmark::new("cycle").phase(background).phase(main).validate(),
            Err(ConfigError::DependencyCycle(_))
        ));
    }

    #[test]
    fn slas_name_known_metrics() {
        let scenario = Arc::new(
            Scenario::builder()
                .initial_sequence(Sequence::new("main").step(crate::scenario::Step::operation(
                    crate::scenario::OperationStep::builder()
                        .plugin("http")
                        .metric("get")
                        .build(),
                )))
                .build()
                .unwrap(),
        );
        let with_sla = |metric: &str| {
            Phase::builder()
                .name("main")
                .scenario(Arc::clone(&scenario))
                .strategy(ScalingStrategy::AtOnce { users: 1 })
                .slas(vec![Sla::builder().metric(metric).error_ratio(0.1).build()])
                .build()
        };
        assert!(Benchmark::new("ok").phase(with_sla("get")).validate().is_ok());
        assert!(matches!(
            Benchmark::new("typo").phase(with_sla("gte")).validate(),
            Err(ConfigError::InvalidPhase { .. })
        ));
    }

    #[test]
    fn invalid_parameters() {
        let no_duration = Phase::builder()
            .name("rate")
            .scenario(scenario())
            .strategy(ScalingStrategy::ConstantRate {
                users_per_sec: 10.,
                catch_up: false,
            })
            .build();
        assert!(matches!(
            Benchmark::new("x").phase(no_duration).validate(),
            Err(ConfigError::InvalidPhase { .. })
        ));

        let negative = Phase::builder()
            .name("ramp")
            .scenario(scenario())
            .strategy(ScalingStrategy::RampRate {
                initial_users_per_sec: -1.,
                target_users_per_sec: 5.,
                catch_up: false,
            })
            .duration(Duration::from_secs(1))
            .build();
        assert!(matches!(
            Benchmark::new("x").phase(negative).validate(),
            Err(ConfigError::InvalidPhase { .. })
        ));
    }

    #[test]
    fn session_capacity_defaults() {
        let rate = Phase::builder()
            .name("rate")
            .scenario(scenario())
            .strategy(ScalingStrategy::RampRate {
                initial_users_per_sec: 2.5,
                target_users_per_sec: 7.2,
                catch_up: false,
            })
            .duration(Duration::from_secs(1))
            .build();
        assert_eq!(rate.session_capacity(), 8);

        let sequential = Phase::builder()
            .name("seq")
            .scenario(scenario())
            .strategy(ScalingStrategy::Sequential { iterations: 5 })
            .build();
        assert_eq!(sequential.session_capacity(), 1);

        let capped = Phase::builder()
            .name("capped")
            .scenario(scenario())
            .strategy(ScalingStrategy::AtOnce { users: 100 })
            .max_sessions(10)
            .build();
        assert_eq!(capped.session_capacity(), 10);
    }

    #[test]
    fn strategy_serialized_form() {
        let json = serde_json::to_value(ScalingStrategy::ConstantRate {
            users_per_sec: 5.,
            catch_up: false,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "kind": "constant_rate", "users_per_sec": 5.0, "catch_up": false })
        );
        let noop: ScalingStrategy = serde_json::from_value(serde_json::json!({ "kind": "noop" })).unwrap();
        assert_eq!(noop, ScalingStrategy::Noop);
    }
}
