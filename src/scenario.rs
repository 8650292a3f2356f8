//! Static, shared description of what a session does.
//!
//! A [`Scenario`] groups named [`Sequence`]s; a sequence is an ordered list of
//! [`Step`]s. Scenarios are immutable once built and shared (behind an `Arc`) by every
//! session of every shard. All names are resolved at build time: sequence references
//! become [`SequenceId`]s and resource names become [`ResourceKey`]s, i.e. indices
//! into the per-session resource arena. Errors found while resolving are reported as
//! [`ConfigError`]s naming the sequence and step at fault.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::ConfigError;
use crate::matcher::SearchValidator;

/// Lifetime of a session resource.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// One instance per session.
    #[default]
    Session,
    /// One instance per concurrently running branch of a session.
    Branch,
}

/// Resolved position of a resource in the session arena.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub scope: Scope,
    pub index: u32,
}

/// Index of a sequence inside its [`Scenario`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceId(u32);

impl SequenceId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Kind of a declared session variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Int,
    Text,
}

impl ResourceKind {
    fn label(self) -> &'static str {
        match self {
            ResourceKind::Int => "int",
            ResourceKind::Text => "text",
        }
    }
}

/// What an arena slot holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotKind {
    Variable,
    /// Cursor of a [`SearchValidator`].
    Match,
}

/// A reference to a declared variable, by name until the scenario is built.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Var {
    name: String,
    #[serde(skip)]
    key: ResourceKey,
}

impl Var {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> ResourceKey {
        self.key
    }
}

impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl From<&str> for Var {
    fn from(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            key: ResourceKey::default(),
        }
    }
}

/// A reference to a sequence, by name until the scenario is built.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceRef {
    name: String,
    #[serde(skip)]
    id: SequenceId,
}

impl SequenceRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> SequenceId {
        self.id
    }
}

impl PartialEq for SequenceRef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl From<&str> for SequenceRef {
    fn from(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            id: SequenceId::default(),
        }
    }
}

/// Synchronous step that manipulates session variables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    SetInt { var: Var, value: i64 },
    /// Fails the session when the variable is unset.
    AddInt { var: Var, delta: i64 },
    SetText { var: Var, value: String },
    Unset { var: Var },
    Log { message: String },
}

impl Action {
    pub fn set_int(var: &str, value: i64) -> Self {
        Action::SetInt {
            var: var.into(),
            value,
        }
    }

    pub fn add_int(var: &str, delta: i64) -> Self {
        Action::AddInt {
            var: var.into(),
            delta,
        }
    }

    pub fn set_text(var: &str, value: impl Into<String>) -> Self {
        Action::SetText {
            var: var.into(),
            value: value.into(),
        }
    }

    pub fn unset(var: &str) -> Self {
        Action::Unset { var: var.into() }
    }

    pub fn log(message: impl Into<String>) -> Self {
        Action::Log {
            message: message.into(),
        }
    }

    fn var_mut(&mut self) -> Option<(&mut Var, Option<ResourceKind>)> {
        match self {
            Action::SetInt { var, .. } | Action::AddInt { var, .. } => {
                Some((var, Some(ResourceKind::Int)))
            }
            Action::SetText { var, .. } => Some((var, Some(ResourceKind::Text))),
            Action::Unset { var } => Some((var, None)),
            Action::Log { .. } => None,
        }
    }
}

/// Declares a session variable. Executing the step (re)sets it to unset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    pub name: String,
    pub kind: ResourceKind,
    #[serde(default)]
    pub scope: Scope,
    #[serde(skip)]
    key: ResourceKey,
}

impl ResourceDeclaration {
    pub fn new(name: impl Into<String>, kind: ResourceKind, scope: Scope) -> Self {
        Self {
            name: name.into(),
            kind,
            scope,
            key: ResourceKey::default(),
        }
    }

    pub fn key(&self) -> ResourceKey {
        self.key
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_fatal() -> bool {
    true
}

/// Step that asks a protocol plugin to perform an operation and suspends the
/// branch until it completes, fails or times out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct OperationStep {
    /// Tag of the plugin performing the operation.
    #[builder(setter(into))]
    pub plugin: String,
    /// Operation kind used as the statistics key.
    #[builder(setter(into))]
    pub metric: String,
    /// Plugin-specific description of the operation.
    #[builder(default)]
    #[serde(default)]
    pub payload: serde_json::Value,
    #[builder(default = default_timeout())]
    #[serde(default = "default_timeout")]
    pub timeout: Duration,
    /// A failure of a fatal step fails the whole session.
    #[builder(default = true)]
    #[serde(default = "default_fatal")]
    pub fatal: bool,
    /// Validators applied to the response body.
    #[builder(default)]
    #[serde(default)]
    pub validators: Vec<SearchValidator>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Action(Action),
    Operation(OperationStep),
    Declare(ResourceDeclaration),
    /// Starts the named sequences as new branches of the session.
    Fork(Vec<SequenceRef>),
    /// Waits until every branch forked by this branch has finished.
    Join,
    /// Think time.
    Delay(Duration),
}

impl Step {
    pub fn action(action: Action) -> Self {
        Step::Action(action)
    }

    pub fn operation(operation: OperationStep) -> Self {
        Step::Operation(operation)
    }

    pub fn declare(name: impl Into<String>, kind: ResourceKind, scope: Scope) -> Self {
        Step::Declare(ResourceDeclaration::new(name, kind, scope))
    }

    pub fn fork<'a>(sequences: impl IntoIterator<Item = &'a str>) -> Self {
        Step::Fork(sequences.into_iter().map(SequenceRef::from).collect())
    }

    pub fn join() -> Self {
        Step::Join
    }

    pub fn delay(duration: Duration) -> Self {
        Step::Delay(duration)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Sequence {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }
}

/// Unresolved scenario, also its serialized form.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioBuilder {
    /// Sequences every session starts with, each as its own branch.
    pub initial: Vec<String>,
    pub sequences: Vec<Sequence>,
}

impl ScenarioBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sequence that is started with every session.
    pub fn initial_sequence(mut self, sequence: Sequence) -> Self {
        self.initial.push(sequence.name.clone());
        self.sequences.push(sequence);
        self
    }

    /// Adds a sequence that is only started by forks.
    pub fn sequence(mut self, sequence: Sequence) -> Self {
        self.sequences.push(sequence);
        self
    }

    pub fn build(self) -> Result<Scenario, ConfigError> {
        Scenario::try_from(self)
    }
}

/// Immutable, resolved scenario.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "ScenarioBuilder", into = "ScenarioBuilder")]
pub struct Scenario {
    sequences: Vec<Sequence>,
    initial: Vec<SequenceId>,
    session_slots: Vec<SlotKind>,
    branch_slots: Vec<SlotKind>,
    max_branches: usize,
}

impl Scenario {
    pub fn builder() -> ScenarioBuilder {
        ScenarioBuilder::new()
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn sequence(&self, id: SequenceId) -> &Sequence {
        &self.sequences[id.index()]
    }

    pub fn initial(&self) -> &[SequenceId] {
        &self.initial
    }

    /// Upper bound of branches alive at once in one session.
    pub fn max_branches(&self) -> usize {
        self.max_branches
    }

    /// Kinds of the session-scoped arena slots.
    pub fn session_slots(&self) -> &[SlotKind] {
        &self.session_slots
    }

    /// Kinds of the arena slots every branch owns.
    pub fn branch_slots(&self) -> &[SlotKind] {
        &self.branch_slots
    }

    /// Plugin tags used by operation steps.
    pub fn plugins(&self) -> impl Iterator<Item = &str> {
        self.sequences
            .iter()
            .flat_map(|s| s.steps.iter())
            .filter_map(|step| match step {
                Step::Operation(op) => Some(op.plugin.as_str()),
                _ => None,
            })
    }

    /// Metric names recorded by the operations of the scenario.
    pub fn metrics(&self) -> impl Iterator<Item = &str> {
        self.sequences
            .iter()
            .flat_map(|s| s.steps.iter())
            .filter_map(|step| match step {
                Step::Operation(op) => Some(op.metric.as_str()),
                _ => None,
            })
    }
}

impl From<Scenario> for ScenarioBuilder {
    fn from(scenario: Scenario) -> Self {
        let initial = scenario
            .initial
            .iter()
            .map(|id| scenario.sequences[id.index()].name.clone())
            .collect();
        Self {
            initial,
            sequences: scenario.sequences,
        }
    }
}

impl TryFrom<ScenarioBuilder> for Scenario {
    type Error = ConfigError;

    fn try_from(builder: ScenarioBuilder) -> Result<Self, ConfigError> {
        let ScenarioBuilder {
            initial,
            mut sequences,
        } = builder;
        if initial.is_empty() {
            return Err(ConfigError::EmptyScenario);
        }

        let mut ids = HashMap::new();
        for (i, sequence) in sequences.iter().enumerate() {
            if ids.insert(sequence.name.clone(), SequenceId(i as u32)).is_some() {
                return Err(ConfigError::DuplicateSequence(sequence.name.clone()));
            }
        }
        let initial = initial
            .into_iter()
            .map(|name| {
                ids.get(&name)
                    .copied()
                    .ok_or(ConfigError::UnknownSequence {
                        sequence: "(initial)".into(),
                        step: 0,
                        name,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut layout = Layout::default();
        let mut declared: HashMap<String, (ResourceKey, ResourceKind)> = HashMap::new();
        for sequence in &mut sequences {
            for (i, step) in sequence.steps.iter_mut().enumerate() {
                let invalid = |reason: &str| ConfigError::InvalidStep {
                    sequence: sequence.name.clone(),
                    step: i,
                    reason: reason.into(),
                };
                match step {
                    Step::Declare(declaration) => {
                        let key = layout.allocate(declaration.scope, SlotKind::Variable);
                        declaration.key = key;
                        if declared
                            .insert(declaration.name.clone(), (key, declaration.kind))
                            .is_some()
                        {
                            return Err(ConfigError::DuplicateResource {
                                sequence: sequence.name.clone(),
                                step: i,
                                name: declaration.name.clone(),
                            });
                        }
                    }
                    Step::Operation(op) => {
                        if op.metric.is_empty() {
                            return Err(invalid("operation has no metric name"));
                        }
                        if op.timeout.is_zero() {
                            return Err(invalid("operation timeout must be positive"));
                        }
                        for validator in &mut op.validators {
                            validator.bind(layout.allocate(Scope::Branch, SlotKind::Match));
                        }
                    }
                    Step::Fork(targets) => {
                        if targets.is_empty() {
                            return Err(invalid("fork without sequences"));
                        }
                        for target in targets.iter_mut() {
                            target.id = ids.get(&target.name).copied().ok_or_else(|| {
                                ConfigError::UnknownSequence {
                                    sequence: sequence.name.clone(),
                                    step: i,
                                    name: target.name.clone(),
                                }
                            })?;
                        }
                    }
                    Step::Action(_) | Step::Join | Step::Delay(_) => {}
                }
            }
        }

        // variables may be used before the step declaring them in another sequence
        for sequence in &mut sequences {
            for (i, step) in sequence.steps.iter_mut().enumerate() {
                let Step::Action(action) = step else { continue };
                let Some((var, expected)) = action.var_mut() else {
                    continue;
                };
                let Some(&(key, kind)) = declared.get(&var.name) else {
                    return Err(ConfigError::UnknownResource {
                        sequence: sequence.name.clone(),
                        step: i,
                        name: var.name.clone(),
                    });
                };
                if let Some(expected) = expected
                    && expected != kind
                {
                    return Err(ConfigError::ResourceKind {
                        sequence: sequence.name.clone(),
                        step: i,
                        name: var.name.clone(),
                        expected: expected.label(),
                    });
                }
                var.key = key;
            }
        }

        let mut bounds = BranchBounds::new(&sequences);
        let mut max_branches = 0;
        for &id in &initial {
            max_branches += bounds.bound(id)?;
        }

        Ok(Self {
            sequences,
            initial,
            session_slots: layout.session,
            branch_slots: layout.branch,
            max_branches,
        })
    }
}

#[derive(Default)]
struct Layout {
    session: Vec<SlotKind>,
    branch: Vec<SlotKind>,
}

impl Layout {
    fn allocate(&mut self, scope: Scope, kind: SlotKind) -> ResourceKey {
        let slots = match scope {
            Scope::Session => &mut self.session,
            Scope::Branch => &mut self.branch,
        };
        slots.push(kind);
        ResourceKey {
            scope,
            index: (slots.len() - 1) as u32,
        }
    }
}

/// Number of branches a sequence may create, itself included, summing every
/// fork it can reach.
struct BranchBounds<'a> {
    sequences: &'a [Sequence],
    memo: Vec<Option<usize>>,
    path: Vec<SequenceId>,
}

impl<'a> BranchBounds<'a> {
    fn new(sequences: &'a [Sequence]) -> Self {
        Self {
            sequences,
            memo: vec![None; sequences.len()],
            path: Vec::new(),
        }
    }

    fn bound(&mut self, id: SequenceId) -> Result<usize, ConfigError> {
        if let Some(bound) = self.memo[id.index()] {
            return Ok(bound);
        }
        if let Some(pos) = self.path.iter().position(|&p| p == id) {
            let mut cycle: Vec<String> = self.path[pos..]
                .iter()
                .map(|p| self.sequences[p.index()].name.clone())
                .collect();
            cycle.push(self.sequences[id.index()].name.clone());
            return Err(ConfigError::ForkCycle(cycle));
        }

        self.path.push(id);
        let mut bound = 1;
        for step in &self.sequences[id.index()].steps {
            if let Step::Fork(targets) = step {
                for target in targets {
                    bound += self.bound(target.id)?;
                }
            }
        }
        self.path.pop();
        self.memo[id.index()] = Some(bound);
        Ok(bound)
    }
}
