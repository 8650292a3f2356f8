use thiserror::Error;

use crate::pool::SlotId;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top level error of the runtime.
///
/// Operation failures (timeouts, transport errors, validation mismatches) are never
/// reported through this type: they are recorded as [`crate::metric::Outcome`]s.
/// Pool exhaustion is not an error either, see [`crate::pool::Acquire`].
#[derive(Debug, Error)]
pub enum Error {
    /// The benchmark definition cannot be executed.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The engine detected a broken internal invariant. The run cannot continue.
    #[error("engine internal fault: {0}")]
    Contract(#[from] ContractViolation),

    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("the runner has not been initialized")]
    NotInitialized,

    #[error("shard {0} is not running")]
    ShardUnavailable(usize),

    #[error("unknown phase '{0}'")]
    UnknownPhase(String),

    #[error("phase '{phase}' cannot {action} while {status}")]
    InvalidTransition {
        phase: String,
        action: &'static str,
        status: &'static str,
    },
}

impl Error {
    /// True for errors that indicate a bug in the engine or in a plugin rather than
    /// a problem with the benchmark or the target service.
    pub fn is_internal_fault(&self) -> bool {
        matches!(self, Error::Contract(_) | Error::ShardUnavailable(_))
    }
}

/// Problems found before any session runs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("phase '{0}' is defined more than once")]
    DuplicatePhase(String),

    #[error("phase '{phase}' depends on unknown phase '{dependency}'")]
    UnknownDependency { phase: String, dependency: String },

    #[error("phase dependencies form a cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("phase '{phase}': {reason}")]
    InvalidPhase { phase: String, reason: String },

    #[error("scenario has no initial sequence")]
    EmptyScenario,

    #[error("sequence '{0}' is defined more than once")]
    DuplicateSequence(String),

    #[error("sequence '{sequence}', step {step}: unknown sequence '{name}'")]
    UnknownSequence {
        sequence: String,
        step: usize,
        name: String,
    },

    #[error("sequence forks form a cycle: {}", .0.join(" -> "))]
    ForkCycle(Vec<String>),

    #[error("sequence '{sequence}', step {step}: resource '{name}' is already declared")]
    DuplicateResource {
        sequence: String,
        step: usize,
        name: String,
    },

    #[error("sequence '{sequence}', step {step}: resource '{name}' is not declared")]
    UnknownResource {
        sequence: String,
        step: usize,
        name: String,
    },

    #[error("sequence '{sequence}', step {step}: resource '{name}' is not of kind {expected}")]
    ResourceKind {
        sequence: String,
        step: usize,
        name: String,
        expected: &'static str,
    },

    #[error("sequence '{sequence}', step {step}: {reason}")]
    InvalidStep {
        sequence: String,
        step: usize,
        reason: String,
    },

    #[error("phase '{phase}' uses unknown plugin '{plugin}'")]
    UnknownPlugin { phase: String, plugin: String },

    #[error("plugin '{0}' is registered more than once")]
    DuplicatePlugin(String),

    #[error("invalid histogram shape: {0}")]
    Histogram(String),

    #[error("invalid runtime configuration: {0}")]
    Runtime(String),
}

/// Broken engine invariants. These abort the run with full context rather than
/// silently corrupting pools or aggregates.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContractViolation {
    #[error("slot {0} released while not acquired")]
    DoubleRelease(SlotId),

    #[error("slot {slot} is outside of a pool of capacity {capacity}")]
    SlotOutOfRange { slot: SlotId, capacity: usize },

    #[error(
        "callback for session slot {slot} carries generation {generation}/operation {operation} \
         which was never issued (current generation {current})"
    )]
    PrematureCallback {
        slot: SlotId,
        generation: u64,
        operation: u64,
        current: u64,
    },

    #[error("request slot {request} does not belong to operation {operation} of session slot {slot}")]
    ForeignRequest {
        request: SlotId,
        slot: SlotId,
        operation: u64,
    },

    #[error("request pool of phase {phase} exhausted ({capacity} slots)")]
    RequestOverflow { phase: usize, capacity: usize },

    #[error("cannot merge statistics of '{metric}': {reason}")]
    IncompatibleSnapshots { metric: String, reason: String },
}

/// Errors surfaced by protocol plugins outside of individual operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PluginError {
    #[error("plugin '{plugin}' failed to open connections: {reason}")]
    Connect { plugin: String, reason: String },

    #[error("plugin '{plugin}': {reason}")]
    Other { plugin: String, reason: String },
}
