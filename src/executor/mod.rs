//! Executor: where sessions actually run.
//!
//! The engine runs a fixed number of shards. A shard is one tokio task that owns,
//! for each phase, a session pool, a request pool and a statistics recorder, plus
//! its own instance of every plugin. Nothing a shard owns is ever touched by
//! another task. The runner talks to shards with commands (`Init`,
//! `StartSessions`, `TerminatePhase`, `Statistics`, ...) and shards answer with
//! reports; plugins hand results back through the shard's event queue.
//!
//! Inside a shard nothing blocks and nothing yields except the shard loop itself,
//! so the steps of one session, and the order of sessions sharing a shard, are
//! deterministic for a given completion order.
//!
//! The arrival arithmetic of the rate strategies lives in [`rate`].

#[cfg(feature = "internals")]
pub mod rate;
#[cfg(not(feature = "internals"))]
pub(crate) mod rate;

pub(crate) mod shard;
