//! Seam between the engine and protocol implementations.
//!
//! Plugins are registered by tag in a [`PluginRegistry`] before the run starts.
//! Every executor shard asks each factory for its own [`Plugin`] instance, so a
//! plugin is only ever driven from one shard and needs no synchronization of its
//! own. Operations are issued without blocking; the plugin reports back through
//! the [`Completer`] it was handed, from any task, at any time.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::{ConfigError, PluginError};
use crate::executor::shard::ShardEvent;
use crate::metric::Outcome;
use crate::scenario::OperationStep;
use crate::session::CallbackTag;

pub type ShardId = usize;

/// Why an operation failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The response was rejected by the plugin.
    Invalid,
    Connection,
    /// Reported by the plugin itself, independently of the step's deadline.
    Timeout,
    Internal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    Success,
    Failure(FailureKind),
}

impl Completion {
    pub(crate) fn outcome(self) -> Outcome {
        match self {
            Completion::Success => Outcome::Success,
            Completion::Failure(FailureKind::Invalid) => Outcome::Invalid,
            Completion::Failure(FailureKind::Connection) => Outcome::ConnectionError,
            Completion::Failure(FailureKind::Timeout) => Outcome::Timeout,
            Completion::Failure(FailureKind::Internal) => Outcome::InternalError,
        }
    }
}

/// An operation handed to a plugin.
#[derive(Debug)]
pub struct Request<'a> {
    pub shard: ShardId,
    pub step: &'a OperationStep,
}

/// One-shot handle for reporting the result of an operation.
///
/// Handles of operations that were cancelled (the session timed out, failed or was
/// terminated) stay valid: what they report is dropped by the shard. Dropping a
/// handle without completing it leaves the operation to its deadline.
pub struct Completer {
    events: UnboundedSender<ShardEvent>,
    tag: CallbackTag,
}

impl Completer {
    pub(crate) fn new(events: UnboundedSender<ShardEvent>, tag: CallbackTag) -> Self {
        Self { events, tag }
    }

    /// Delivers a fragment of the response body to the step's validators.
    pub fn data(&self, fragment: Bytes) {
        // the shard is gone, nobody is interested any more
        let _ = self.events.send(ShardEvent::Data {
            tag: self.tag,
            fragment,
        });
    }

    pub fn complete(self, completion: Completion) {
        let _ = self.events.send(ShardEvent::Complete {
            tag: self.tag,
            completion,
        });
    }

    pub fn succeed(self) {
        self.complete(Completion::Success);
    }

    pub fn fail(self, kind: FailureKind) {
        self.complete(Completion::Failure(kind));
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer").field("tag", &self.tag).finish()
    }
}

/// Receives connection pool health figures from plugins.
pub trait ConnectionStatsConsumer {
    fn accept(&mut self, authority: &str, tag: &str, min: usize, max: usize);
}

/// Connection pool figures of one plugin on one shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub shard: ShardId,
    pub plugin: String,
    pub authority: String,
    pub tag: String,
    pub min: usize,
    pub max: usize,
}

/// Records what one plugin reports, on behalf of a shard.
pub(crate) struct ConnectionStatsCollector<'a> {
    pub shard: ShardId,
    pub plugin: &'a str,
    pub out: &'a mut Vec<ConnectionStats>,
}

impl ConnectionStatsConsumer for ConnectionStatsCollector<'_> {
    fn accept(&mut self, authority: &str, tag: &str, min: usize, max: usize) {
        self.out.push(ConnectionStats {
            shard: self.shard,
            plugin: self.plugin.to_owned(),
            authority: authority.to_owned(),
            tag: tag.to_owned(),
            min,
            max,
        });
    }
}

/// Protocol runtime of one shard.
pub trait Plugin: Send {
    /// Establishes connections before the first phase starts.
    fn open_connections(&mut self) -> BoxFuture<'static, Result<(), PluginError>> {
        Box::pin(async { Ok(()) })
    }

    /// Starts an operation. Must not block; the result goes to `completer`.
    fn issue(&mut self, request: Request<'_>, completer: Completer);

    fn visit_connection_stats(&self, _consumer: &mut dyn ConnectionStatsConsumer) {}

    /// Releases connections. Outstanding operations may be abandoned.
    fn shutdown(&mut self) {}
}

/// Creates the [`Plugin`] instance of each shard.
pub trait PluginFactory: Send + Sync {
    fn create(&self, shard: ShardId) -> Box<dyn Plugin>;
}

impl<F> PluginFactory for F
where
    F: Fn(ShardId) -> Box<dyn Plugin> + Send + Sync,
{
    fn create(&self, shard: ShardId) -> Box<dyn Plugin> {
        self(shard)
    }
}

/// Plugin factories by tag.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: BTreeMap<String, Arc<dyn PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        tag: impl Into<String>,
        factory: impl PluginFactory + 'static,
    ) -> Result<&mut Self, ConfigError> {
        let tag = tag.into();
        if self.factories.contains_key(&tag) {
            return Err(ConfigError::DuplicatePlugin(tag));
        }
        self.factories.insert(tag, Arc::new(factory));
        Ok(self)
    }

    pub fn with(
        mut self,
        tag: impl Into<String>,
        factory: impl PluginFactory + 'static,
    ) -> Result<Self, ConfigError> {
        self.register(tag, factory)?;
        Ok(self)
    }

    pub fn get(&self, tag: &str) -> Option<&Arc<dyn PluginFactory>> {
        self.factories.get(tag)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// One plugin instance per tag, for shard `shard`.
    pub(crate) fn instantiate(&self, shard: ShardId) -> BTreeMap<String, Box<dyn Plugin>> {
        self.factories
            .iter()
            .map(|(tag, factory)| (tag.clone(), factory.create(shard)))
            .collect()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silent;

    impl Plugin for Silent {
        fn issue(&mut self, _: Request<'_>, _: Completer) {}
    }

    #[test]
    fn duplicate_tags_are_rejected() {
        let registry = PluginRegistry::new()
            .with("silent", |_: ShardId| Box::new(Silent) as Box<dyn Plugin>)
            .unwrap();
        assert!(registry.contains("silent"));
        assert_eq!(registry.tags().collect::<Vec<_>>(), vec!["silent"]);
        let err = registry
            .with("silent", |_: ShardId| Box::new(Silent) as Box<dyn Plugin>)
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicatePlugin("silent".into()));
    }

    #[test]
    fn completion_outcomes() {
        assert_eq!(Completion::Success.outcome(), Outcome::Success);
        assert_eq!(
            Completion::Failure(FailureKind::Connection).outcome(),
            Outcome::ConnectionError
        );
        assert_eq!(
            Completion::Failure(FailureKind::Invalid).outcome(),
            Outcome::Invalid
        );
    }

    #[test]
    fn collector_names_shard_and_plugin() {
        let mut out = Vec::new();
        let mut collector = ConnectionStatsCollector {
            shard: 2,
            plugin: "http",
            out: &mut out,
        };
        collector.accept("localhost:8080", "pool", 1, 4);
        assert_eq!(
            out,
            vec![ConnectionStats {
                shard: 2,
                plugin: "http".into(),
                authority: "localhost:8080".into(),
                tag: "pool".into(),
                min: 1,
                max: 4
            }]
        );
    }
}
