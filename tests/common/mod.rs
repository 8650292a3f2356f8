#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use stampede::plugin::ShardId;
use stampede::{
    Completer, OperationStep, Plugin, PluginRegistry, Request, Scenario, Sequence, Step,
};

/// Answers every operation right away.
pub struct Immediate;

impl Plugin for Immediate {
    fn issue(&mut self, _: Request<'_>, completer: Completer) {
        completer.succeed();
    }
}

/// Answers after a fixed latency and remembers what it was asked, in order.
pub struct Delayed {
    pub latency: Duration,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl Plugin for Delayed {
    fn issue(&mut self, request: Request<'_>, completer: Completer) {
        self.log.lock().unwrap().push(request.step.metric.clone());
        let latency = self.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            completer.succeed();
        });
    }
}

/// Never answers on its own; the test decides.
pub struct Hanging(pub Arc<Mutex<Vec<Completer>>>);

impl Plugin for Hanging {
    fn issue(&mut self, _: Request<'_>, completer: Completer) {
        self.0.lock().unwrap().push(completer);
    }
}

pub fn registry(tag: &str, make: impl Fn() -> Box<dyn Plugin> + Send + Sync + 'static) -> PluginRegistry {
    PluginRegistry::new()
        .with(tag, move |_: ShardId| make())
        .unwrap()
}

/// One operation of `plugin`, recorded under `metric`.
pub fn single_operation(plugin: &str, metric: &str, timeout: Duration) -> Arc<Scenario> {
    Arc::new(
        Scenario::builder()
            .initial_sequence(Sequence::new("main").step(Step::operation(
                OperationStep::builder()
                    .plugin(plugin)
                    .metric(metric)
                    .timeout(timeout)
                    .build(),
            )))
            .build()
            .unwrap(),
    )
}
