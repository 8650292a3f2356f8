//! A complete run against an in-process fake service.
//!
//! `RUST_LOG=stampede=debug cargo run --example local`

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use stampede::plugin::ShardId;
use stampede::scenario::{ResourceKind, Scope};
use stampede::{
    Action, Benchmark, Completer, Dependency, FailureKind, MatchCount, OperationStep, Phase,
    PercentileLimit, Plugin, PluginRegistry, Request, Runner, RuntimeConfig, ScalingStrategy,
    Scenario, SearchValidator, Sequence, Sla, Step,
};
use tracing_subscriber::EnvFilter;

/// Pretends to be a remote service: answers after `latency_ms` from the payload,
/// streaming the body in two fragments. Every 50th request is refused.
struct FakeService {
    shard: ShardId,
    issued: u64,
}

impl Plugin for FakeService {
    fn issue(&mut self, request: Request<'_>, completer: Completer) {
        self.issued += 1;
        if self.issued % 50 == 0 {
            completer.fail(FailureKind::Connection);
            return;
        }
        let latency = request.step.payload["latency_ms"].as_u64().unwrap_or(10);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(latency)).await;
            completer.data(Bytes::from_static(b"<h1>wel"));
            completer.data(Bytes::from_static(b"come</h1>"));
            completer.succeed();
        });
    }

    fn shutdown(&mut self) {
        tracing::info!("Shard {} issued {} requests", self.shard, self.issued);
    }
}

fn operation(metric: &str, latency_ms: u64) -> Step {
    Step::operation(
        OperationStep::builder()
            .plugin("fake")
            .metric(metric)
            .payload(json!({ "path": format!("/{metric}"), "latency_ms": latency_ms }))
            .timeout(Duration::from_millis(500))
            .validators(vec![SearchValidator::new("welcome", MatchCount::Exactly(1))])
            .build(),
    )
}

fn scenario() -> Result<Arc<Scenario>, stampede::ConfigError> {
    let scenario = Scenario::builder()
        .initial_sequence(
            Sequence::new("login")
                .step(Step::declare("visits", ResourceKind::Int, Scope::Session))
                .step(Step::action(Action::set_int("visits", 0)))
                .step(operation("login", 30))
                .step(Step::fork(["browse", "search"]))
                .step(Step::join())
                .step(Step::action(Action::add_int("visits", 1))),
        )
        .sequence(
            Sequence::new("browse")
                .step(operation("items", 20))
                .step(Step::delay(Duration::from_millis(50)))
                .step(operation("item", 15)),
        )
        .sequence(Sequence::new("search").step(operation("search", 40)))
        .build()?;
    Ok(Arc::new(scenario))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stampede=info")),
        )
        .init();

    let scenario = scenario()?;
    let benchmark = Benchmark::new("local")
        .phase(
            Phase::builder()
                .name("warmup")
                .scenario(Arc::clone(&scenario))
                .strategy(ScalingStrategy::AtOnce { users: 10 })
                .build(),
        )
        .phase(
            Phase::builder()
                .name("steady")
                .scenario(Arc::clone(&scenario))
                .strategy(ScalingStrategy::ConstantRate {
                    users_per_sec: 20.,
                    catch_up: false,
                })
                .duration(Duration::from_secs(3))
                .depends_on(vec![Dependency::terminated("warmup")])
                .slas(vec![
                    Sla::builder().error_ratio(0.05).build(),
                    Sla::builder()
                        .metric("search")
                        .percentile_limits(vec![PercentileLimit::new(
                            99.,
                            Duration::from_millis(100),
                        )])
                        .build(),
                ])
                .build(),
        )
        .phase(
            Phase::builder()
                .name("ramp")
                .scenario(scenario)
                .strategy(ScalingStrategy::RampRate {
                    initial_users_per_sec: 10.,
                    target_users_per_sec: 50.,
                    catch_up: true,
                })
                .duration(Duration::from_secs(3))
                .max_duration(Duration::from_secs(5))
                .max_sessions(16)
                .depends_on(vec![Dependency::finished("steady")])
                .build(),
        );

    let registry = PluginRegistry::new().with("fake", |shard: ShardId| {
        Box::new(FakeService { shard, issued: 0 }) as Box<dyn Plugin>
    })?;

    let mut runner = Runner::new(RuntimeConfig::from_env(), benchmark, registry)?;
    runner.init()?;
    runner.open_connections().await?;
    let report = runner.run().await?;
    runner.shutdown().await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_passing() {
        tracing::warn!("Benchmark {} did not pass", report.name);
    }
    Ok(())
}
