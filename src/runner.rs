//! Phase scheduler and lifecycle API of a run.
//!
//! The [`Runner`] is the only place that sees every shard. It decides when phases
//! start, finish and terminate, turns scaling strategies into `StartSessions`
//! commands, and merges per-shard statistics when a phase terminates. Shards never
//! share state with it: everything goes through commands and reports.
//!
//! A run can be driven in two ways. [`Runner::run`] does everything: dependencies,
//! start delays, durations and `max_duration`, until every phase is terminated.
//! Orchestrators that want control use the individual lifecycle calls
//! ([`Runner::start_phase`], [`Runner::finish_phase`],
//! [`Runner::try_terminate_phase`], [`Runner::terminate_phase`]) and call
//! [`Runner::tick`] at their own pace.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{Instant, MissedTickBehavior};

use crate::aggregate::{SessionCounters, Statistics, StatisticsSet};
use crate::benchmark::{Benchmark, DependencyKind};
use crate::config::RuntimeConfig;
use crate::error::{ConfigError, ContractViolation, Error, Result};
use crate::executor::shard::{ShardCommand, ShardHandle, ShardReport, spawn_shard};
use crate::phase::{PhaseInstance, PhaseStatus, Starts};
use crate::plugin::{ConnectionStats, PluginRegistry};
use crate::report::{RunOutcome, RunReport};
use crate::session::SessionView;

pub struct Runner {
    config: RuntimeConfig,
    name: String,
    phases: Vec<PhaseInstance>,
    registry: PluginRegistry,
    template: Statistics,
    shards: Vec<ShardHandle>,
    reports_tx: UnboundedSender<ShardReport>,
    reports: UnboundedReceiver<ShardReport>,
    started_at: Option<Instant>,
    fault: Option<ContractViolation>,
}

impl Runner {
    /// Validates everything that can be checked before a session runs.
    pub fn new(
        config: RuntimeConfig,
        benchmark: Benchmark,
        registry: PluginRegistry,
    ) -> Result<Self> {
        config.validate()?;
        benchmark.validate()?;
        for phase in &benchmark.phases {
            if let Some(plugin) = phase.scenario.plugins().find(|tag| !registry.contains(tag)) {
                return Err(ConfigError::UnknownPlugin {
                    phase: phase.name.clone(),
                    plugin: plugin.to_owned(),
                }
                .into());
            }
        }
        let template = Statistics::new(config.histogram_shape())?;
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let phases = benchmark
            .phases
            .into_iter()
            .enumerate()
            .map(|(index, def)| PhaseInstance::new(index, def, config.shards))
            .collect();
        Ok(Self {
            config,
            name: benchmark.name,
            phases,
            registry,
            template,
            shards: Vec::new(),
            reports_tx,
            reports,
            started_at: None,
            fault: None,
        })
    }

    /// Spawns the shards and pre-allocates the pools of every phase. Must be called
    /// from within a tokio runtime. Calling it again does nothing.
    pub fn init(&mut self) -> Result<()> {
        if !self.shards.is_empty() {
            return Ok(());
        }
        tracing::info!("Spawning {} shards...", self.config.shards);
        for id in 0..self.config.shards {
            let shard = spawn_shard(
                id,
                self.template.clone(),
                self.registry.instantiate(id),
                self.reports_tx.clone(),
            );
            for phase in &self.phases {
                shard.send(ShardCommand::Init {
                    phase: phase.index,
                    name: Arc::from(phase.name()),
                    scenario: Arc::clone(&phase.def.scenario),
                    capacity: phase.shard_capacity(id),
                })?;
            }
            self.shards.push(shard);
        }
        Ok(())
    }

    /// Lets every plugin instance establish its connections.
    pub async fn open_connections(&self) -> Result<()> {
        let shards = self.shards()?;
        tracing::info!("Opening connections...");
        let results = join_all(
            shards
                .iter()
                .map(|shard| shard.ask(|reply| ShardCommand::OpenConnections { reply })),
        )
        .await;
        for result in results {
            result??;
        }
        Ok(())
    }

    pub fn start_phase(&mut self, name: &str) -> Result<()> {
        self.drain_reports()?;
        self.shards()?;
        let index = self.index(name)?;
        if !self.dependencies_met(index) {
            return Err(Error::InvalidTransition {
                phase: name.to_owned(),
                action: "start",
                status: "waiting for dependencies",
            });
        }
        self.start(index, Instant::now())
    }

    /// Stops a running phase from starting new sessions. Its sessions keep running.
    pub fn finish_phase(&mut self, name: &str) -> Result<()> {
        self.drain_reports()?;
        let index = self.index(name)?;
        self.phases[index].finish(Instant::now())
    }

    /// Moves a finished phase whose sessions have all ended to `Terminated`,
    /// collecting its statistics. Returns whether the phase is terminated.
    pub async fn try_terminate_phase(&mut self, name: &str) -> Result<bool> {
        self.drain_reports()?;
        let index = self.index(name)?;
        self.try_terminate(index).await
    }

    /// Terminates every live session of the phase and waits until the shards
    /// confirm. Terminating a terminated phase does nothing.
    pub async fn terminate_phase(&mut self, name: &str) -> Result<()> {
        self.drain_reports()?;
        let index = self.index(name)?;
        self.terminate(index)?;
        while !self.try_terminate(index).await? {
            self.wait_report().await?;
        }
        Ok(())
    }

    /// One scheduling round: processes shard reports, starts phases whose
    /// dependencies are met, issues what the scaling strategies owe and
    /// terminates what is done or overdue.
    pub async fn tick(&mut self) -> Result<()> {
        self.drain_reports()?;
        let now = Instant::now();
        let run_start = *self.started_at.get_or_insert(now);
        for index in 0..self.phases.len() {
            match self.phases[index].status() {
                PhaseStatus::NotStarted => {
                    let delay = self.phases[index].def.start_delay.unwrap_or_default();
                    if now.saturating_duration_since(run_start) >= delay
                        && self.dependencies_met(index)
                    {
                        self.start(index, now)?;
                    }
                }
                PhaseStatus::Running => {
                    let starts = self.phases[index].tick(now);
                    self.dispatch(index, starts)?;
                }
                _ => {}
            }
            if self.phases[index].is_overdue(now) {
                tracing::warn!(
                    "Phase {} exceeded its maximum duration",
                    self.phases[index].name()
                );
                self.terminate(index)?;
            }
            self.try_terminate(index).await?;
        }
        Ok(())
    }

    /// Runs the whole benchmark.
    ///
    /// Target failures never make this fail: they are in the report. An engine
    /// fault stops the run early with [`RunOutcome::Aborted`]. The shards stay up
    /// for inspection until [`Runner::shutdown`].
    pub async fn run(&mut self) -> Result<RunReport> {
        self.init()?;
        self.started_at.get_or_insert_with(Instant::now);
        tracing::info!("Running benchmark {}!", self.name);

        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let outcome = loop {
            let report = tokio::select! {
                _ = interval.tick() => None,
                report = self.reports.recv() => report,
            };
            let result = match report {
                Some(report) => self.handle_report(report),
                None => self.tick().await,
            };
            match result {
                Ok(()) if self.is_complete() => break RunOutcome::Completed,
                Ok(()) => {}
                Err(err) if err.is_internal_fault() => {
                    tracing::error!("Aborting benchmark {}: {err}", self.name);
                    self.abort();
                    break RunOutcome::Aborted {
                        reason: err.to_string(),
                    };
                }
                Err(err) => return Err(err),
            }
        };

        tracing::info!("Done running benchmark {}!", self.name);
        Ok(self.report(outcome))
    }

    /// Terminates what is still running, collects the remaining statistics and
    /// stops every shard. Plugin instances are shut down with their shard.
    pub async fn shutdown(&mut self) -> Result<()> {
        let now = Instant::now();
        while let Ok(report) = self.reports.try_recv() {
            self.absorb(report)?;
        }
        for index in 0..self.phases.len() {
            if self.phases[index].status() == PhaseStatus::Terminated {
                continue;
            }
            self.terminate(index)?;
            // after a fault the counters cannot be trusted to drain
            while self.fault.is_none()
                && !self.phases[index].can_terminate()
                && self.phases[index].status() != PhaseStatus::Terminated
            {
                match self.reports.recv().await {
                    Some(report) => self.absorb(report)?,
                    None => return Err(Error::NotInitialized),
                }
            }
            if self.phases[index].status() != PhaseStatus::Terminated {
                let (statistics, max_used) = self.collect(index, true).await?;
                self.phases[index].complete(statistics, max_used);
            }
        }
        tracing::info!("Shutting down {} shards...", self.shards.len());
        let handles = self.shards.drain(..).map(ShardHandle::into_join_handle);
        for result in join_all(handles).await {
            if let Err(err) = result {
                tracing::error!("Shard task failed: {err}");
            }
        }
        tracing::debug!(
            "Shutdown took {:?}",
            Instant::now().saturating_duration_since(now)
        );
        Ok(())
    }

    /// Calls `visitor` for every live session on every shard.
    pub async fn visit_sessions(&self, mut visitor: impl FnMut(&SessionView)) -> Result<()> {
        let shards = self.shards()?;
        let views = join_all(
            shards
                .iter()
                .map(|shard| shard.ask(|reply| ShardCommand::VisitSessions { reply })),
        )
        .await;
        for view in views {
            view?.iter().for_each(&mut visitor);
        }
        Ok(())
    }

    /// Statistics of a phase so far, merged over shards.
    pub async fn statistics(&self, name: &str) -> Result<StatisticsSet> {
        let index = self.index(name)?;
        let mut merged = self.phases[index].statistics().clone();
        if !self.shards.is_empty() {
            let (live, _) = self.collect(index, false).await?;
            merged.merge(&live)?;
        }
        Ok(merged)
    }

    /// Connection pool figures of every plugin on every shard.
    pub async fn connection_stats(&self) -> Result<Vec<ConnectionStats>> {
        let shards = self.shards()?;
        let stats = join_all(
            shards
                .iter()
                .map(|shard| shard.ask(|reply| ShardCommand::ConnectionStats { reply })),
        )
        .await;
        let mut all = Vec::new();
        for shard in stats {
            all.extend(shard?);
        }
        Ok(all)
    }

    pub fn phase_status(&self, name: &str) -> Result<PhaseStatus> {
        Ok(self.phases[self.index(name)?].status())
    }

    pub fn session_counters(&self, name: &str) -> Result<SessionCounters> {
        Ok(self.phases[self.index(name)?].counters())
    }

    pub fn is_complete(&self) -> bool {
        self.phases
            .iter()
            .all(|phase| phase.status() == PhaseStatus::Terminated)
    }

    /// Snapshot of the run as it stands.
    pub fn report(&self, outcome: RunOutcome) -> RunReport {
        let now = Instant::now();
        RunReport {
            name: self.name.clone(),
            outcome,
            duration: self
                .started_at
                .map(|start| now.saturating_duration_since(start))
                .unwrap_or_default(),
            phases: self
                .phases
                .iter()
                .map(|phase| phase.report(&self.config.percentiles, now))
                .collect(),
        }
    }

    fn shards(&self) -> Result<&[ShardHandle]> {
        if self.shards.is_empty() {
            Err(Error::NotInitialized)
        } else {
            Ok(&self.shards)
        }
    }

    fn index(&self, name: &str) -> Result<usize> {
        self.phases
            .iter()
            .position(|phase| phase.name() == name)
            .ok_or_else(|| Error::UnknownPhase(name.to_owned()))
    }

    fn dependencies_met(&self, index: usize) -> bool {
        self.phases[index].def.depends_on.iter().all(|dep| {
            self.phases
                .iter()
                .find(|phase| phase.name() == dep.phase)
                .is_some_and(|phase| match dep.until {
                    DependencyKind::Finished => phase.status().is_finished(),
                    DependencyKind::Terminated => phase.status() == PhaseStatus::Terminated,
                })
        })
    }

    fn terminations_met(&self, index: usize) -> bool {
        self.phases[index].def.terminate_after.iter().all(|name| {
            self.phases
                .iter()
                .any(|phase| phase.name() == name && phase.status() == PhaseStatus::Terminated)
        })
    }

    fn start(&mut self, index: usize, now: Instant) -> Result<()> {
        self.started_at.get_or_insert(now);
        let starts = self.phases[index].start(now)?;
        self.dispatch(index, starts)
    }

    fn dispatch(&self, phase: usize, starts: Starts) -> Result<()> {
        for (shard, count) in starts {
            self.shards()?
                .get(shard)
                .ok_or(Error::ShardUnavailable(shard))?
                .send(ShardCommand::StartSessions { phase, count })?;
        }
        Ok(())
    }

    fn terminate(&mut self, index: usize) -> Result<()> {
        if self.phases[index].begin_termination(Instant::now()) {
            for shard in &self.shards {
                shard.send(ShardCommand::TerminatePhase { phase: index })?;
            }
        }
        Ok(())
    }

    async fn try_terminate(&mut self, index: usize) -> Result<bool> {
        let phase = &self.phases[index];
        if phase.status() == PhaseStatus::Terminated {
            return Ok(true);
        }
        if !phase.can_terminate() {
            return Ok(false);
        }
        // forced termination does not wait for other phases
        if phase.status() == PhaseStatus::Finished && !self.terminations_met(index) {
            return Ok(false);
        }
        let (statistics, max_used) = self.collect(index, true).await?;
        self.phases[index].complete(statistics, max_used);
        Ok(true)
    }

    /// Merged statistics and summed pool watermark of a phase.
    async fn collect(&self, phase: usize, reset: bool) -> Result<(StatisticsSet, usize)> {
        let snapshots = join_all(self.shards.iter().map(|shard| {
            shard.ask(|reply| ShardCommand::Statistics {
                phase,
                reset,
                reply,
            })
        }))
        .await;
        let mut merged = StatisticsSet::default();
        let mut max_used = 0;
        for snapshot in snapshots {
            let snapshot = snapshot?;
            merged.merge(&snapshot.statistics)?;
            max_used += snapshot.max_used;
        }
        Ok((merged, max_used))
    }

    fn abort(&mut self) {
        for index in 0..self.phases.len() {
            if let Err(err) = self.terminate(index) {
                tracing::error!("Cannot terminate phase {}: {err}", self.phases[index].name());
            }
        }
    }

    fn handle_report(&mut self, report: ShardReport) -> Result<()> {
        match report {
            ShardReport::Started {
                phase,
                shard,
                started,
                blocked,
            } => {
                if let Some(phase) = self.phases.get_mut(phase) {
                    phase.on_started(shard, started, blocked);
                }
            }
            ShardReport::Ended { phase, shard, end } => {
                if let Some(instance) = self.phases.get_mut(phase) {
                    let starts = instance.on_ended(shard, end, Instant::now());
                    self.dispatch(phase, starts)?;
                }
            }
            ShardReport::Fault { shard, error } => {
                tracing::error!("Shard {shard} reported an engine fault: {error}");
                self.fault.get_or_insert_with(|| error.clone());
                return Err(error.into());
            }
        }
        Ok(())
    }

    /// Handles a report while winding down. Faults are already recorded and
    /// logged by [`Runner::handle_report`], so they do not stop the shutdown.
    fn absorb(&mut self, report: ShardReport) -> Result<()> {
        match self.handle_report(report) {
            Err(err) if err.is_internal_fault() => Ok(()),
            result => result,
        }
    }

    fn drain_reports(&mut self) -> Result<()> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone().into());
        }
        while let Ok(report) = self.reports.try_recv() {
            self.handle_report(report)?;
        }
        Ok(())
    }

    async fn wait_report(&mut self) -> Result<()> {
        match self.reports.recv().await {
            Some(report) => self.handle_report(report),
            None => Err(Error::NotInitialized),
        }
    }
}
