use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use crate::aggregate::{Statistics, StatisticsSet};
use crate::error::{ContractViolation, Error, PluginError};
use crate::plugin::{
    Completer, Completion, ConnectionStats, ConnectionStatsCollector, FailureKind, Plugin,
    Request, ShardId,
};
use crate::pool::{Acquire, Pool, SlotId};
use crate::scenario::{OperationStep, Scenario};
use crate::session::{
    CallbackTag, OperationSink, RequestSlot, Session, SessionContext, SessionEnd, SessionView,
    TimerKind,
};

/// Controller to shard.
pub(crate) enum ShardCommand {
    /// Pre-allocates the pools of a phase. `capacity` is this shard's share of the
    /// phase's concurrency ceiling.
    Init {
        phase: usize,
        name: Arc<str>,
        scenario: Arc<Scenario>,
        capacity: usize,
    },
    OpenConnections {
        reply: oneshot::Sender<Result<(), PluginError>>,
    },
    StartSessions {
        phase: usize,
        count: u64,
    },
    TerminatePhase {
        phase: usize,
    },
    Statistics {
        phase: usize,
        reset: bool,
        reply: oneshot::Sender<PhaseSnapshot>,
    },
    VisitSessions {
        reply: oneshot::Sender<Vec<SessionView>>,
    },
    ConnectionStats {
        reply: oneshot::Sender<Vec<ConnectionStats>>,
    },
    Shutdown,
}

/// Plugin to shard, through a [`Completer`].
#[derive(Debug)]
pub(crate) enum ShardEvent {
    Data { tag: CallbackTag, fragment: Bytes },
    Complete { tag: CallbackTag, completion: Completion },
}

/// Shard to controller.
#[derive(Debug)]
pub(crate) enum ShardReport {
    /// Answer to one `StartSessions`, always sent before the ends of the sessions
    /// it started.
    Started {
        phase: usize,
        shard: ShardId,
        started: u64,
        blocked: u64,
    },
    Ended {
        phase: usize,
        shard: ShardId,
        end: SessionEnd,
    },
    Fault {
        shard: ShardId,
        error: ContractViolation,
    },
}

#[derive(Debug, Default)]
pub(crate) struct PhaseSnapshot {
    pub statistics: StatisticsSet,
    pub max_used: usize,
}

struct PhaseRuntime {
    name: Arc<str>,
    sessions: Pool<Session>,
    requests: Pool<RequestSlot>,
    statistics: Statistics,
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    tag: CallbackTag,
    kind: TimerKind,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

/// Deadlines and wake-ups of one shard. Entries are never removed early: a timer
/// whose operation already finished fires and is dropped as stale.
#[derive(Default)]
struct Timers {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    seq: u64,
}

impl Timers {
    fn push(&mut self, at: Instant, tag: CallbackTag, kind: TimerKind) {
        self.seq += 1;
        self.heap.push(Reverse(TimerEntry {
            at,
            seq: self.seq,
            tag,
            kind,
        }));
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(entry)| entry.at)
    }

    fn pop_due(&mut self, now: Instant) -> Option<TimerEntry> {
        if self.next_deadline()? <= now {
            self.heap.pop().map(|Reverse(entry)| entry)
        } else {
            None
        }
    }
}

/// The shard seen from a session.
struct Dispatch<'a> {
    shard: ShardId,
    plugins: &'a mut BTreeMap<String, Box<dyn Plugin>>,
    events: &'a UnboundedSender<ShardEvent>,
    timers: &'a mut Timers,
}

impl OperationSink for Dispatch<'_> {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn issue(&mut self, step: &OperationStep, tag: CallbackTag) {
        let completer = Completer::new(self.events.clone(), tag);
        match self.plugins.get_mut(&step.plugin) {
            Some(plugin) => plugin.issue(
                Request {
                    shard: self.shard,
                    step,
                },
                completer,
            ),
            None => {
                tracing::error!("No plugin '{}' on shard {}", step.plugin, self.shard);
                completer.fail(FailureKind::Internal);
            }
        }
    }

    fn schedule(&mut self, at: Instant, tag: CallbackTag, kind: TimerKind) {
        self.timers.push(at, tag, kind);
    }
}

enum Wakeup {
    Command(Option<ShardCommand>),
    Event(ShardEvent),
    Timer,
}

/// Single-task executor owning the sessions, pools, statistics and plugin
/// instances of its slice of every phase.
struct Shard {
    id: ShardId,
    template: Statistics,
    phases: Vec<Option<PhaseRuntime>>,
    plugins: BTreeMap<String, Box<dyn Plugin>>,
    timers: Timers,
    events_tx: UnboundedSender<ShardEvent>,
    events_rx: UnboundedReceiver<ShardEvent>,
    commands: UnboundedReceiver<ShardCommand>,
    reports: UnboundedSender<ShardReport>,
}

/// Controller side of a shard.
pub(crate) struct ShardHandle {
    pub id: ShardId,
    commands: UnboundedSender<ShardCommand>,
    join: JoinHandle<()>,
}

impl ShardHandle {
    pub fn send(&self, command: ShardCommand) -> Result<(), Error> {
        self.commands
            .send(command)
            .map_err(|_| Error::ShardUnavailable(self.id))
    }

    /// Sends a command carrying a reply channel and waits for the answer.
    pub async fn ask<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ShardCommand,
    ) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx))?;
        rx.await.map_err(|_| Error::ShardUnavailable(self.id))
    }

    pub fn into_join_handle(self) -> JoinHandle<()> {
        // ignore failure, the shard may already be gone
        let _ = self.commands.send(ShardCommand::Shutdown);
        self.join
    }
}

/// Spawns shard `id` on the current runtime.
pub(crate) fn spawn_shard(
    id: ShardId,
    template: Statistics,
    plugins: BTreeMap<String, Box<dyn Plugin>>,
    reports: UnboundedSender<ShardReport>,
) -> ShardHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let shard = Shard {
        id,
        template,
        phases: Vec::new(),
        plugins,
        timers: Timers::default(),
        events_tx,
        events_rx,
        commands: commands_rx,
        reports,
    };
    ShardHandle {
        id,
        commands: commands_tx,
        join: tokio::spawn(shard.run()),
    }
}

impl Shard {
    async fn run(mut self) {
        tracing::debug!("Shard {} started.", self.id);
        loop {
            let deadline = self.timers.next_deadline();
            let wakeup = tokio::select! {
                biased;
                command = self.commands.recv() => Wakeup::Command(command),
                Some(event) = self.events_rx.recv() => Wakeup::Event(event),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    Wakeup::Timer
                }
            };
            match wakeup {
                Wakeup::Command(None | Some(ShardCommand::Shutdown)) => break,
                Wakeup::Command(Some(command)) => self.handle_command(command),
                Wakeup::Event(event) => self.handle_event(event),
                Wakeup::Timer => self.fire_timers(),
            }
        }
        self.shutdown();
        tracing::debug!("Shard {} shutting down.", self.id);
    }

    fn report(&self, report: ShardReport) {
        // the controller is gone, nobody is listening
        let _ = self.reports.send(report);
    }

    fn fault(&self, error: ContractViolation) {
        tracing::error!("Shard {}: {error}", self.id);
        self.report(ShardReport::Fault {
            shard: self.id,
            error,
        });
    }

    fn ended(&self, phase: usize, end: SessionEnd) {
        self.report(ShardReport::Ended {
            phase,
            shard: self.id,
            end,
        });
    }

    fn handle_command(&mut self, command: ShardCommand) {
        match command {
            ShardCommand::Init {
                phase,
                name,
                scenario,
                capacity,
            } => self.init_phase(phase, name, scenario, capacity),
            ShardCommand::OpenConnections { reply } => {
                let pending: Vec<_> = self
                    .plugins
                    .values_mut()
                    .map(|plugin| plugin.open_connections())
                    .collect();
                tokio::spawn(async move {
                    let result = join_all(pending).await.into_iter().collect();
                    let _ = reply.send(result);
                });
            }
            ShardCommand::StartSessions { phase, count } => self.start_sessions(phase, count),
            ShardCommand::TerminatePhase { phase } => self.terminate_phase(phase),
            ShardCommand::Statistics {
                phase,
                reset,
                reply,
            } => {
                let snapshot = match self.phases.get_mut(phase).and_then(Option::as_mut) {
                    Some(runtime) => {
                        let snapshot = PhaseSnapshot {
                            statistics: runtime.statistics.snapshot(),
                            max_used: runtime.sessions.max_used(),
                        };
                        if reset {
                            runtime.statistics.reset();
                            runtime.sessions.reset_stats();
                            runtime.requests.reset_stats();
                        }
                        snapshot
                    }
                    None => PhaseSnapshot::default(),
                };
                let _ = reply.send(snapshot);
            }
            ShardCommand::VisitSessions { reply } => {
                let shard = self.id;
                let views = self
                    .phases
                    .iter()
                    .flatten()
                    .flat_map(|runtime| {
                        runtime.sessions.acquired().map(move |(slot, session)| SessionView {
                            phase: runtime.name.to_string(),
                            shard,
                            slot,
                            generation: session.generation(),
                            state: session.state(),
                            live_branches: session.live_branches(),
                            outstanding: session.outstanding(),
                        })
                    })
                    .collect();
                let _ = reply.send(views);
            }
            ShardCommand::ConnectionStats { reply } => {
                let mut out = Vec::new();
                for (tag, plugin) in &self.plugins {
                    plugin.visit_connection_stats(&mut ConnectionStatsCollector {
                        shard: self.id,
                        plugin: tag,
                        out: &mut out,
                    });
                }
                let _ = reply.send(out);
            }
            ShardCommand::Shutdown => {}
        }
    }

    fn init_phase(&mut self, phase: usize, name: Arc<str>, scenario: Arc<Scenario>, capacity: usize) {
        let requests = capacity * scenario.max_branches();
        tracing::debug!(
            "Shard {} reserving {capacity} sessions and {requests} request slots for {name}",
            self.id
        );
        if self.phases.len() <= phase {
            self.phases.resize_with(phase + 1, || None);
        }
        self.phases[phase] = Some(PhaseRuntime {
            name,
            sessions: Pool::new(capacity, |slot| Session::new(slot, Arc::clone(&scenario))),
            requests: Pool::new(requests, |_| RequestSlot::default()),
            statistics: self.template.clone(),
        });
    }

    fn start_sessions(&mut self, phase: usize, count: u64) {
        let mut started = 0;
        let mut blocked = 0;
        let mut ends = Vec::new();
        for _ in 0..count {
            let slot = match self.phases.get_mut(phase).and_then(Option::as_mut) {
                Some(runtime) => runtime.sessions.acquire(),
                None => Acquire::Exhausted,
            };
            let Acquire::Acquired(slot) = slot else {
                blocked += 1;
                continue;
            };
            started += 1;
            match self.drive(phase, slot, |session, ctx| session.start(ctx)) {
                Ok(Some(end)) => ends.push(end),
                Ok(None) => {}
                Err(error) => {
                    self.fault(error);
                    break;
                }
            }
        }
        if blocked > 0 {
            tracing::debug!("Shard {}: {blocked} session starts blocked", self.id);
        }
        self.report(ShardReport::Started {
            phase,
            shard: self.id,
            started,
            blocked,
        });
        for end in ends {
            self.ended(phase, end);
        }
    }

    fn terminate_phase(&mut self, phase: usize) {
        let Some(runtime) = self.phases.get(phase).and_then(Option::as_ref) else {
            return;
        };
        let live: Vec<SlotId> = runtime.sessions.acquired().map(|(slot, _)| slot).collect();
        tracing::debug!("Shard {} terminating {} sessions", self.id, live.len());
        for slot in live {
            match self.drive(phase, slot, |session, ctx| session.terminate(ctx)) {
                Ok(Some(end)) => self.ended(phase, end),
                Ok(None) => {}
                Err(error) => self.fault(error),
            }
        }
    }

    fn handle_event(&mut self, event: ShardEvent) {
        let (tag, result) = match event {
            ShardEvent::Data { tag, fragment } => (
                tag,
                self.drive(tag.phase, tag.slot, |session, _| {
                    session.on_data(tag, &fragment).map(|()| None)
                }),
            ),
            ShardEvent::Complete { tag, completion } => (
                tag,
                self.drive(tag.phase, tag.slot, |session, ctx| {
                    session.on_completion(tag, completion, ctx)
                }),
            ),
        };
        match result {
            Ok(Some(end)) => self.ended(tag.phase, end),
            Ok(None) => {}
            Err(error) => self.fault(error),
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some(timer) = self.timers.pop_due(now) {
            let tag = timer.tag;
            match self.drive(tag.phase, tag.slot, |session, ctx| {
                session.on_timer(tag, timer.kind, ctx)
            }) {
                Ok(Some(end)) => self.ended(tag.phase, end),
                Ok(None) => {}
                Err(error) => self.fault(error),
            }
        }
    }

    /// Runs `f` on an acquired session and returns the slot to the pool when the
    /// session ends. Events for free slots are stale and dropped.
    fn drive(
        &mut self,
        phase: usize,
        slot: SlotId,
        f: impl FnOnce(
            &mut Session,
            &mut SessionContext<'_>,
        ) -> Result<Option<SessionEnd>, ContractViolation>,
    ) -> Result<Option<SessionEnd>, ContractViolation> {
        let Self {
            id,
            phases,
            plugins,
            timers,
            events_tx,
            ..
        } = self;
        let Some(PhaseRuntime {
            sessions,
            requests,
            statistics,
            ..
        }) = phases.get_mut(phase).and_then(Option::as_mut)
        else {
            return Ok(None);
        };
        let Some(session) = sessions.get_mut(slot) else {
            return Ok(None);
        };
        let mut sink = Dispatch {
            shard: *id,
            plugins,
            events: events_tx,
            timers,
        };
        let mut ctx = SessionContext {
            phase,
            sink: &mut sink,
            statistics,
            requests,
        };
        let end = f(session, &mut ctx)?;
        if end.is_some() {
            sessions.release(slot)?;
        }
        Ok(end)
    }

    fn shutdown(&mut self) {
        for phase in 0..self.phases.len() {
            self.terminate_phase(phase);
        }
        for plugin in self.plugins.values_mut() {
            plugin.shutdown();
        }
    }
}
