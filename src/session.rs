//! Per-user execution state.
//!
//! A [`Session`] walks the steps of its [`Scenario`] without ever blocking. Every
//! concurrently running sequence is a branch with its own step pointer; a branch is
//! either runnable or waits for exactly one thing (an operation, a join, a timer).
//! Progress is driven from the outside by the owning shard: [`Session::start`],
//! then one call per delivered event ([`Session::on_data`],
//! [`Session::on_completion`], [`Session::on_timer`]). Each call runs every runnable
//! branch as far as it goes and reports whether the session ended.
//!
//! Every event carries a [`CallbackTag`] naming the session generation and the
//! operation it belongs to. Ending a session bumps its generation, so anything still
//! in flight for the previous user of the slot is recognized and dropped. A tag
//! naming a generation or operation that was never issued is a contract violation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::aggregate::{SessionEvent, Statistics};
use crate::error::ContractViolation;
use crate::matcher::MatchState;
use crate::metric::Outcome;
use crate::plugin::{Completion, ShardId};
use crate::pool::{Acquire, Pool, Reset, SlotId};
use crate::scenario::{
    Action, OperationStep, ResourceKey, Scenario, Scope, SequenceId, SlotKind, Step,
};

/// Identifies the session generation and the suspension an event belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CallbackTag {
    pub(crate) phase: usize,
    pub(crate) slot: SlotId,
    pub(crate) generation: u64,
    pub(crate) branch: u32,
    pub(crate) op: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Running,
    /// Every live branch waits for an operation, a join or a timer.
    Suspended,
    Completed,
    Failed,
    Terminated,
}

impl SessionState {
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Suspended)
    }
}

/// How a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    Completed,
    Failed,
    Terminated,
}

impl From<SessionEnd> for SessionEvent {
    fn from(end: SessionEnd) -> Self {
        match end {
            SessionEnd::Completed => SessionEvent::Completed,
            SessionEnd::Failed => SessionEvent::Failed,
            SessionEnd::Terminated => SessionEvent::Terminated,
        }
    }
}

impl From<SessionEnd> for SessionState {
    fn from(end: SessionEnd) -> Self {
        match end {
            SessionEnd::Completed => SessionState::Completed,
            SessionEnd::Failed => SessionState::Failed,
            SessionEnd::Terminated => SessionState::Terminated,
        }
    }
}

/// Value of an arena slot.
#[derive(Clone, Debug, PartialEq)]
pub enum Resource {
    Unset,
    Int(i64),
    Text(String),
    Match(MatchState),
}

impl Resource {
    fn initial(kind: SlotKind) -> Self {
        match kind {
            SlotKind::Variable => Resource::Unset,
            SlotKind::Match => Resource::Match(MatchState::default()),
        }
    }
}

/// Progress snapshot of one live session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    pub phase: String,
    pub shard: ShardId,
    pub slot: SlotId,
    pub generation: u64,
    pub state: SessionState,
    pub live_branches: usize,
    pub outstanding: usize,
}

/// Per-operation bookkeeping held while the operation is in flight.
#[derive(Debug, Default)]
pub struct RequestSlot {
    pub session: Option<SlotId>,
    pub generation: u64,
    pub op: u64,
    pub issued_at: Option<Instant>,
}

impl Reset for RequestSlot {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// The operation took too long.
    Deadline,
    /// A delay step elapsed.
    Wake,
}

/// What a session needs from its shard.
pub(crate) trait OperationSink {
    fn now(&self) -> Instant;
    fn issue(&mut self, step: &OperationStep, tag: CallbackTag);
    fn schedule(&mut self, at: Instant, tag: CallbackTag, kind: TimerKind);
}

pub(crate) struct SessionContext<'a> {
    pub phase: usize,
    pub sink: &'a mut dyn OperationSink,
    pub statistics: &'a mut Statistics,
    pub requests: &'a mut Pool<RequestSlot>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Wait {
    Runnable,
    Operation { op: u64, request: SlotId },
    Join,
    Delay { op: u64 },
    Done,
}

#[derive(Clone, Debug)]
struct Branch {
    sequence: SequenceId,
    step: usize,
    wait: Wait,
    parent: Option<usize>,
    children: usize,
}

impl Branch {
    fn new(sequence: SequenceId, parent: Option<usize>) -> Self {
        Self {
            sequence,
            step: 0,
            wait: Wait::Runnable,
            parent,
            children: 0,
        }
    }
}

/// One simulated user, recycled through a [`Pool`].
pub struct Session {
    slot: SlotId,
    scenario: Arc<Scenario>,
    generation: u64,
    next_op: u64,
    state: SessionState,
    branches: Vec<Branch>,
    resources: Vec<Resource>,
}

impl Reset for Session {
    fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.branches.clear();
        let branch_kinds = self.scenario.branch_slots();
        let kinds = self.scenario.session_slots().iter().chain(
            branch_kinds
                .iter()
                .cycle()
                .take(branch_kinds.len() * self.scenario.max_branches()),
        );
        for (resource, kind) in self.resources.iter_mut().zip(kinds) {
            *resource = Resource::initial(*kind);
        }
    }
}

impl Session {
    pub fn new(slot: SlotId, scenario: Arc<Scenario>) -> Self {
        let branch_kinds = scenario.branch_slots();
        let resources = scenario
            .session_slots()
            .iter()
            .chain(
                branch_kinds
                    .iter()
                    .cycle()
                    .take(branch_kinds.len() * scenario.max_branches()),
            )
            .map(|kind| Resource::initial(*kind))
            .collect();
        Self {
            slot,
            branches: Vec::with_capacity(scenario.max_branches()),
            scenario,
            generation: 0,
            next_op: 0,
            state: SessionState::Idle,
            resources,
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn live_branches(&self) -> usize {
        self.branches
            .iter()
            .filter(|b| b.wait != Wait::Done)
            .count()
    }

    /// Operations currently in flight.
    pub fn outstanding(&self) -> usize {
        self.branches
            .iter()
            .filter(|b| matches!(b.wait, Wait::Operation { .. }))
            .count()
    }

    pub fn resource(&self, key: ResourceKey, branch: usize) -> Option<&Resource> {
        self.resources.get(self.resource_index(key, branch))
    }

    fn resource_index(&self, key: ResourceKey, branch: usize) -> usize {
        let index = key.index as usize;
        match key.scope {
            Scope::Session => index,
            Scope::Branch => {
                self.scenario.session_slots().len()
                    + branch * self.scenario.branch_slots().len()
                    + index
            }
        }
    }

    fn resource_mut(&mut self, key: ResourceKey, branch: usize) -> Option<&mut Resource> {
        let index = self.resource_index(key, branch);
        self.resources.get_mut(index)
    }

    fn tag(&self, phase: usize, branch: usize, op: u64) -> CallbackTag {
        CallbackTag {
            phase,
            slot: self.slot,
            generation: self.generation,
            branch: branch as u32,
            op,
        }
    }

    fn next_op(&mut self) -> u64 {
        let op = self.next_op;
        self.next_op += 1;
        op
    }

    /// Begins a new user in a freshly acquired slot.
    pub(crate) fn start(
        &mut self,
        ctx: &mut SessionContext<'_>,
    ) -> Result<Option<SessionEnd>, ContractViolation> {
        self.state = SessionState::Running;
        let scenario = Arc::clone(&self.scenario);
        for &sequence in scenario.initial() {
            self.branches.push(Branch::new(sequence, None));
        }
        tracing::trace!("{} started (generation {})", self.slot, self.generation);
        self.run(ctx)
    }

    /// Feeds a response fragment to the validators of the pending operation.
    pub(crate) fn on_data(
        &mut self,
        tag: CallbackTag,
        fragment: &[u8],
    ) -> Result<(), ContractViolation> {
        let Some((branch, _)) = self.pending_operation(tag)? else {
            return Ok(());
        };
        let scenario = Arc::clone(&self.scenario);
        let Some(Step::Operation(op)) = self.current_step(&scenario, branch) else {
            return Ok(());
        };
        for validator in &op.validators {
            if let Some(Resource::Match(state)) = self.resource_mut(validator.key(), branch) {
                validator.validate_data(state, fragment);
            }
        }
        Ok(())
    }

    pub(crate) fn on_completion(
        &mut self,
        tag: CallbackTag,
        completion: Completion,
        ctx: &mut SessionContext<'_>,
    ) -> Result<Option<SessionEnd>, ContractViolation> {
        let Some((branch, request)) = self.pending_operation(tag)? else {
            tracing::trace!("{} dropping stale completion {tag:?}", self.slot);
            return Ok(None);
        };
        let scenario = Arc::clone(&self.scenario);
        let Some(Step::Operation(op)) = self.current_step(&scenario, branch) else {
            return Ok(None);
        };
        let mut outcome = completion.outcome();
        for validator in &op.validators {
            if let Some(Resource::Match(state)) = self.resource_mut(validator.key(), branch)
                && !validator.validate(state)
                && outcome.is_success()
            {
                outcome = Outcome::Invalid;
            }
        }
        self.finish_operation(branch, request, tag.op, op, outcome, ctx)
    }

    pub(crate) fn on_timer(
        &mut self,
        tag: CallbackTag,
        kind: TimerKind,
        ctx: &mut SessionContext<'_>,
    ) -> Result<Option<SessionEnd>, ContractViolation> {
        match kind {
            TimerKind::Deadline => {
                let Some((branch, request)) = self.pending_operation(tag)? else {
                    return Ok(None);
                };
                let scenario = Arc::clone(&self.scenario);
                let Some(Step::Operation(op)) = self.current_step(&scenario, branch) else {
                    return Ok(None);
                };
                tracing::trace!("{} operation {} timed out", self.slot, op.metric);
                self.finish_operation(branch, request, tag.op, op, Outcome::Timeout, ctx)
            }
            TimerKind::Wake => {
                if !self.is_current(tag)? {
                    return Ok(None);
                }
                let branch = tag.branch as usize;
                match self.branches.get_mut(branch) {
                    Some(b) if b.wait == (Wait::Delay { op: tag.op }) => {
                        b.wait = Wait::Runnable;
                        b.step += 1;
                    }
                    _ => return Ok(None),
                }
                self.run(ctx)
            }
        }
    }

    /// Abandons the session wherever it is. Terminating a session that is not live
    /// does nothing.
    pub(crate) fn terminate(
        &mut self,
        ctx: &mut SessionContext<'_>,
    ) -> Result<Option<SessionEnd>, ContractViolation> {
        if !self.state.is_live() {
            return Ok(None);
        }
        tracing::trace!("{} terminated", self.slot);
        self.end(SessionEnd::Terminated, ctx).map(Some)
    }

    fn is_current(&self, tag: CallbackTag) -> Result<bool, ContractViolation> {
        if tag.generation > self.generation || tag.op >= self.next_op {
            return Err(ContractViolation::PrematureCallback {
                slot: self.slot,
                generation: tag.generation,
                operation: tag.op,
                current: self.generation,
            });
        }
        Ok(tag.generation == self.generation && self.state.is_live())
    }

    fn pending_operation(
        &self,
        tag: CallbackTag,
    ) -> Result<Option<(usize, SlotId)>, ContractViolation> {
        if !self.is_current(tag)? {
            return Ok(None);
        }
        let branch = tag.branch as usize;
        Ok(match self.branches.get(branch).map(|b| b.wait) {
            Some(Wait::Operation { op, request }) if op == tag.op => Some((branch, request)),
            _ => None,
        })
    }

    fn current_step<'s>(&self, scenario: &'s Scenario, branch: usize) -> Option<&'s Step> {
        let branch = self.branches.get(branch)?;
        scenario.sequence(branch.sequence).steps.get(branch.step)
    }

    fn finish_operation(
        &mut self,
        branch: usize,
        request: SlotId,
        id: u64,
        op: &OperationStep,
        outcome: Outcome,
        ctx: &mut SessionContext<'_>,
    ) -> Result<Option<SessionEnd>, ContractViolation> {
        let issued_at = match ctx.requests.get(request) {
            Some(record)
                if record.session == Some(self.slot)
                    && record.generation == self.generation
                    && record.op == id =>
            {
                record.issued_at
            }
            _ => {
                return Err(ContractViolation::ForeignRequest {
                    request,
                    slot: self.slot,
                    operation: id,
                });
            }
        };
        let latency = issued_at
            .map(|issued| ctx.sink.now().saturating_duration_since(issued))
            .unwrap_or_default();
        ctx.requests.release(request)?;
        ctx.statistics.record(
            &op.metric,
            outcome,
            u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX),
        );

        self.branches[branch].wait = Wait::Runnable;
        if outcome.is_success() || !op.fatal {
            self.branches[branch].step += 1;
            self.run(ctx)
        } else {
            tracing::trace!("{} failed in {}: {outcome:?}", self.slot, op.metric);
            self.end(SessionEnd::Failed, ctx).map(Some)
        }
    }

    fn end(
        &mut self,
        end: SessionEnd,
        ctx: &mut SessionContext<'_>,
    ) -> Result<SessionEnd, ContractViolation> {
        for branch in &mut self.branches {
            if let Wait::Operation { request, .. } = branch.wait {
                ctx.requests.release(request)?;
            }
            branch.wait = Wait::Done;
        }
        self.generation += 1;
        self.state = end.into();
        Ok(end)
    }

    fn run(
        &mut self,
        ctx: &mut SessionContext<'_>,
    ) -> Result<Option<SessionEnd>, ContractViolation> {
        self.state = SessionState::Running;
        let scenario = Arc::clone(&self.scenario);
        while let Some(branch) = self
            .branches
            .iter()
            .position(|b| b.wait == Wait::Runnable)
        {
            if let Some(end) = self.advance(&scenario, branch, ctx)? {
                return Ok(Some(end));
            }
        }
        if self.branches.iter().all(|b| b.wait == Wait::Done) {
            tracing::trace!("{} completed", self.slot);
            return self.end(SessionEnd::Completed, ctx).map(Some);
        }
        self.state = SessionState::Suspended;
        Ok(None)
    }

    /// Executes steps of one branch until it suspends or finishes.
    fn advance(
        &mut self,
        scenario: &Scenario,
        b: usize,
        ctx: &mut SessionContext<'_>,
    ) -> Result<Option<SessionEnd>, ContractViolation> {
        loop {
            let Some(step) = self.current_step(scenario, b) else {
                self.finish_branch(b);
                return Ok(None);
            };
            match step {
                Step::Action(action) => {
                    if let Err(reason) = self.execute(action, b) {
                        tracing::warn!("{} failed: {reason}", self.slot);
                        return self.end(SessionEnd::Failed, ctx).map(Some);
                    }
                }
                Step::Declare(declaration) => {
                    if let Some(resource) = self.resource_mut(declaration.key(), b) {
                        *resource = Resource::Unset;
                    }
                }
                Step::Operation(op) => {
                    self.issue(b, op, ctx)?;
                    return Ok(None);
                }
                Step::Fork(targets) => {
                    for target in targets {
                        self.branches.push(Branch::new(target.id(), Some(b)));
                        self.branches[b].children += 1;
                    }
                }
                Step::Join => {
                    if self.branches[b].children > 0 {
                        self.branches[b].wait = Wait::Join;
                        return Ok(None);
                    }
                }
                Step::Delay(delay) => {
                    let op = self.next_op();
                    let tag = self.tag(ctx.phase, b, op);
                    let at = ctx.sink.now() + *delay;
                    self.branches[b].wait = Wait::Delay { op };
                    ctx.sink.schedule(at, tag, TimerKind::Wake);
                    return Ok(None);
                }
            }
            self.branches[b].step += 1;
        }
    }

    fn finish_branch(&mut self, b: usize) {
        self.branches[b].wait = Wait::Done;
        let Some(parent) = self.branches[b].parent else {
            return;
        };
        let parent = &mut self.branches[parent];
        parent.children -= 1;
        if parent.children == 0 && parent.wait == Wait::Join {
            parent.wait = Wait::Runnable;
            parent.step += 1;
        }
    }

    fn issue(
        &mut self,
        b: usize,
        op: &OperationStep,
        ctx: &mut SessionContext<'_>,
    ) -> Result<(), ContractViolation> {
        let Acquire::Acquired(request) = ctx.requests.acquire() else {
            return Err(ContractViolation::RequestOverflow {
                phase: ctx.phase,
                capacity: ctx.requests.capacity(),
            });
        };
        let id = self.next_op();
        let tag = self.tag(ctx.phase, b, id);
        let now = ctx.sink.now();
        if let Some(slot) = ctx.requests.get_mut(request) {
            *slot = RequestSlot {
                session: Some(self.slot),
                generation: self.generation,
                op: id,
                issued_at: Some(now),
            };
        }
        for validator in &op.validators {
            if let Some(Resource::Match(state)) = self.resource_mut(validator.key(), b) {
                validator.before_data(state);
            }
        }
        self.branches[b].wait = Wait::Operation { op: id, request };

        ctx.statistics.record_request(&op.metric);
        ctx.sink.schedule(now + op.timeout, tag, TimerKind::Deadline);
        ctx.sink.issue(op, tag);
        Ok(())
    }

    fn execute(&mut self, action: &Action, b: usize) -> Result<(), String> {
        let slot = self.slot;
        match action {
            Action::SetInt { var, value } => {
                if let Some(resource) = self.resource_mut(var.key(), b) {
                    *resource = Resource::Int(*value);
                }
            }
            Action::AddInt { var, delta } => match self.resource_mut(var.key(), b) {
                Some(Resource::Int(current)) => *current = current.saturating_add(*delta),
                _ => return Err(format!("variable '{}' is not set", var.name())),
            },
            Action::SetText { var, value } => match self.resource_mut(var.key(), b) {
                Some(Resource::Text(current)) => {
                    current.clear();
                    current.push_str(value);
                }
                Some(resource) => *resource = Resource::Text(value.clone()),
                None => {}
            },
            Action::Unset { var } => {
                if let Some(resource) = self.resource_mut(var.key(), b) {
                    *resource = Resource::Unset;
                }
            }
            Action::Log { message } => tracing::info!("{slot}: {message}"),
        }
        Ok(())
    }
}
