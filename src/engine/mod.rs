mod dispatch;
mod handle;
mod join;
mod report;
mod state;

pub use handle::EngineHandle;
pub use report::{
    JoinOutcome, JoinStatus, RetryRecord, RunOutcome, RunReport, UnreconciledEffect,
};
pub use state::{EngineStatus, ExecutionState, HistoryEntry};

use crate::approval::ApprovalMiddleware;
use crate::breakpoints::{Breakpoint, BreakpointManager, BreakpointSpec, Checkpoint, Evaluation};
use crate::config::{Config, EngineConfig};
use crate::error::{EngineError, Result};
use crate::observability::{EngineEvent, EventSink};
use crate::plan::{Plan, PlanArena, PlanId, Planner, StepStatus};
use crate::snapshot::{SnapshotOrigin, SnapshotStore, StateSnapshot};
use crate::tools::ToolInvoker;
use dispatch::Progress;
use report::Journal;
use std::sync::Arc;
use std::time::Duration;

/// Drives one plan at a time through breakpoints, approvals and tool calls.
///
/// The engine is the single writer of the live [`ExecutionState`]. Every
/// driving call (`start`, `resume`) runs until the plan finishes, fails, is
/// aborted, or comes to rest in `paused` / `waiting_approval`. Other tasks
/// steer a running engine through its [`EngineHandle`].
pub struct ExecutionEngine {
    config: EngineConfig,
    auto_approve_normal: bool,
    invoker: Arc<dyn ToolInvoker>,
    planner: Arc<dyn Planner>,
    approvals: Arc<ApprovalMiddleware>,
    sink: Arc<EventSink>,
    breakpoints: BreakpointManager,
    snapshots: SnapshotStore,
    plans: PlanArena,
    state: ExecutionState,
    handle: EngineHandle,
    journal: Journal,
    /// Set once the before-step breakpoints of the current step have been
    /// evaluated, so resuming does not fire them again.
    progress: Option<Progress>,
}

impl ExecutionEngine {
    pub fn new(
        config: &Config,
        invoker: Arc<dyn ToolInvoker>,
        planner: Arc<dyn Planner>,
        approvals: Arc<ApprovalMiddleware>,
        sink: Arc<EventSink>,
    ) -> Self {
        Self {
            config: config.engine.clone(),
            auto_approve_normal: config.approval.auto_approve_normal,
            invoker,
            planner,
            approvals,
            state: ExecutionState::new(sink.session_id()),
            sink,
            breakpoints: BreakpointManager::new(),
            snapshots: SnapshotStore::new(),
            plans: PlanArena::new(),
            handle: EngineHandle::new(),
            journal: Journal::default(),
            progress: None,
        }
    }

    // ── Driving ─────────────────────────────────────────────────────

    /// Validate `plan` and run it. An engine that finished a previous plan
    /// can start a new one; snapshots and plan versions are kept.
    pub async fn start(&mut self, plan: Plan) -> Result<RunOutcome> {
        let status = self.status();
        if status != EngineStatus::Idle && !status.is_terminal() {
            return Err(EngineError::invalid_transition(status, "start a plan"));
        }
        plan.validate()?;

        let steps = plan.len();
        let id = self.plans.insert_root(plan);
        self.state.reset_for(id, steps);
        self.journal = Journal::default();
        self.progress = None;
        self.handle.reset();
        if status.is_terminal() {
            self.handle.set_status(EngineStatus::Idle);
        }

        tracing::info!(plan = %id, steps, "starting plan");
        self.transition(EngineStatus::Running);
        self.sink.emit(EngineEvent::PlanStarted {
            plan_version: id,
            steps,
        });
        if self.config.snapshot_on_start {
            self.take_snapshot(SnapshotOrigin::Initial, None)?;
        }
        self.drive().await
    }

    /// Continue from `paused` or `waiting_approval`, or after a rollback.
    /// An outstanding approval is asked again.
    pub async fn resume(&mut self) -> Result<RunOutcome> {
        let status = self.status();
        if !matches!(
            status,
            EngineStatus::Paused | EngineStatus::WaitingApproval | EngineStatus::Running
        ) {
            return Err(EngineError::invalid_transition(status, "resume"));
        }
        self.handle.take_pause();
        if self.handle.is_abort_requested() {
            return Ok(self.finish_aborted());
        }
        self.transition(EngineStatus::Running);
        self.drive().await
    }

    pub fn pause(&mut self) -> Result<EngineStatus> {
        let status = self.status();
        match status {
            EngineStatus::Running => self.transition(EngineStatus::Paused),
            EngineStatus::Paused | EngineStatus::WaitingApproval => {}
            _ => return Err(EngineError::invalid_transition(status, "pause")),
        }
        Ok(self.status())
    }

    pub fn abort(&mut self) -> Result<RunOutcome> {
        let status = self.status();
        if status.is_terminal() {
            return Err(EngineError::invalid_transition(status, "abort"));
        }
        self.handle.abort();
        Ok(self.finish_aborted())
    }

    /// Cloneable control surface usable while a driving call is in progress.
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    async fn drive(&mut self) -> Result<RunOutcome> {
        loop {
            if self.handle.is_abort_requested() {
                return Ok(self.finish_aborted());
            }
            if self.handle.take_pause() {
                return Ok(self.pause_at(Vec::new()));
            }

            let Some(plan) = self.active_plan() else {
                return Err(EngineError::PlanInvalid(format!(
                    "plan {} is not loaded",
                    self.state.plan_version
                )));
            };
            let index = self.state.step_index;
            if index >= plan.len() {
                tracing::info!(plan = %plan.id, "plan completed");
                self.transition(EngineStatus::Completed);
                self.sink.flush();
                return Ok(self.outcome(Vec::new()));
            }

            let span = plan.join_span(index);
            let flow = if plan.steps[index].join_group.is_some() {
                let members = plan.steps[index..span.end].to_vec();
                self.run_group(index, members).await?
            } else {
                let step = plan.steps[index].clone();
                self.run_step(index, &step).await?
            };
            if let dispatch::Flow::Stop(outcome) = flow {
                return Ok(outcome);
            }
        }
    }

    // ── Breakpoints ─────────────────────────────────────────────────

    pub fn add_breakpoint(&mut self, spec: BreakpointSpec) -> Result<String> {
        let id = self.breakpoints.add(spec)?;
        tracing::info!(breakpoint = %id, "breakpoint added");
        Ok(id)
    }

    pub fn remove_breakpoint(&mut self, id: &str) -> Result<Breakpoint> {
        self.breakpoints.remove(id)
    }

    pub fn list_breakpoints(&self) -> &[Breakpoint] {
        self.breakpoints.list()
    }

    pub fn enable_breakpoint(&mut self, id: &str) -> Result<()> {
        self.breakpoints.enable(id)
    }

    pub fn disable_breakpoint(&mut self, id: &str) -> Result<()> {
        self.breakpoints.disable(id)
    }

    pub fn arm_breakpoint(&mut self, id: &str) -> Result<()> {
        self.breakpoints.arm(id)
    }

    // ── Snapshots & rollback ────────────────────────────────────────

    pub fn save_snapshot(&mut self, note: Option<String>) -> Result<StateSnapshot> {
        let status = self.status();
        if status == EngineStatus::Idle {
            return Err(EngineError::invalid_transition(status, "save a snapshot"));
        }
        self.take_snapshot(SnapshotOrigin::Manual, note)
    }

    pub fn state_history(&self) -> Vec<StateSnapshot> {
        self.snapshots.list()
    }

    /// Shared view of the snapshot log for outside readers.
    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Restore the state captured by `id`, drop every later snapshot and any
    /// outstanding approval, and leave the engine `running` at that step.
    /// Only tracked state is rewound; effects on the outside world stay.
    pub fn rollback_to(&mut self, id: &str) -> Result<StateSnapshot> {
        let status = self.status();
        if status == EngineStatus::Idle {
            return Err(EngineError::invalid_transition(status, "roll back"));
        }
        let target = self.snapshots.get(id)?;
        let restored = target.restore()?;
        if self.plans.get(restored.plan_version).is_none() {
            return Err(EngineError::RollbackConflict(format!(
                "snapshot {id} refers to unknown plan {}",
                restored.plan_version
            )));
        }

        let discarded = self.snapshots.truncate_after(id)?.len();
        let dropped = self.approvals.cancel_all_pending();
        self.state = restored;
        self.progress = None;
        self.handle.reset();
        self.force_status(EngineStatus::Running);

        tracing::info!(snapshot = %id, step_index = target.step_index, discarded, dropped, "rolled back");
        self.sink.emit(EngineEvent::RolledBack {
            snapshot_id: target.id.clone(),
            step_index: target.step_index,
            discarded,
        });
        Ok(target)
    }

    /// Roll back to the snapshot `n` positions before the latest one.
    pub fn rollback_steps(&mut self, n: usize) -> Result<StateSnapshot> {
        let target = self.snapshots.nth_back(n)?;
        self.rollback_to(&target.id)
    }

    // ── Redirection ─────────────────────────────────────────────────

    /// Replace the not-yet-executed suffix of the active plan with steps the
    /// planner produces for `instruction`. The executed prefix and its
    /// snapshots are kept; the result is stored as a child plan version.
    pub async fn redirect(&mut self, instruction: &str) -> Result<PlanId> {
        let status = self.status();
        if !matches!(status, EngineStatus::Paused | EngineStatus::WaitingApproval) {
            return Err(EngineError::invalid_transition(status, "redirect"));
        }
        let Some(current) = self.active_plan().cloned() else {
            return Err(EngineError::PlanInvalid("no active plan to redirect".into()));
        };

        let planner = Arc::clone(&self.planner);
        let suffix = planner
            .plan(instruction, &self.state)
            .await
            .map_err(|error| EngineError::Planner(format!("{error:#}")))?;
        if suffix.is_empty() {
            return Err(EngineError::PlanInvalid(
                "redirect produced no steps".into(),
            ));
        }

        let executed = self.state.step_index.min(current.len());
        let mut steps = current.steps[..executed].to_vec();
        steps.extend(suffix);
        let child = Plan {
            id: PlanId::default(),
            instruction: instruction.to_string(),
            steps,
            parent: None,
        };
        child.validate()?;

        let total = child.len();
        let id = self.plans.insert_child(current.id, child)?;
        self.state.plan_version = id;
        self.state.step_statuses.truncate(executed);
        self.state.step_statuses.resize(total, StepStatus::Pending);
        self.state.overrides.retain(|index, _| *index < executed);
        self.progress = None;
        self.approvals.cancel_all_pending();
        if status == EngineStatus::WaitingApproval {
            self.transition(EngineStatus::Paused);
        }

        tracing::info!(from = %current.id, to = %id, retained = executed, "plan redirected");
        self.sink.emit(EngineEvent::Redirected {
            from: current.id,
            to: id,
            retained_steps: executed,
        });
        Ok(id)
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn status(&self) -> EngineStatus {
        self.handle.status()
    }

    pub fn report(&self) -> RunReport {
        self.journal
            .report(self.active_plan(), &self.state, self.status())
    }

    pub fn active_plan(&self) -> Option<&Plan> {
        if self.plans.is_empty() {
            return None;
        }
        self.plans.get(self.state.plan_version)
    }

    pub fn plans(&self) -> &PlanArena {
        &self.plans
    }

    pub fn approvals(&self) -> &Arc<ApprovalMiddleware> {
        &self.approvals
    }

    /// Abort any unfinished run and drop session-scoped approval decisions.
    /// Returns how many remembered decisions were purged.
    pub fn end_session(&mut self) -> usize {
        let status = self.status();
        if status != EngineStatus::Idle && !status.is_terminal() {
            self.handle.abort();
            self.finish_aborted();
        }
        let purged = self.approvals.end_session();
        self.sink.flush();
        purged
    }

    // ── Internals shared by dispatch and join ───────────────────────

    fn grace(&self) -> Duration {
        Duration::from_millis(self.config.cancel_grace_ms)
    }

    fn transition(&self, next: EngineStatus) {
        let current = self.handle.status();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            tracing::warn!(from = %current, to = %next, "refused engine transition");
            return;
        }
        self.force_status(next);
    }

    fn force_status(&self, next: EngineStatus) {
        let from = self.handle.status();
        if from == next {
            return;
        }
        self.handle.set_status(next);
        tracing::info!(from = %from, to = %next, "engine transition");
        self.sink.emit(EngineEvent::Transition { from, to: next });
    }

    fn take_snapshot(
        &mut self,
        origin: SnapshotOrigin,
        note: Option<String>,
    ) -> Result<StateSnapshot> {
        let snapshot = self.snapshots.append(&self.state, origin, note)?;
        self.sink.emit(EngineEvent::SnapshotTaken {
            snapshot_id: snapshot.id.clone(),
            step_index: snapshot.step_index,
            origin,
        });
        Ok(snapshot)
    }

    /// Evaluate breakpoints as if the engine stood at `index`. Join-group
    /// members are checked one by one at their own positions.
    fn evaluate_at(&mut self, index: usize, checkpoint: Checkpoint<'_>) -> Evaluation {
        let current = std::mem::replace(&mut self.state.step_index, index);
        let evaluation = self.breakpoints.evaluate(checkpoint, &self.state);
        self.state.step_index = current;
        evaluation
    }

    fn report_hits(&self, evaluation: &Evaluation, step_index: usize) {
        for hit in &evaluation.hits {
            tracing::info!(breakpoint = %hit.id, kind = hit.kind.label(), step_index, "breakpoint fired");
            self.sink.emit(EngineEvent::BreakpointFired {
                breakpoint_id: hit.id.clone(),
                kind: hit.kind.label().to_string(),
                step_index,
                hit_count: hit.hit_count,
            });
            if let Some(message) = &hit.condition_error {
                self.sink.emit(EngineEvent::BreakpointConditionError {
                    breakpoint_id: hit.id.clone(),
                    message: message.clone(),
                });
            }
        }
    }

    fn outcome(&self, condition_errors: Vec<EngineError>) -> RunOutcome {
        let status = self.status();
        let waiting_on = (status == EngineStatus::WaitingApproval)
            .then(|| {
                self.active_plan()
                    .and_then(|plan| plan.steps.get(self.state.step_index))
                    .map(|step| step.id.clone())
            })
            .flatten();
        RunOutcome {
            status,
            paused_at: (status == EngineStatus::Paused).then_some(self.state.step_index),
            waiting_on,
            error: None,
            condition_errors,
            report: self.report(),
        }
    }

    fn pause_at(&mut self, condition_errors: Vec<EngineError>) -> RunOutcome {
        self.transition(EngineStatus::Paused);
        tracing::info!(step_index = self.state.step_index, "engine paused");
        self.outcome(condition_errors)
    }

    fn fail(&mut self, error: EngineError) -> RunOutcome {
        tracing::warn!(error = %error, "plan failed");
        self.journal.error = Some(error.to_string());
        self.progress = None;
        self.transition(EngineStatus::Failed);
        self.sink.flush();
        let mut outcome = self.outcome(Vec::new());
        outcome.error = Some(error);
        outcome
    }

    fn finish_aborted(&mut self) -> RunOutcome {
        let discarded = self.approvals.cancel_all_pending();
        self.progress = None;
        tracing::info!(discarded, "engine aborted");
        self.transition(EngineStatus::Aborted);
        self.sink.flush();
        self.outcome(Vec::new())
    }
}
