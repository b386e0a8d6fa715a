use super::traits::{EngineEvent, EventRecord, Observer};
use tracing::info;

/// Log-based observer: renders every event as one tracing line
pub struct LogObserver;

impl LogObserver {
    pub fn new() -> Self {
        Self
    }
}

impl Observer for LogObserver {
    #[allow(clippy::too_many_lines)]
    fn record(&self, record: &EventRecord) {
        let seq = record.seq;
        let session = record.session_id.as_str();
        match &record.event {
            EngineEvent::Transition { from, to } => {
                info!(seq, session, from = %from, to = %to, "engine.transition");
            }
            EngineEvent::PlanStarted {
                plan_version,
                steps,
            } => {
                info!(seq, session, plan = %plan_version, steps, "plan.started");
            }
            EngineEvent::StepStarted {
                step_id,
                tool,
                attempt,
            } => {
                info!(seq, session, step = %step_id, tool = %tool, attempt, "step.started");
            }
            EngineEvent::StepSucceeded { step_id, tool } => {
                info!(seq, session, step = %step_id, tool = %tool, "step.succeeded");
            }
            EngineEvent::StepFailed {
                step_id,
                tool,
                attempt,
                error,
            } => {
                info!(seq, session, step = %step_id, tool = %tool, attempt, error = %error, "step.failed");
            }
            EngineEvent::StepSkipped { step_id, reason } => {
                info!(seq, session, step = %step_id, reason = %reason, "step.skipped");
            }
            EngineEvent::RetryScheduled {
                step_id,
                attempt,
                revised,
            } => {
                info!(seq, session, step = %step_id, attempt, revised, "step.retry");
            }
            EngineEvent::BreakpointFired {
                breakpoint_id,
                kind,
                step_index,
                hit_count,
            } => {
                info!(seq, session, breakpoint = %breakpoint_id, kind = %kind, step_index, hit_count, "breakpoint.fired");
            }
            EngineEvent::BreakpointConditionError {
                breakpoint_id,
                message,
            } => {
                info!(seq, session, breakpoint = %breakpoint_id, error = %message, "breakpoint.condition_error");
            }
            EngineEvent::ApprovalRequested {
                request_id,
                kind,
                subject,
            } => {
                info!(seq, session, request_id = %request_id, kind = %kind, subject = %subject, "approval.requested");
            }
            EngineEvent::ApprovalResolved {
                request_id,
                resolution,
                auto_resolved,
            } => {
                info!(seq, session, request_id = %request_id, resolution = %resolution, auto_resolved, "approval.resolved");
            }
            EngineEvent::ApprovalDiscarded { request_id } => {
                info!(seq, session, request_id = %request_id, "approval.discarded");
            }
            EngineEvent::SnapshotTaken {
                snapshot_id,
                step_index,
                origin,
            } => {
                info!(seq, session, snapshot = %snapshot_id, step_index, origin = %origin, "snapshot.taken");
            }
            EngineEvent::RolledBack {
                snapshot_id,
                step_index,
                discarded,
            } => {
                info!(seq, session, snapshot = %snapshot_id, step_index, discarded, "snapshot.rollback");
            }
            EngineEvent::Redirected {
                from,
                to,
                retained_steps,
            } => {
                info!(seq, session, from = %from, to = %to, retained_steps, "plan.redirected");
            }
            EngineEvent::JoinGroupSettled { group, status } => {
                info!(seq, session, group = %group, status = %status, "join.settled");
            }
            EngineEvent::UnreconciledEffect { group, step_id } => {
                info!(seq, session, group = %group, step = %step_id, "join.unreconciled");
            }
            EngineEvent::Cancelled { step_id } => {
                info!(seq, session, step = %step_id, "step.cancelled");
            }
        }
    }

    fn name(&self) -> &str {
        "log"
    }
}
