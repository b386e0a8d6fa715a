use crate::approval::{ApprovalKind, Resolution};
use crate::engine::{EngineStatus, JoinStatus};
use crate::plan::PlanId;
use crate::snapshot::SnapshotOrigin;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Events produced by the engine and its collaborators
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Transition {
        from: EngineStatus,
        to: EngineStatus,
    },
    PlanStarted {
        plan_version: PlanId,
        steps: usize,
    },
    StepStarted {
        step_id: String,
        tool: String,
        attempt: u32,
    },
    StepSucceeded {
        step_id: String,
        tool: String,
    },
    StepFailed {
        step_id: String,
        tool: String,
        attempt: u32,
        error: String,
    },
    StepSkipped {
        step_id: String,
        reason: String,
    },
    RetryScheduled {
        step_id: String,
        attempt: u32,
        revised: bool,
    },
    BreakpointFired {
        breakpoint_id: String,
        kind: String,
        step_index: usize,
        hit_count: u64,
    },
    BreakpointConditionError {
        breakpoint_id: String,
        message: String,
    },
    ApprovalRequested {
        request_id: String,
        kind: ApprovalKind,
        subject: String,
    },
    ApprovalResolved {
        request_id: String,
        resolution: Resolution,
        auto_resolved: bool,
    },
    ApprovalDiscarded {
        request_id: String,
    },
    SnapshotTaken {
        snapshot_id: String,
        step_index: usize,
        origin: SnapshotOrigin,
    },
    RolledBack {
        snapshot_id: String,
        step_index: usize,
        discarded: usize,
    },
    Redirected {
        from: PlanId,
        to: PlanId,
        retained_steps: usize,
    },
    JoinGroupSettled {
        group: String,
        status: JoinStatus,
    },
    UnreconciledEffect {
        group: String,
        step_id: String,
    },
    Cancelled {
        step_id: String,
    },
}

/// One emitted event with its ordering and timing context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub session_id: String,
    pub event: EngineEvent,
}

/// Core observability trait, implemented by every backend
pub trait Observer: Send + Sync {
    /// Record one event
    fn record(&self, record: &EventRecord);

    /// Flush any buffered data (no-op for most backends)
    fn flush(&self) {}

    /// Human-readable name of this observer
    fn name(&self) -> &str;
}
