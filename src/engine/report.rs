use super::state::{EngineStatus, ExecutionState};
use crate::error::EngineError;
use crate::plan::{Plan, PlanId, StepStatus};
use serde::Serialize;
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JoinStatus {
    Succeeded,
    /// Some member was denied, failed or cancelled. There is no partial
    /// success.
    Aborted,
}

/// A join-group member that completed before its group aborted. Its effect
/// on the outside world stands and is not undone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreconciledEffect {
    pub group: String,
    pub step_id: String,
    pub tool: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinOutcome {
    pub group: String,
    pub status: JoinStatus,
    pub members: Vec<String>,
    pub committed: Vec<String>,
}

/// One failed attempt at a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryRecord {
    pub step_id: String,
    pub attempt: u32,
    pub tool: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub plan_version: PlanId,
    pub status: EngineStatus,
    pub steps_total: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub join_groups: Vec<JoinOutcome>,
    pub unreconciled: Vec<UnreconciledEffect>,
    /// Every failed attempt of the run, in order.
    pub retries: Vec<RetryRecord>,
    pub error: Option<String>,
}

impl RunReport {
    /// Failed attempts of one step.
    pub fn retries_for(&self, step_id: &str) -> Vec<&RetryRecord> {
        self.retries
            .iter()
            .filter(|record| record.step_id == step_id)
            .collect()
    }
}

/// Run-long bookkeeping that is not part of the rewindable state.
#[derive(Debug, Default)]
pub(crate) struct Journal {
    pub join_groups: Vec<JoinOutcome>,
    pub unreconciled: Vec<UnreconciledEffect>,
    pub retries: Vec<RetryRecord>,
    pub error: Option<String>,
}

impl Journal {
    pub fn report(&self, plan: Option<&Plan>, state: &ExecutionState, status: EngineStatus) -> RunReport {
        let mut report = RunReport {
            plan_version: state.plan_version,
            status,
            steps_total: plan.map_or(0, Plan::len),
            join_groups: self.join_groups.clone(),
            unreconciled: self.unreconciled.clone(),
            retries: self.retries.clone(),
            error: self.error.clone(),
            ..RunReport::default()
        };
        if let Some(plan) = plan {
            for (step, status) in plan.steps.iter().zip(&state.step_statuses) {
                let bucket = match status {
                    StepStatus::Succeeded => &mut report.succeeded,
                    StepStatus::Failed => &mut report.failed,
                    StepStatus::Skipped => &mut report.skipped,
                    StepStatus::Pending | StepStatus::Running => continue,
                };
                bucket.push(step.id.clone());
            }
        }
        report
    }
}

/// Result of a driving call (`start`, `resume`).
#[derive(Debug)]
pub struct RunOutcome {
    pub status: EngineStatus,
    /// Step index the engine stopped in front of, when paused.
    pub paused_at: Option<usize>,
    /// Step whose approval is outstanding, when waiting for approval.
    pub waiting_on: Option<String>,
    /// Why the plan failed, when it did.
    pub error: Option<EngineError>,
    /// Broken breakpoint conditions that caused this pause.
    pub condition_errors: Vec<EngineError>,
    pub report: RunReport,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == EngineStatus::Completed
    }
}
