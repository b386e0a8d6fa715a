use crate::plan::{PlanId, StepStatus, ToolParams};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use strum::Display;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EngineStatus {
    #[default]
    Idle,
    Running,
    Paused,
    WaitingApproval,
    Completed,
    Failed,
    Aborted,
}

impl EngineStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use EngineStatus::{Aborted, Completed, Failed, Idle, Paused, Running, WaitingApproval};
        if self == next {
            return false;
        }
        match (self, next) {
            (_, Aborted) => !self.is_terminal(),
            (Idle, Running)
            | (Running, Paused | WaitingApproval | Completed | Failed)
            | (Paused, Running | WaitingApproval | Failed)
            | (WaitingApproval, Running | Paused | Failed) => true,
            _ => false,
        }
    }
}

/// One entry of the accumulated result history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step_id: String,
    pub tool: String,
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

/// Live working state of one session. All maps are ordered so the serialized
/// form is byte-stable for identical content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub session_id: String,
    pub plan_version: PlanId,
    pub step_index: usize,
    pub step_statuses: Vec<StepStatus>,
    pub history: Vec<HistoryEntry>,
    pub tool_usage: BTreeMap<String, u32>,
    pub variables: BTreeMap<String, Value>,
    /// Parameters that replace a step's planned ones, keyed by step index.
    /// Set by approver edits and by revised retries.
    pub overrides: BTreeMap<usize, ToolParams>,
}

impl ExecutionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            plan_version: PlanId::default(),
            step_index: 0,
            step_statuses: Vec::new(),
            history: Vec::new(),
            tool_usage: BTreeMap::new(),
            variables: BTreeMap::new(),
            overrides: BTreeMap::new(),
        }
    }

    /// Reset for a fresh plan of `len` steps, keeping the session id.
    pub(crate) fn reset_for(&mut self, plan_version: PlanId, len: usize) {
        let session_id = std::mem::take(&mut self.session_id);
        *self = Self::new(session_id);
        self.plan_version = plan_version;
        self.step_statuses = vec![StepStatus::Pending; len];
    }

    pub fn status_of(&self, index: usize) -> Option<StepStatus> {
        self.step_statuses.get(index).copied()
    }

    /// Move a step forward in its lifecycle. Backward moves are ignored and
    /// logged; only rollback rewinds statuses.
    pub(crate) fn set_status(&mut self, index: usize, next: StepStatus) {
        let Some(current) = self.step_statuses.get_mut(index) else {
            return;
        };
        if current.can_transition_to(next) {
            *current = next;
        } else {
            tracing::warn!(index, from = %current, to = %next, "ignored backward step transition");
        }
    }

    pub(crate) fn record_usage(&mut self, tool: &str) {
        *self.tool_usage.entry(tool.to_string()).or_insert(0) += 1;
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
