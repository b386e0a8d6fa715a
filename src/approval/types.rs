use super::policy::ActionSignature;
use crate::plan::Sensitivity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApprovalKind {
    Permission,
    Confirmation,
    SensitiveAction,
    Execution,
    FileWrite,
    Breakpoint,
    Review,
    Edit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Resolution {
    Pending,
    Approved,
    Denied,
    Modified,
}

impl Resolution {
    pub fn is_approved(self) -> bool {
        matches!(self, Self::Approved | Self::Modified)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RememberScope {
    Session,
    Persistent,
}

/// Parameters shown to the approver. Only fields named in `editable` may be
/// changed by a `modify` verdict.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalPayload {
    pub fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub editable: BTreeSet<String>,
}

impl ApprovalPayload {
    pub fn new(fields: BTreeMap<String, Value>) -> Self {
        Self {
            fields,
            editable: BTreeSet::new(),
        }
    }

    pub fn editable<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.editable = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_editable(&self, field: &str) -> bool {
        self.editable.contains(field)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub kind: ApprovalKind,
    pub description: String,
    /// Tool the payload belongs to, used to re-classify edited payloads.
    pub tool: Option<String>,
    pub step_id: Option<String>,
    pub sensitivity: Sensitivity,
    pub payload: ApprovalPayload,
    /// Key for remembered decisions. `None` disables policy lookup and
    /// remembering for this request.
    pub signature: Option<ActionSignature>,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn new(kind: ApprovalKind, description: impl Into<String>, payload: ApprovalPayload) -> Self {
        Self {
            id: new_request_id(),
            kind,
            description: description.into(),
            tool: None,
            step_id: None,
            sensitivity: Sensitivity::Normal,
            payload,
            signature: None,
            created_at: Utc::now(),
        }
    }

    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn sensitivity(mut self, sensitivity: Sensitivity) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn signature(mut self, signature: ActionSignature) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Short label used in error messages and the audit trail.
    pub fn subject(&self) -> String {
        match (&self.step_id, &self.tool) {
            (Some(step), Some(tool)) => format!("step {step} ({tool})"),
            (Some(step), None) => format!("step {step}"),
            (None, Some(tool)) => tool.clone(),
            (None, None) => self.description.clone(),
        }
    }
}

pub(crate) fn new_request_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Approve,
    Deny { reason: String },
    Modify { fields: BTreeMap<String, Value> },
}

/// What an approver answered, plus whether to remember it.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerResponse {
    pub verdict: Verdict,
    pub remember: Option<RememberScope>,
}

impl BrokerResponse {
    pub fn approve() -> Self {
        Self {
            verdict: Verdict::Approve,
            remember: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Deny {
                reason: reason.into(),
            },
            remember: None,
        }
    }

    pub fn modify(fields: BTreeMap<String, Value>) -> Self {
        Self {
            verdict: Verdict::Modify { fields },
            remember: None,
        }
    }

    pub fn remember(mut self, scope: RememberScope) -> Self {
        self.remember = Some(scope);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalOutcome {
    pub request_id: String,
    pub resolution: Resolution,
    /// Final payload; differs from the request only after a modify verdict.
    pub payload: ApprovalPayload,
    pub reason: Option<String>,
    pub auto_resolved: bool,
    pub timed_out: bool,
}

impl ApprovalOutcome {
    pub fn is_approved(&self) -> bool {
        self.resolution.is_approved()
    }
}
