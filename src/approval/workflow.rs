use super::middleware::ApprovalMiddleware;
use super::types::{ApprovalKind, ApprovalOutcome, ApprovalPayload, ApprovalRequest, Resolution};
use crate::error::{EngineError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

/// A named, ordered list of approval gates. Immutable once defined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalWorkflow {
    pub name: String,
    pub kinds: Vec<ApprovalKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateOutcome {
    pub kind: ApprovalKind,
    pub outcome: ApprovalOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowOutcome {
    pub workflow: String,
    /// `approved`, `modified` (some gate edited the payload) or `denied`.
    pub resolution: Resolution,
    /// Gates that were actually asked, in order. A denial ends the list.
    pub gates: Vec<GateOutcome>,
    pub payload: ApprovalPayload,
}

impl WorkflowOutcome {
    pub fn is_approved(&self) -> bool {
        self.resolution.is_approved()
    }
}

pub struct WorkflowRunner {
    middleware: Arc<ApprovalMiddleware>,
    workflows: RwLock<BTreeMap<String, ApprovalWorkflow>>,
}

impl WorkflowRunner {
    pub fn new(middleware: Arc<ApprovalMiddleware>) -> Self {
        Self {
            middleware,
            workflows: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn define(&self, name: &str, kinds: &[&str]) -> Result<ApprovalWorkflow> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::WorkflowDefinition(
                "workflow name cannot be empty".into(),
            ));
        }
        if kinds.is_empty() {
            return Err(EngineError::WorkflowDefinition(format!(
                "workflow '{name}' lists no approval types"
            )));
        }
        let kinds = kinds
            .iter()
            .map(|raw| {
                ApprovalKind::from_str(raw.trim()).map_err(|_| {
                    EngineError::WorkflowDefinition(format!(
                        "workflow '{name}': unknown approval type '{raw}'"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut workflows = self.workflows.write().unwrap_or_else(PoisonError::into_inner);
        if workflows.contains_key(name) {
            return Err(EngineError::WorkflowDefinition(format!(
                "workflow '{name}' is already defined"
            )));
        }
        let workflow = ApprovalWorkflow {
            name: name.to_string(),
            kinds,
        };
        workflows.insert(workflow.name.clone(), workflow.clone());
        tracing::info!(workflow = %workflow.name, gates = workflow.kinds.len(), "approval workflow defined");
        Ok(workflow)
    }

    pub fn get(&self, name: &str) -> Option<ApprovalWorkflow> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn list(&self) -> Vec<ApprovalWorkflow> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Ask each gate in order. The first denial ends the run and the whole
    /// workflow is denied; later gates are never asked.
    pub async fn run(
        &self,
        name: &str,
        description: &str,
        payload: ApprovalPayload,
    ) -> Result<WorkflowOutcome> {
        let workflow = self
            .get(name)
            .ok_or_else(|| EngineError::WorkflowNotFound(name.to_string()))?;

        let mut current = payload;
        let mut gates = Vec::with_capacity(workflow.kinds.len());
        let mut modified = false;
        for kind in &workflow.kinds {
            let request = ApprovalRequest::new(*kind, description, current.clone());
            let outcome = self.middleware.request(request).await?;
            let resolution = outcome.resolution;
            if resolution == Resolution::Modified {
                modified = true;
                current = outcome.payload.clone();
            }
            gates.push(GateOutcome {
                kind: *kind,
                outcome,
            });
            if !resolution.is_approved() {
                tracing::info!(workflow = %workflow.name, gate = %kind, "approval workflow denied");
                return Ok(WorkflowOutcome {
                    workflow: workflow.name,
                    resolution: Resolution::Denied,
                    gates,
                    payload: current,
                });
            }
        }

        Ok(WorkflowOutcome {
            workflow: workflow.name,
            resolution: if modified {
                Resolution::Modified
            } else {
                Resolution::Approved
            },
            gates,
            payload: current,
        })
    }
}
