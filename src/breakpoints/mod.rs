pub mod condition;

pub use condition::{Condition, ConditionContext, ConditionError};

use crate::engine::ExecutionState;
use crate::error::{EngineError, Result};
use crate::plan::Sensitivity;
use serde::{Deserialize, Serialize};
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BreakpointKind {
    BeforeTool,
    AfterTool,
    OnError,
    OnSensitive,
    Periodic { every: usize },
    Conditional,
    Manual,
}

impl BreakpointKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::BeforeTool => "before_tool",
            Self::AfterTool => "after_tool",
            Self::OnError => "on_error",
            Self::OnSensitive => "on_sensitive",
            Self::Periodic { .. } => "periodic",
            Self::Conditional => "conditional",
            Self::Manual => "manual",
        }
    }

    fn is_before_step(self) -> bool {
        !matches!(self, Self::AfterTool | Self::OnError)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FireMode {
    Once,
    #[default]
    Every,
}

/// What the engine does when a breakpoint fires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BreakpointAction {
    #[default]
    Pause,
    RequireApproval,
}

/// Caller-supplied description of a breakpoint to add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub kind: BreakpointKind,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub fire_mode: FireMode,
    #[serde(default)]
    pub action: BreakpointAction,
}

impl BreakpointSpec {
    pub fn new(kind: BreakpointKind) -> Self {
        Self {
            id: None,
            kind,
            tool: None,
            condition: None,
            fire_mode: FireMode::Every,
            action: BreakpointAction::Pause,
        }
    }

    pub fn before_tool() -> Self {
        Self::new(BreakpointKind::BeforeTool)
    }

    pub fn after_tool() -> Self {
        Self::new(BreakpointKind::AfterTool)
    }

    pub fn on_error() -> Self {
        Self::new(BreakpointKind::OnError)
    }

    pub fn on_sensitive() -> Self {
        Self::new(BreakpointKind::OnSensitive)
    }

    pub fn periodic(every: usize) -> Self {
        Self::new(BreakpointKind::Periodic { every })
    }

    pub fn conditional(condition: impl Into<String>) -> Self {
        Self::new(BreakpointKind::Conditional).when(condition)
    }

    pub fn manual() -> Self {
        Self::new(BreakpointKind::Manual)
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn once(mut self) -> Self {
        self.fire_mode = FireMode::Once;
        self
    }

    pub fn require_approval(mut self) -> Self {
        self.action = BreakpointAction::RequireApproval;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub id: String,
    pub kind: BreakpointKind,
    pub tool: Option<String>,
    pub condition: Option<String>,
    pub fire_mode: FireMode,
    pub action: BreakpointAction,
    pub enabled: bool,
    pub hit_count: u64,
    /// Manual breakpoints only fire while armed.
    pub armed: bool,
}

/// Engine transition at which breakpoints are evaluated.
#[derive(Debug, Clone, Copy)]
pub enum Checkpoint<'a> {
    BeforeStep {
        tool: &'a str,
        sensitivity: Sensitivity,
    },
    AfterStep {
        tool: &'a str,
        success: bool,
    },
}

impl Checkpoint<'_> {
    fn tool(&self) -> &str {
        match self {
            Self::BeforeStep { tool, .. } | Self::AfterStep { tool, .. } => tool,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointHit {
    pub id: String,
    pub kind: BreakpointKind,
    pub action: BreakpointAction,
    pub hit_count: u64,
    pub condition_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub hits: Vec<BreakpointHit>,
}

impl Evaluation {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// A condition error always pauses, whatever the configured action.
    pub fn should_pause(&self) -> bool {
        self.hits
            .iter()
            .any(|hit| hit.action == BreakpointAction::Pause || hit.condition_error.is_some())
    }

    pub fn requires_approval(&self) -> bool {
        self.hits
            .iter()
            .any(|hit| hit.action == BreakpointAction::RequireApproval)
    }

    pub fn condition_errors(&self) -> Vec<EngineError> {
        self.hits
            .iter()
            .filter_map(|hit| {
                hit.condition_error
                    .as_ref()
                    .map(|message| EngineError::BreakpointCondition {
                        id: hit.id.clone(),
                        message: message.clone(),
                    })
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct BreakpointManager {
    breakpoints: Vec<Breakpoint>,
    next_id: u64,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, spec: BreakpointSpec) -> Result<String> {
        if let BreakpointKind::Periodic { every: 0 } = spec.kind {
            return Err(EngineError::PlanInvalid(
                "periodic breakpoint interval must be at least 1".into(),
            ));
        }
        if spec.kind == BreakpointKind::Conditional
            && spec.condition.as_deref().is_none_or(|c| c.trim().is_empty())
        {
            return Err(EngineError::PlanInvalid(
                "conditional breakpoint requires a condition".into(),
            ));
        }
        let id = match spec.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                self.next_id += 1;
                format!("bp-{}", self.next_id)
            }
        };
        if self.breakpoints.iter().any(|bp| bp.id == id) {
            return Err(EngineError::PlanInvalid(format!(
                "breakpoint id '{id}' already exists"
            )));
        }
        self.breakpoints.push(Breakpoint {
            id: id.clone(),
            kind: spec.kind,
            tool: spec.tool,
            condition: spec.condition,
            fire_mode: spec.fire_mode,
            action: spec.action,
            enabled: true,
            hit_count: 0,
            armed: false,
        });
        Ok(id)
    }

    pub fn remove(&mut self, id: &str) -> Result<Breakpoint> {
        let index = self.position(id)?;
        Ok(self.breakpoints.remove(index))
    }

    pub fn list(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    pub fn get(&self, id: &str) -> Option<&Breakpoint> {
        self.breakpoints.iter().find(|bp| bp.id == id)
    }

    pub fn enable(&mut self, id: &str) -> Result<()> {
        let index = self.position(id)?;
        self.breakpoints[index].enabled = true;
        Ok(())
    }

    pub fn disable(&mut self, id: &str) -> Result<()> {
        let index = self.position(id)?;
        self.breakpoints[index].enabled = false;
        Ok(())
    }

    /// Arm a manual breakpoint so it fires at the next before-step check.
    pub fn arm(&mut self, id: &str) -> Result<()> {
        let index = self.position(id)?;
        self.breakpoints[index].armed = true;
        Ok(())
    }

    fn position(&self, id: &str) -> Result<usize> {
        self.breakpoints
            .iter()
            .position(|bp| bp.id == id)
            .ok_or_else(|| EngineError::BreakpointNotFound(id.to_string()))
    }

    /// Evaluate every enabled breakpoint at `checkpoint`. The state is only
    /// read; hit counters and once/armed flags are the only things updated.
    pub fn evaluate(&mut self, checkpoint: Checkpoint<'_>, state: &ExecutionState) -> Evaluation {
        let mut evaluation = Evaluation::default();
        for bp in &mut self.breakpoints {
            if !bp.enabled {
                continue;
            }
            if let Some(filter) = bp.tool.as_deref()
                && filter != checkpoint.tool()
            {
                continue;
            }
            if !kind_matches(bp, checkpoint, state) {
                continue;
            }

            let mut condition_error = None;
            if let Some(source) = bp.condition.as_deref() {
                let sensitivity = match checkpoint {
                    Checkpoint::BeforeStep { sensitivity, .. } => Some(sensitivity),
                    Checkpoint::AfterStep { .. } => None,
                };
                let ctx = ConditionContext {
                    state,
                    tool: Some(checkpoint.tool()),
                    sensitivity,
                };
                match Condition::parse(source).and_then(|c| c.evaluate(&ctx)) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(error) => {
                        tracing::warn!(breakpoint = %bp.id, error = %error, "breakpoint condition failed, pausing");
                        condition_error = Some(error.to_string());
                    }
                }
            }

            bp.hit_count += 1;
            bp.armed = false;
            if bp.fire_mode == FireMode::Once {
                bp.enabled = false;
            }
            evaluation.hits.push(BreakpointHit {
                id: bp.id.clone(),
                kind: bp.kind,
                action: bp.action,
                hit_count: bp.hit_count,
                condition_error,
            });
        }
        evaluation
    }

    pub fn clear(&mut self) {
        self.breakpoints.clear();
    }
}

fn kind_matches(bp: &Breakpoint, checkpoint: Checkpoint<'_>, state: &ExecutionState) -> bool {
    match checkpoint {
        Checkpoint::BeforeStep { sensitivity, .. } => {
            if !bp.kind.is_before_step() {
                return false;
            }
            match bp.kind {
                BreakpointKind::BeforeTool | BreakpointKind::Conditional => true,
                BreakpointKind::OnSensitive => sensitivity.requires_approval(),
                BreakpointKind::Periodic { every } => {
                    every > 0 && state.step_index > 0 && state.step_index % every == 0
                }
                BreakpointKind::Manual => bp.armed,
                BreakpointKind::AfterTool | BreakpointKind::OnError => false,
            }
        }
        Checkpoint::AfterStep { success, .. } => match bp.kind {
            BreakpointKind::AfterTool => true,
            BreakpointKind::OnError => !success,
            _ => false,
        },
    }
}
