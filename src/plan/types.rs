use super::params::ToolParams;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::Range;
use strum::{Display, EnumString};

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Sensitivity {
    #[default]
    Normal,
    Sensitive,
    Destructive,
}

impl Sensitivity {
    pub fn requires_approval(self) -> bool {
        self >= Self::Sensitive
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Forward-only lifecycle. Rollback resets statuses wholesale and never
    /// goes through this check.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::Skipped)
                | (Self::Running, Self::Succeeded | Self::Failed | Self::Skipped)
        )
    }

    pub fn is_settled(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub params: ToolParams,
    #[serde(default)]
    pub sensitivity: Sensitivity,
    #[serde(default)]
    pub join_group: Option<String>,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub output_var: Option<String>,
}

impl Step {
    pub fn new(id: impl Into<String>, params: ToolParams) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            params,
            sensitivity: Sensitivity::Normal,
            join_group: None,
            mandatory: false,
            output_var: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn sensitivity(mut self, sensitivity: Sensitivity) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn join(mut self, group: impl Into<String>) -> Self {
        self.join_group = Some(group.into());
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn output_var(mut self, key: impl Into<String>) -> Self {
        self.output_var = Some(key.into());
        self
    }

    pub fn tool_name(&self) -> &'static str {
        self.params.tool_name()
    }
}

/// Index of a plan version inside a [`super::PlanArena`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PlanId(pub usize);

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub id: PlanId,
    #[serde(default)]
    pub instruction: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub parent: Option<PlanId>,
}

impl Plan {
    pub fn new(instruction: impl Into<String>, steps: Vec<Step>) -> Result<Self> {
        let plan = Self {
            id: PlanId::default(),
            instruction: instruction.into(),
            steps,
            parent: None,
        };
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(EngineError::PlanInvalid("plan has no steps".into()));
        }

        let mut ids = BTreeSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(EngineError::PlanInvalid("step id cannot be empty".into()));
            }
            if !ids.insert(step.id.as_str()) {
                return Err(EngineError::PlanInvalid(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
            step.params.validate().map_err(|error| match error {
                EngineError::PlanInvalid(message) => {
                    EngineError::PlanInvalid(format!("step {}: {message}", step.id))
                }
                other => other,
            })?;
        }

        self.validate_join_groups()
    }

    fn validate_join_groups(&self) -> Result<()> {
        let mut closed = BTreeSet::new();
        let mut index = 0;
        while index < self.steps.len() {
            let Some(group) = self.steps[index].join_group.as_deref() else {
                index += 1;
                continue;
            };
            if closed.contains(group) {
                return Err(EngineError::PlanInvalid(format!(
                    "join group '{group}' is not contiguous"
                )));
            }
            let span = self.join_span(index);
            if span.len() < 2 {
                return Err(EngineError::PlanInvalid(format!(
                    "join group '{group}' needs at least two steps"
                )));
            }
            closed.insert(group);
            index = span.end;
        }
        Ok(())
    }

    /// Contiguous range of steps sharing the join group of `index`. A step
    /// outside any group yields a range of one.
    pub fn join_span(&self, index: usize) -> Range<usize> {
        let Some(group) = self.steps.get(index).and_then(|s| s.join_group.as_deref()) else {
            return index..index + 1;
        };
        let same = |i: &usize| self.steps[*i].join_group.as_deref() == Some(group);
        let start = (0..=index).rev().take_while(same).last().unwrap_or(index);
        let end = (index..self.steps.len())
            .take_while(same)
            .last()
            .map_or(index + 1, |last| last + 1);
        start..end
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
