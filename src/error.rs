use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error taxonomy for the execution engine.
///
/// Callers match on these to decide recovery. Only [`EngineError::ToolExecution`]
/// is recovered locally (retry with a revised step); every other kind is
/// surfaced to the caller unchanged.
#[derive(Debug, Error)]
pub enum EngineError {
    // ── Plan ─────────────────────────────────────────────────────────────
    #[error("plan invalid: {0}")]
    PlanInvalid(String),

    #[error("planner failed: {0}")]
    Planner(String),

    // ── Tools ────────────────────────────────────────────────────────────
    #[error("tool {tool} failed at step {step_id} after {attempts} attempt(s): {message}")]
    ToolExecution {
        step_id: String,
        tool: String,
        attempts: u32,
        message: String,
    },

    // ── Approvals ────────────────────────────────────────────────────────
    #[error("approval denied for {subject}: {reason}")]
    ApprovalDenied { subject: String, reason: String },

    #[error("approval for {subject} timed out after {waited_secs}s")]
    ApprovalTimeout { subject: String, waited_secs: u64 },

    #[error("workflow definition rejected: {0}")]
    WorkflowDefinition(String),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    // ── Breakpoints ──────────────────────────────────────────────────────
    #[error("breakpoint {id} condition error: {message}")]
    BreakpointCondition { id: String, message: String },

    #[error("breakpoint not found: {0}")]
    BreakpointNotFound(String),

    // ── Snapshots ────────────────────────────────────────────────────────
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("rollback conflict: {0}")]
    RollbackConflict(String),

    // ── Engine state machine ────────────────────────────────────────────
    #[error("cannot {operation} while engine is {from}")]
    InvalidTransition {
        from: String,
        operation: &'static str,
    },

    // ── Config / persistence ────────────────────────────────────────────
    #[error("config: {0}")]
    Config(String),

    #[error("policy store: {0}")]
    Policy(String),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether the engine may attempt local recovery (retry/fallback).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ToolExecution { .. })
    }

    pub(crate) fn invalid_transition(
        from: impl std::fmt::Display,
        operation: &'static str,
    ) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            operation,
        }
    }
}

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
