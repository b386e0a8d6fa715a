use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration, read from `~/.helmsman/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub approval: ApprovalConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub feedback: FeedbackConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ── Engine ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Revised attempts allowed after the first failure of a step.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// How long an abort waits for in-flight join-group calls to wind down.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    #[serde(default = "default_true")]
    pub snapshot_on_start: bool,
}

fn default_max_retries() -> u32 {
    2
}

fn default_cancel_grace_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            cancel_grace_ms: default_cancel_grace_ms(),
            snapshot_on_start: true,
        }
    }
}

// ── Approval ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Steps classified `normal` pass without prompting.
    #[serde(default = "default_true")]
    pub auto_approve_normal: bool,

    /// Upper bound on re-prompts caused by escalating edits.
    #[serde(default = "default_max_escalations")]
    pub max_escalations: u32,

    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_escalations() -> u32 {
    3
}

fn default_history_limit() -> usize {
    50
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            auto_approve_normal: true,
            max_escalations: default_max_escalations(),
            history_limit: default_history_limit(),
        }
    }
}

// ── Remembered decisions ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_store_path")]
    pub store_path: String,
}

fn default_store_path() -> String {
    "~/.helmsman/policies.toml".into()
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
        }
    }
}

impl PolicyConfig {
    pub fn resolved_store_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.store_path).into_owned())
    }
}

// ── Feedback ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    #[serde(default = "default_min_rating")]
    pub min_rating: u8,

    #[serde(default = "default_max_rating")]
    pub max_rating: u8,

    /// Optional append-only JSONL journal.
    #[serde(default)]
    pub journal_path: Option<String>,
}

fn default_min_rating() -> u8 {
    1
}

fn default_max_rating() -> u8 {
    5
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            min_rating: default_min_rating(),
            max_rating: default_max_rating(),
            journal_path: None,
        }
    }
}

impl FeedbackConfig {
    pub fn resolved_journal_path(&self) -> Option<PathBuf> {
        self.journal_path
            .as_deref()
            .map(|path| PathBuf::from(shellexpand::tilde(path).into_owned()))
    }
}

// ── Observability ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// "none" | "noop" | "log" | "audit"
    #[serde(default = "default_backend")]
    pub backend: String,
}

fn default_backend() -> String {
    "log".into()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.approval.timeout_secs == 0 {
            return Err(EngineError::Config(
                "approval.timeout_secs must be greater than zero".into(),
            ));
        }
        if self.approval.max_escalations == 0 {
            return Err(EngineError::Config(
                "approval.max_escalations must be at least 1".into(),
            ));
        }
        if self.feedback.min_rating >= self.feedback.max_rating {
            return Err(EngineError::Config(format!(
                "feedback.min_rating ({}) must be below feedback.max_rating ({})",
                self.feedback.min_rating, self.feedback.max_rating
            )));
        }
        Ok(())
    }
}
