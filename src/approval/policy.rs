use super::types::RememberScope;
use crate::error::{EngineError, Result};
use crate::plan::ToolParams;
use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use strum::Display;

/// Normalized key for remembered decisions: tool, action and target resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionSignature {
    pub tool: String,
    pub action: String,
    pub target: String,
}

impl ActionSignature {
    pub fn new(tool: &str, action: &str, target: Option<&str>) -> Self {
        Self {
            tool: tool.trim().to_ascii_lowercase(),
            action: action.trim().to_ascii_lowercase(),
            target: normalize_target(target.unwrap_or("")),
        }
    }

    pub fn from_params(params: &ToolParams) -> Self {
        Self::new(
            params.tool_name(),
            &params.action_name(),
            params.target().as_deref(),
        )
    }
}

impl std::fmt::Display for ActionSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.target.is_empty() {
            write!(f, "{}.{}", self.tool, self.action)
        } else {
            write!(f, "{}.{} {}", self.tool, self.action, self.target)
        }
    }
}

fn normalize_target(raw: &str) -> String {
    let unified = raw.trim().replace('\\', "/");
    let trimmed = unified.trim_end_matches('/');
    if trimmed.is_empty() && unified.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Decision {
    Approve,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub tool: String,
    pub action: String,
    /// `*` matches everything, a trailing `*` is a prefix match, anything
    /// else must equal the normalized target.
    pub pattern: String,
    pub decision: Decision,
    pub scope: RememberScope,
    pub recorded_at: String,
}

impl PolicyRecord {
    fn matches(&self, signature: &ActionSignature) -> bool {
        self.tool == signature.tool
            && (self.action == "*" || self.action == signature.action)
            && pattern_matches(&self.pattern, &signature.target)
    }

    fn same_key(&self, signature: &ActionSignature) -> bool {
        self.tool == signature.tool
            && self.action == signature.action
            && self.pattern == signature.target
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    decisions: Vec<PolicyRecord>,
}

/// Remembered approval decisions. Session records live in memory only;
/// persistent records are mirrored to a TOML file on every change.
#[derive(Debug)]
pub struct PolicyStore {
    session: RwLock<Vec<PolicyRecord>>,
    persistent: RwLock<Vec<PolicyRecord>>,
    store_path: Option<PathBuf>,
}

impl PolicyStore {
    /// Store without a backing file; persistent records last for the
    /// lifetime of the value.
    pub fn in_memory() -> Self {
        Self {
            session: RwLock::new(Vec::new()),
            persistent: RwLock::new(Vec::new()),
            store_path: None,
        }
    }

    pub fn load(store_path: &Path) -> Self {
        let file = match fs::read_to_string(store_path) {
            Ok(content) if content.trim().is_empty() => PolicyFile::default(),
            Ok(content) => toml::from_str(&content).unwrap_or_else(|error| {
                tracing::warn!(
                    path = %store_path.display(),
                    %error,
                    "failed to parse policy store; starting with no remembered decisions"
                );
                PolicyFile::default()
            }),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => PolicyFile::default(),
            Err(error) => {
                tracing::warn!(
                    path = %store_path.display(),
                    %error,
                    "failed to read policy store; starting with no remembered decisions"
                );
                PolicyFile::default()
            }
        };

        let persistent = file
            .decisions
            .into_iter()
            .filter(|record| record.scope == RememberScope::Persistent)
            .collect();

        Self {
            session: RwLock::new(Vec::new()),
            persistent: RwLock::new(persistent),
            store_path: Some(store_path.to_path_buf()),
        }
    }

    /// Most recent matching decision, session scope first.
    pub fn lookup(&self, signature: &ActionSignature) -> Option<PolicyRecord> {
        let session = self
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|record| record.matches(signature))
            .cloned();
        if session.is_some() {
            return session;
        }
        self.persistent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|record| record.matches(signature))
            .cloned()
    }

    pub fn remember(
        &self,
        signature: &ActionSignature,
        decision: Decision,
        scope: RememberScope,
    ) -> Result<()> {
        if signature.tool.is_empty() {
            return Err(EngineError::Policy("signature tool must not be empty".into()));
        }
        let record = PolicyRecord {
            tool: signature.tool.clone(),
            action: signature.action.clone(),
            pattern: signature.target.clone(),
            decision,
            scope,
            recorded_at: Utc::now().to_rfc3339(),
        };
        match scope {
            RememberScope::Session => {
                let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
                session.retain(|existing| !existing.same_key(signature));
                session.push(record);
                Ok(())
            }
            RememberScope::Persistent => self.update_persistent(|records| {
                records.retain(|existing| !existing.same_key(signature));
                records.push(record);
            }),
        }
    }

    /// Drop every remembered decision for `signature`. Returns whether any
    /// record was removed.
    pub fn forget(&self, signature: &ActionSignature) -> Result<bool> {
        let mut removed = false;
        {
            let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
            let before = session.len();
            session.retain(|existing| !existing.same_key(signature));
            removed |= session.len() != before;
        }
        let persisted = self
            .persistent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|existing| existing.same_key(signature));
        if persisted {
            self.update_persistent(|records| {
                records.retain(|existing| !existing.same_key(signature));
            })?;
            removed = true;
        }
        Ok(removed)
    }

    /// Drop session-scoped decisions. Called when a session ends.
    pub fn purge_session(&self) -> usize {
        let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
        let purged = session.len();
        session.clear();
        purged
    }

    pub fn clear_persistent(&self) -> Result<()> {
        self.update_persistent(Vec::clear)
    }

    pub fn records(&self) -> Vec<PolicyRecord> {
        let mut records = self
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        records.extend(
            self.persistent
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned(),
        );
        records
    }

    /// Apply `change` to a copy, persist it, then swap it in. A failed write
    /// leaves memory untouched.
    fn update_persistent(&self, change: impl FnOnce(&mut Vec<PolicyRecord>)) -> Result<()> {
        let mut records = self
            .persistent
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = records.clone();
        change(&mut next);
        if let Some(path) = &self.store_path {
            persist_policy_file(
                path,
                &PolicyFile {
                    decisions: next.clone(),
                },
            )
            .map_err(|error| EngineError::Policy(format!("{error:#}")))?;
        }
        *records = next;
        Ok(())
    }
}

fn pattern_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return value.starts_with(prefix);
    }
    pattern == value
}

fn persist_policy_file(path: &Path, data: &PolicyFile) -> anyhow::Result<()> {
    let content = toml::to_string(data).context("failed to serialize policy store")?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create policy store directory '{}'",
                parent.display()
            )
        })?;
    }

    fs::write(path, content)
        .with_context(|| format!("failed to write policy store '{}'", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions on '{}'", path.display()))?;
    }

    Ok(())
}
