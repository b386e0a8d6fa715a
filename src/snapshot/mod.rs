use crate::engine::ExecutionState;
use crate::error::{EngineError, Result};
use crate::plan::PlanId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SnapshotOrigin {
    /// Taken when a plan starts, before any step ran.
    Initial,
    /// Taken after a step succeeded.
    Auto,
    /// Requested by a caller through `save_snapshot`.
    Manual,
}

/// Point-in-time copy of the execution state.
///
/// The state is held as serialized JSON text, so later mutation of the live
/// state can never reach into a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub id: String,
    pub seq: u64,
    /// Index of the next step to run when the snapshot was taken.
    pub step_index: usize,
    pub plan_version: PlanId,
    pub state_json: String,
    pub taken_at: DateTime<Utc>,
    pub note: Option<String>,
    pub origin: SnapshotOrigin,
}

impl StateSnapshot {
    pub fn restore(&self) -> Result<ExecutionState> {
        ExecutionState::from_json(&self.state_json).map_err(|error| {
            EngineError::Other(error.context(format!("snapshot {} is unreadable", self.id)))
        })
    }
}

#[derive(Debug, Default)]
struct Inner {
    snapshots: Vec<StateSnapshot>,
    /// Ids dropped by a rollback. Never reissued.
    discarded: BTreeSet<String>,
    next_seq: u64,
}

/// Append-ordered log of snapshots, shared between the engine (the only
/// writer) and any number of readers.
#[derive(Debug, Clone, Default)]
pub struct SnapshotStore {
    inner: Arc<RwLock<Inner>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(
        &self,
        state: &ExecutionState,
        origin: SnapshotOrigin,
        note: Option<String>,
    ) -> Result<StateSnapshot> {
        let state_json = state.to_json()?;
        let mut inner = self.write();
        inner.next_seq += 1;
        let seq = inner.next_seq;
        let snapshot = StateSnapshot {
            id: format!("snap-{seq}"),
            seq,
            step_index: state.step_index,
            plan_version: state.plan_version,
            state_json,
            taken_at: Utc::now(),
            note,
            origin,
        };
        inner.snapshots.push(snapshot.clone());
        tracing::debug!(snapshot = %snapshot.id, step_index = snapshot.step_index, origin = %origin, "snapshot appended");
        Ok(snapshot)
    }

    /// Look up a live snapshot. A discarded id is a [`EngineError::RollbackConflict`].
    pub fn get(&self, id: &str) -> Result<StateSnapshot> {
        let inner = self.read();
        if let Some(snapshot) = inner.snapshots.iter().find(|s| s.id == id) {
            return Ok(snapshot.clone());
        }
        if inner.discarded.contains(id) {
            return Err(EngineError::RollbackConflict(format!(
                "snapshot {id} was discarded by an earlier rollback"
            )));
        }
        Err(EngineError::SnapshotNotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<StateSnapshot> {
        self.read().snapshots.clone()
    }

    pub fn latest(&self) -> Option<StateSnapshot> {
        self.read().snapshots.last().cloned()
    }

    pub fn len(&self) -> usize {
        self.read().snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().snapshots.is_empty()
    }

    /// Snapshot `n` positions before the latest one; `0` is the latest.
    pub fn nth_back(&self, n: usize) -> Result<StateSnapshot> {
        let inner = self.read();
        inner
            .snapshots
            .len()
            .checked_sub(n + 1)
            .and_then(|index| inner.snapshots.get(index))
            .cloned()
            .ok_or_else(|| {
                EngineError::SnapshotNotFound(format!(
                    "no snapshot {n} position(s) back ({} stored)",
                    inner.snapshots.len()
                ))
            })
    }

    /// Drop every snapshot after `id` and return them, oldest first.
    pub fn truncate_after(&self, id: &str) -> Result<Vec<StateSnapshot>> {
        let mut inner = self.write();
        let Some(position) = inner.snapshots.iter().position(|s| s.id == id) else {
            return Err(if inner.discarded.contains(id) {
                EngineError::RollbackConflict(format!(
                    "snapshot {id} was discarded by an earlier rollback"
                ))
            } else {
                EngineError::SnapshotNotFound(id.to_string())
            });
        };
        let tail = inner.snapshots.split_off(position + 1);
        for snapshot in &tail {
            inner.discarded.insert(snapshot.id.clone());
        }
        Ok(tail)
    }

    /// Forget everything, including discarded ids. Sequence numbers keep
    /// counting so ids stay unique for the lifetime of the store.
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.snapshots.clear();
        inner.discarded.clear();
    }
}
