use super::traits::{EngineEvent, EventRecord, Observer};
use std::sync::{Arc, Mutex, PoisonError};

/// In-memory audit trail. Clones share the same buffer, so a reader can keep
/// one clone while the engine writes through another.
#[derive(Clone, Default)]
pub struct AuditTrail {
    records: Arc<Mutex<Vec<EventRecord>>>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|record| record.event.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// JSON lines, one record per line.
    pub fn to_jsonl(&self) -> anyhow::Result<String> {
        let mut out = String::new();
        for record in self.records() {
            out.push_str(&serde_json::to_string(&record)?);
            out.push('\n');
        }
        Ok(out)
    }
}

impl Observer for AuditTrail {
    fn record(&self, record: &EventRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }

    fn name(&self) -> &str {
        "audit"
    }
}
