pub mod audit;
pub mod log;
pub mod multi;
pub mod noop;
pub mod traits;

pub use self::log::LogObserver;
pub use audit::AuditTrail;
pub use multi::MultiObserver;
pub use noop::NoopObserver;
pub use traits::{EngineEvent, EventRecord, Observer};

use crate::config::ObservabilityConfig;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Factory: create the right observer from config
pub fn create_observer(config: &ObservabilityConfig) -> Arc<dyn Observer> {
    match config.backend.as_str() {
        "log" => Arc::new(LogObserver::new()),
        "audit" => Arc::new(AuditTrail::new()),
        "none" | "noop" => Arc::new(NoopObserver),
        _ => {
            tracing::warn!(
                "Unknown observability backend '{}', falling back to noop",
                config.backend
            );
            Arc::new(NoopObserver)
        }
    }
}

/// Stamps events with a per-session sequence number and timestamp before
/// handing them to the observer. Shared by the engine and the approval
/// middleware so both write into one ordered stream.
pub struct EventSink {
    session_id: String,
    seq: AtomicU64,
    observer: Arc<dyn Observer>,
}

impl EventSink {
    pub fn new(session_id: impl Into<String>, observer: Arc<dyn Observer>) -> Self {
        Self {
            session_id: session_id.into(),
            seq: AtomicU64::new(0),
            observer,
        }
    }

    pub fn emit(&self, event: EngineEvent) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.observer.record(&EventRecord {
            seq,
            at: Utc::now(),
            session_id: self.session_id.clone(),
            event,
        });
    }

    pub fn flush(&self) {
        self.observer.flush();
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn observer_name(&self) -> &str {
        self.observer.name()
    }
}
