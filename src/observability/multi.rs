use super::traits::{EventRecord, Observer};
use std::sync::Arc;

/// Fan-out to several observers in registration order
pub struct MultiObserver {
    observers: Vec<Arc<dyn Observer>>,
}

impl MultiObserver {
    pub fn new(observers: Vec<Arc<dyn Observer>>) -> Self {
        Self { observers }
    }
}

impl Observer for MultiObserver {
    fn record(&self, record: &EventRecord) {
        for observer in &self.observers {
            observer.record(record);
        }
    }

    fn flush(&self) {
        for observer in &self.observers {
            observer.flush();
        }
    }

    fn name(&self) -> &str {
        "multi"
    }
}
