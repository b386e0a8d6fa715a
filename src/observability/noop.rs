use super::traits::{EventRecord, Observer};

/// Observer that discards everything
pub struct NoopObserver;

impl Observer for NoopObserver {
    #[inline(always)]
    fn record(&self, _record: &EventRecord) {}

    fn name(&self) -> &str {
        "noop"
    }
}
