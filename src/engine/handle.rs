use super::state::EngineStatus;
use crate::tools::CancelSignal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Notify, watch};

struct Inner {
    status: RwLock<EngineStatus>,
    pause_requested: AtomicBool,
    abort: watch::Sender<bool>,
    interrupt: Notify,
}

/// Cloneable view of a running engine for other tasks: read the status and
/// ask for a pause or an abort. Requests take effect at the engine's next
/// checkpoint; an abort also cancels in-flight tool calls.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<Inner>,
}

impl EngineHandle {
    pub(crate) fn new() -> Self {
        let (abort, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                status: RwLock::new(EngineStatus::Idle),
                pause_requested: AtomicBool::new(false),
                abort,
                interrupt: Notify::new(),
            }),
        }
    }

    pub fn status(&self) -> EngineStatus {
        *self
            .inner
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pause(&self) {
        self.inner.pause_requested.store(true, Ordering::SeqCst);
        self.inner.interrupt.notify_waiters();
    }

    pub fn abort(&self) {
        self.inner.abort.send_replace(true);
        self.inner.interrupt.notify_waiters();
    }

    pub fn is_pause_requested(&self) -> bool {
        self.inner.pause_requested.load(Ordering::SeqCst)
    }

    pub fn is_abort_requested(&self) -> bool {
        *self.inner.abort.borrow()
    }

    pub(crate) fn set_status(&self, status: EngineStatus) {
        *self
            .inner
            .status
            .write()
            .unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// Consume a pending pause request.
    pub(crate) fn take_pause(&self) -> bool {
        self.inner.pause_requested.swap(false, Ordering::SeqCst)
    }

    /// Clear both requests before a new run.
    pub(crate) fn reset(&self) {
        self.inner.pause_requested.store(false, Ordering::SeqCst);
        self.inner.abort.send_replace(false);
    }

    pub(crate) fn cancel_signal(&self) -> CancelSignal {
        CancelSignal::new(self.inner.abort.subscribe())
    }

    /// Resolves once a pause or an abort has been requested.
    pub(crate) async fn interrupted(&self) {
        loop {
            let notified = self.inner.interrupt.notified();
            if self.is_pause_requested() || self.is_abort_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once an abort has been requested. Pauses are ignored.
    pub(crate) async fn aborted(&self) {
        self.cancel_signal().cancelled().await;
    }
}
