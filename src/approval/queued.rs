use super::ApprovalBroker;
use super::types::{ApprovalRequest, BrokerResponse};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, oneshot};

type Slot = (ApprovalRequest, oneshot::Sender<BrokerResponse>);

#[derive(Default)]
struct Inner {
    slots: Mutex<HashMap<String, Slot>>,
    arrived: Notify,
}

/// Broker that parks each request until an outside caller answers it by id,
/// e.g. a dashboard polling [`QueuedApprovalBroker::pending`].
#[derive(Clone, Default)]
pub struct QueuedApprovalBroker {
    inner: Arc<Inner>,
}

/// Removes a parked request when the waiting side goes away unanswered.
struct SlotGuard {
    inner: Arc<Inner>,
    id: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl QueuedApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parked requests, oldest first.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<ApprovalRequest> = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|(request, _)| request.clone())
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        pending
    }

    pub fn resolve(&self, request_id: &str, response: BrokerResponse) -> anyhow::Result<()> {
        let slot = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(request_id);
        let Some((_, responder)) = slot else {
            anyhow::bail!("no pending approval request '{request_id}'");
        };
        responder
            .send(response)
            .map_err(|_| anyhow::anyhow!("approval request '{request_id}' is no longer awaited"))
    }

    /// Wait until at least one request is parked and return the oldest.
    pub async fn next_pending(&self) -> ApprovalRequest {
        loop {
            let arrived = self.inner.arrived.notified();
            if let Some(first) = self.pending().into_iter().next() {
                return first;
            }
            arrived.await;
        }
    }
}

impl ApprovalBroker for QueuedApprovalBroker {
    fn request_approval<'a>(
        &'a self,
        request: &'a ApprovalRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BrokerResponse>> + Send + 'a>> {
        Box::pin(async move {
            let (tx, rx) = oneshot::channel();
            self.inner
                .slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(request.id.clone(), (request.clone(), tx));
            let _guard = SlotGuard {
                inner: Arc::clone(&self.inner),
                id: request.id.clone(),
            };
            self.inner.arrived.notify_waiters();
            rx.await
                .map_err(|_| anyhow::anyhow!("approval request '{}' was dropped", request.id))
        })
    }
}
