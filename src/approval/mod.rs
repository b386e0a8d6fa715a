pub mod cli;
pub mod guardrails;
pub mod middleware;
pub mod policy;
pub mod queued;
pub mod types;
pub mod workflow;

pub use cli::CliApprovalBroker;
pub use middleware::{ApprovalMiddleware, ApprovalRecord, MiddlewareStats};
pub use policy::{ActionSignature, Decision, PolicyRecord, PolicyStore};
pub use queued::QueuedApprovalBroker;
pub use types::{
    ApprovalKind, ApprovalOutcome, ApprovalPayload, ApprovalRequest, BrokerResponse,
    RememberScope, Resolution, Verdict,
};
pub use workflow::{ApprovalWorkflow, GateOutcome, WorkflowOutcome, WorkflowRunner};

use std::future::Future;
use std::pin::Pin;

/// Surface that shows a request to a human and returns their answer.
pub trait ApprovalBroker: Send + Sync {
    fn request_approval<'a>(
        &'a self,
        request: &'a ApprovalRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BrokerResponse>> + Send + 'a>>;
}

pub struct AutoApproveBroker;

impl ApprovalBroker for AutoApproveBroker {
    fn request_approval<'a>(
        &'a self,
        _request: &'a ApprovalRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BrokerResponse>> + Send + 'a>> {
        Box::pin(async move { Ok(BrokerResponse::approve()) })
    }
}

pub struct AutoDenyBroker {
    pub reason: String,
}

impl ApprovalBroker for AutoDenyBroker {
    fn request_approval<'a>(
        &'a self,
        _request: &'a ApprovalRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<BrokerResponse>> + Send + 'a>> {
        Box::pin(async move { Ok(BrokerResponse::deny(self.reason.clone())) })
    }
}
