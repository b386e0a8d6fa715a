use super::ApprovalBroker;
use super::guardrails;
use super::policy::{Decision, PolicyStore};
use super::types::{
    ApprovalKind, ApprovalOutcome, ApprovalPayload, ApprovalRequest, Resolution, Verdict,
    new_request_id,
};
use crate::config::ApprovalConfig;
use crate::error::Result;
use crate::observability::{EngineEvent, EventSink};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MiddlewareStats {
    pub total_requests: u64,
    pub auto_resolved: u64,
    pub approved: u64,
    pub denied: u64,
    pub modified: u64,
    pub timed_out: u64,
    pub escalations: u64,
    pub pending: usize,
}

/// One resolved request as kept in the bounded history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalRecord {
    pub request_id: String,
    pub kind: ApprovalKind,
    pub description: String,
    pub resolution: Resolution,
    pub reason: Option<String>,
    pub auto_resolved: bool,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Default)]
struct Ledger {
    stats: MiddlewareStats,
    history: VecDeque<ApprovalRecord>,
    pending: HashMap<String, ApprovalRequest>,
}

/// Gate between the engine and a human approver.
///
/// Every request first consults the remembered-decision store. Unresolved
/// requests are handed to the broker under a timeout; a timeout or broker
/// failure resolves as a denial. Approver edits are limited to editable
/// fields and re-classified, and an edit that raises the sensitivity is sent
/// back for a fresh approval that is neither auto-resolved nor remembered.
pub struct ApprovalMiddleware {
    broker: Arc<dyn ApprovalBroker>,
    policy: Arc<PolicyStore>,
    sink: Arc<EventSink>,
    timeout: Duration,
    max_escalations: u32,
    history_limit: usize,
    ledger: Mutex<Ledger>,
    cancel: Notify,
}

/// Takes a request off the pending list however its wait ends.
struct PendingGuard<'a> {
    middleware: &'a ApprovalMiddleware,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.middleware.ledger().pending.remove(&self.id);
    }
}

enum BrokerAnswer {
    Answered(super::BrokerResponse),
    TimedOut,
    Cancelled,
    Failed(String),
}

impl ApprovalMiddleware {
    pub fn new(
        broker: Arc<dyn ApprovalBroker>,
        policy: Arc<PolicyStore>,
        sink: Arc<EventSink>,
        config: &ApprovalConfig,
    ) -> Self {
        Self {
            broker,
            policy,
            sink,
            timeout: Duration::from_secs(config.timeout_secs),
            max_escalations: config.max_escalations,
            history_limit: config.history_limit,
            ledger: Mutex::new(Ledger::default()),
            cancel: Notify::new(),
        }
    }

    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.policy
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn request(&self, request: ApprovalRequest) -> Result<ApprovalOutcome> {
        self.ledger().stats.total_requests += 1;

        if let Some(signature) = &request.signature
            && let Some(record) = self.policy.lookup(signature)
        {
            let resolution = match record.decision {
                Decision::Approve => Resolution::Approved,
                Decision::Deny => Resolution::Denied,
            };
            tracing::debug!(request_id = %request.id, signature = %signature, "resolved from remembered decision");
            self.sink.emit(EngineEvent::ApprovalRequested {
                request_id: request.id.clone(),
                kind: request.kind,
                subject: request.subject(),
            });
            let outcome = ApprovalOutcome {
                request_id: request.id.clone(),
                resolution,
                payload: request.payload.clone(),
                reason: Some(format!("remembered {} decision", record.scope)),
                auto_resolved: true,
                timed_out: false,
            };
            self.finish(&request, &outcome);
            return Ok(outcome);
        }

        let mut current = request;
        let mut escalations = 0;
        loop {
            let answer = self.ask(&current).await;
            let response = match answer {
                BrokerAnswer::Answered(response) => response,
                BrokerAnswer::TimedOut => {
                    self.ledger().stats.timed_out += 1;
                    let outcome = self.denied(&current, "approval timed out", true);
                    self.finish(&current, &outcome);
                    return Ok(outcome);
                }
                BrokerAnswer::Cancelled => {
                    let outcome = self.denied(&current, "approval cancelled", false);
                    self.finish(&current, &outcome);
                    return Ok(outcome);
                }
                BrokerAnswer::Failed(message) => {
                    tracing::warn!(request_id = %current.id, error = %message, "approval broker failed, denying");
                    let outcome =
                        self.denied(&current, &format!("approval broker failed: {message}"), false);
                    self.finish(&current, &outcome);
                    return Ok(outcome);
                }
            };

            match response.verdict {
                Verdict::Approve => {
                    self.remember(&current, Decision::Approve, response.remember)?;
                    // An approved escalation still carries the reviewer's edits.
                    let resolution = if escalations > 0 {
                        Resolution::Modified
                    } else {
                        Resolution::Approved
                    };
                    let outcome = ApprovalOutcome {
                        request_id: current.id.clone(),
                        resolution,
                        payload: current.payload.clone(),
                        reason: None,
                        auto_resolved: false,
                        timed_out: false,
                    };
                    self.finish(&current, &outcome);
                    return Ok(outcome);
                }
                Verdict::Deny { reason } => {
                    self.remember(&current, Decision::Deny, response.remember)?;
                    let outcome = self.denied(&current, &reason, false);
                    self.finish(&current, &outcome);
                    return Ok(outcome);
                }
                Verdict::Modify { fields } => {
                    let payload = apply_edits(&current, &fields);
                    let reclassified = current
                        .tool
                        .as_deref()
                        .map_or(current.sensitivity, |tool| {
                            guardrails::classify(tool, &payload.fields)
                        });

                    if reclassified <= current.sensitivity {
                        let outcome = ApprovalOutcome {
                            request_id: current.id.clone(),
                            resolution: Resolution::Modified,
                            payload,
                            reason: None,
                            auto_resolved: false,
                            timed_out: false,
                        };
                        self.finish(&current, &outcome);
                        return Ok(outcome);
                    }

                    escalations += 1;
                    self.ledger().stats.escalations += 1;
                    let previous = current.id.clone();
                    tracing::info!(
                        request_id = %previous,
                        from = %current.sensitivity,
                        to = %reclassified,
                        "edited payload escalated, asking again"
                    );
                    if escalations > self.max_escalations {
                        let outcome =
                            self.denied(&current, "too many escalating edits", false);
                        self.finish(&current, &outcome);
                        return Ok(outcome);
                    }
                    let superseded = ApprovalOutcome {
                        request_id: previous,
                        resolution: Resolution::Denied,
                        payload: current.payload.clone(),
                        reason: Some("superseded by escalated edit".into()),
                        auto_resolved: false,
                        timed_out: false,
                    };
                    self.record_history(&current, &superseded);
                    current = ApprovalRequest {
                        id: new_request_id(),
                        sensitivity: reclassified,
                        payload,
                        signature: None,
                        created_at: Utc::now(),
                        ..current
                    };
                }
            }
        }
    }

    async fn ask(&self, request: &ApprovalRequest) -> BrokerAnswer {
        let cancelled = self.cancel.notified();
        self.ledger()
            .pending
            .insert(request.id.clone(), request.clone());
        let _guard = PendingGuard {
            middleware: self,
            id: request.id.clone(),
        };
        self.sink.emit(EngineEvent::ApprovalRequested {
            request_id: request.id.clone(),
            kind: request.kind,
            subject: request.subject(),
        });

        tokio::select! {
            answer = tokio::time::timeout(self.timeout, self.broker.request_approval(request)) => {
                match answer {
                    Ok(Ok(response)) => BrokerAnswer::Answered(response),
                    Ok(Err(error)) => BrokerAnswer::Failed(format!("{error:#}")),
                    Err(_) => BrokerAnswer::TimedOut,
                }
            }
            () = cancelled => BrokerAnswer::Cancelled,
        }
    }

    fn remember(
        &self,
        request: &ApprovalRequest,
        decision: Decision,
        scope: Option<super::RememberScope>,
    ) -> Result<()> {
        if let (Some(scope), Some(signature)) = (scope, &request.signature) {
            self.policy.remember(signature, decision, scope)?;
            tracing::info!(signature = %signature, decision = %decision, scope = %scope, "remembered approval decision");
        }
        Ok(())
    }

    fn denied(&self, request: &ApprovalRequest, reason: &str, timed_out: bool) -> ApprovalOutcome {
        ApprovalOutcome {
            request_id: request.id.clone(),
            resolution: Resolution::Denied,
            payload: request.payload.clone(),
            reason: Some(reason.to_string()),
            auto_resolved: false,
            timed_out,
        }
    }

    fn finish(&self, request: &ApprovalRequest, outcome: &ApprovalOutcome) {
        {
            let mut ledger = self.ledger();
            let stats = &mut ledger.stats;
            if outcome.auto_resolved {
                stats.auto_resolved += 1;
            } else {
                match outcome.resolution {
                    Resolution::Approved => stats.approved += 1,
                    Resolution::Denied => stats.denied += 1,
                    Resolution::Modified => stats.modified += 1,
                    Resolution::Pending => {}
                }
            }
        }
        self.record_history(request, outcome);
        self.sink.emit(EngineEvent::ApprovalResolved {
            request_id: outcome.request_id.clone(),
            resolution: outcome.resolution,
            auto_resolved: outcome.auto_resolved,
        });
    }

    fn record_history(&self, request: &ApprovalRequest, outcome: &ApprovalOutcome) {
        let mut ledger = self.ledger();
        ledger.history.push_back(ApprovalRecord {
            request_id: outcome.request_id.clone(),
            kind: request.kind,
            description: request.description.clone(),
            resolution: outcome.resolution,
            reason: outcome.reason.clone(),
            auto_resolved: outcome.auto_resolved,
            resolved_at: Utc::now(),
        });
        while ledger.history.len() > self.history_limit {
            ledger.history.pop_front();
        }
    }

    pub fn stats(&self) -> MiddlewareStats {
        let ledger = self.ledger();
        let mut stats = ledger.stats.clone();
        stats.pending = ledger.pending.len();
        stats
    }

    /// Resolved requests, oldest first, at most `history_limit` of them.
    pub fn history(&self) -> Vec<ApprovalRecord> {
        self.ledger().history.iter().cloned().collect()
    }

    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<ApprovalRequest> = self.ledger().pending.values().cloned().collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        pending
    }

    /// Resolve every outstanding request as denied. Returns how many were
    /// waiting.
    pub fn cancel_all_pending(&self) -> usize {
        let waiting = self.ledger().pending.len();
        self.cancel.notify_waiters();
        waiting
    }

    /// Drop session-scoped remembered decisions.
    pub fn end_session(&self) -> usize {
        let purged = self.policy.purge_session();
        tracing::info!(purged, "session ended, session approvals purged");
        purged
    }
}

fn apply_edits(request: &ApprovalRequest, edits: &BTreeMap<String, Value>) -> ApprovalPayload {
    let mut payload = request.payload.clone();
    for (name, value) in edits {
        if payload.is_editable(name) {
            payload.fields.insert(name.clone(), value.clone());
        } else {
            tracing::warn!(request_id = %request.id, field = %name, "ignored edit to non-editable field");
        }
    }
    payload
}
