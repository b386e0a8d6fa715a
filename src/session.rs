use crate::approval::{
    guardrails, ApprovalBroker, ApprovalKind, ApprovalMiddleware, ApprovalOutcome,
    ApprovalPayload, ApprovalRequest, AutoDenyBroker, MiddlewareStats, PolicyStore,
    WorkflowOutcome, WorkflowRunner,
};
use crate::breakpoints::{Breakpoint, BreakpointSpec};
use crate::config::Config;
use crate::engine::{EngineHandle, EngineStatus, ExecutionEngine, ExecutionState, RunOutcome};
use crate::error::Result;
use crate::feedback::{FeedbackFilter, FeedbackRecord, FeedbackRecorder, FeedbackSummary};
use crate::observability::{EventSink, Observer, create_observer};
use crate::plan::{Plan, PlanId, Planner, RetrySamePlanner};
use crate::snapshot::StateSnapshot;
use crate::tools::{DryRunInvoker, ToolInvoker};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Assembles a [`Session`]. Every collaborator has a safe default: dry-run
/// tools, a planner that retries unchanged, and a broker that denies.
pub struct SessionBuilder {
    config: Config,
    session_id: Option<String>,
    invoker: Option<Arc<dyn ToolInvoker>>,
    planner: Option<Arc<dyn Planner>>,
    broker: Option<Arc<dyn ApprovalBroker>>,
    observer: Option<Arc<dyn Observer>>,
    policy: Option<Arc<PolicyStore>>,
}

impl SessionBuilder {
    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn invoker(mut self, invoker: Arc<dyn ToolInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn ApprovalBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Share a decision store between sessions. Without one, the store is
    /// loaded from `policy.store_path`.
    pub fn policy(mut self, policy: Arc<PolicyStore>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<Session> {
        self.config.validate()?;
        let id = self
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let observer = self
            .observer
            .unwrap_or_else(|| create_observer(&self.config.observability));
        let sink = Arc::new(EventSink::new(id.clone(), observer));
        let policy = self.policy.unwrap_or_else(|| {
            Arc::new(PolicyStore::load(&self.config.policy.resolved_store_path()))
        });
        let broker = self.broker.unwrap_or_else(|| {
            Arc::new(AutoDenyBroker {
                reason: "no approval surface configured".to_string(),
            })
        });
        let approvals = Arc::new(ApprovalMiddleware::new(
            broker,
            policy,
            Arc::clone(&sink),
            &self.config.approval,
        ));
        let engine = ExecutionEngine::new(
            &self.config,
            self.invoker.unwrap_or_else(|| Arc::new(DryRunInvoker)),
            self.planner.unwrap_or_else(|| Arc::new(RetrySamePlanner)),
            Arc::clone(&approvals),
            sink,
        );

        tracing::info!(session = %id, "session created");
        Ok(Session {
            id: id.clone(),
            engine,
            workflows: WorkflowRunner::new(approvals),
            feedback: FeedbackRecorder::new(&self.config.feedback, id),
        })
    }
}

/// One supervised session: an engine, its approval workflows and a
/// feedback recorder, exposed under the operation names callers use.
pub struct Session {
    id: String,
    engine: ExecutionEngine,
    workflows: WorkflowRunner,
    feedback: FeedbackRecorder,
}

impl Session {
    pub fn builder(config: Config) -> SessionBuilder {
        SessionBuilder {
            config,
            session_id: None,
            invoker: None,
            planner: None,
            broker: None,
            observer: None,
            policy: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ExecutionEngine {
        &mut self.engine
    }

    pub fn handle(&self) -> EngineHandle {
        self.engine.handle()
    }

    pub fn status(&self) -> EngineStatus {
        self.engine.status()
    }

    pub fn state(&self) -> &ExecutionState {
        self.engine.state()
    }

    // ── Execution control ───────────────────────────────────────────

    pub async fn start(&mut self, plan: Plan) -> Result<RunOutcome> {
        self.engine.start(plan).await
    }

    pub fn pause(&mut self) -> Result<EngineStatus> {
        self.engine.pause()
    }

    pub async fn resume(&mut self) -> Result<RunOutcome> {
        self.engine.resume().await
    }

    pub fn abort(&mut self) -> Result<RunOutcome> {
        self.engine.abort()
    }

    // ── Breakpoints ─────────────────────────────────────────────────

    pub fn add_breakpoint(&mut self, spec: BreakpointSpec) -> Result<String> {
        self.engine.add_breakpoint(spec)
    }

    pub fn remove_breakpoint(&mut self, id: &str) -> Result<Breakpoint> {
        self.engine.remove_breakpoint(id)
    }

    pub fn list_breakpoints(&self) -> &[Breakpoint] {
        self.engine.list_breakpoints()
    }

    // ── Snapshots ───────────────────────────────────────────────────

    pub fn save_snapshot(&mut self, note: Option<String>) -> Result<StateSnapshot> {
        self.engine.save_snapshot(note)
    }

    pub fn get_state_history(&self) -> Vec<StateSnapshot> {
        self.engine.state_history()
    }

    pub fn rollback_to(&mut self, snapshot_id: &str) -> Result<StateSnapshot> {
        self.engine.rollback_to(snapshot_id)
    }

    pub fn rollback_steps(&mut self, n: usize) -> Result<StateSnapshot> {
        self.engine.rollback_steps(n)
    }

    pub async fn redirect(&mut self, instruction: &str) -> Result<PlanId> {
        self.engine.redirect(instruction).await
    }

    // ── Approvals ───────────────────────────────────────────────────

    pub fn define_approval_workflow(&self, name: &str, kinds: &[&str]) -> Result<()> {
        self.workflows.define(name, kinds).map(|_| ())
    }

    pub async fn run_approval_workflow(
        &self,
        name: &str,
        description: &str,
        payload: ApprovalPayload,
    ) -> Result<WorkflowOutcome> {
        self.workflows.run(name, description, payload).await
    }

    /// Show `params` for `action` to a reviewer who may edit the fields
    /// named in `editable_fields`. Reviews always reach the broker; no
    /// remembered decision answers them.
    pub async fn review_before_action(
        &self,
        action: &str,
        params: BTreeMap<String, Value>,
        editable_fields: &[&str],
    ) -> Result<ApprovalOutcome> {
        let sensitivity = guardrails::classify(action, &params);
        let description = guardrails::describe(action, &params);
        let payload = ApprovalPayload::new(params).editable(editable_fields.iter().copied());
        let request = ApprovalRequest::new(ApprovalKind::Review, description, payload)
            .tool(action)
            .sensitivity(sensitivity);
        self.engine.approvals().request(request).await
    }

    pub fn get_middleware_stats(&self) -> MiddlewareStats {
        self.engine.approvals().stats()
    }

    // ── Feedback ────────────────────────────────────────────────────

    pub fn submit_feedback(
        &self,
        rating: i64,
        comment: Option<String>,
        tool_name: Option<String>,
        tags: Vec<String>,
    ) -> FeedbackRecord {
        self.feedback.submit(rating, comment, tool_name, tags)
    }

    pub fn get_feedback_summary(&self, filter: &FeedbackFilter) -> FeedbackSummary {
        self.feedback.summary(filter)
    }

    pub fn workflows(&self) -> &WorkflowRunner {
        &self.workflows
    }

    pub fn feedback(&self) -> &FeedbackRecorder {
        &self.feedback
    }

    /// Abort anything unfinished and forget session-scoped approvals.
    pub fn end_session(&mut self) -> usize {
        self.engine.end_session()
    }
}
