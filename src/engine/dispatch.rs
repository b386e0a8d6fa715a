use super::report::{RetryRecord, RunOutcome};
use super::state::{EngineStatus, HistoryEntry};
use super::ExecutionEngine;
use crate::approval::{
    guardrails, ActionSignature, ApprovalKind, ApprovalPayload, ApprovalRequest, Resolution,
};
use crate::breakpoints::Checkpoint;
use crate::error::{EngineError, Result};
use crate::observability::EngineEvent;
use crate::plan::{Sensitivity, Step, StepStatus, ToolParams};
use crate::snapshot::SnapshotOrigin;
use crate::tools::ToolResult;
use std::sync::Arc;

/// What the driving loop does after one step or join group.
pub(super) enum Flow {
    Continue,
    Stop(RunOutcome),
}

/// Where the engine is inside the step at `index`.
pub(super) struct Progress {
    pub index: usize,
    /// A breakpoint asked for an approval gate, per member.
    pub force_approval: Vec<bool>,
    /// Retry bookkeeping of a sequential step.
    pub attempt: Option<Attempt>,
}

pub(super) struct Attempt {
    pub number: u32,
    pub params: ToolParams,
    pub sensitivity: Sensitivity,
    pub approved: bool,
}

pub(super) enum Gate {
    Approved(ToolParams),
    Denied(EngineError),
    Interrupted,
}

enum Invocation {
    Done(anyhow::Result<ToolResult>),
    Cancelled,
}

impl ExecutionEngine {
    pub(super) fn params_for(&self, index: usize, step: &Step) -> ToolParams {
        self.state
            .overrides
            .get(&index)
            .cloned()
            .unwrap_or_else(|| step.params.clone())
    }

    pub(super) fn needs_approval(&self, sensitivity: Sensitivity) -> bool {
        sensitivity.requires_approval() || !self.auto_approve_normal
    }

    pub(super) async fn run_step(&mut self, index: usize, step: &Step) -> Result<Flow> {
        let mut progress = match self.progress.take() {
            Some(progress) if progress.index == index => progress,
            _ => {
                let params = self.params_for(index, step);
                let sensitivity = guardrails::effective_sensitivity(step.sensitivity, &params);
                let evaluation = self.breakpoints.evaluate(
                    Checkpoint::BeforeStep {
                        tool: params.tool_name(),
                        sensitivity,
                    },
                    &self.state,
                );
                self.report_hits(&evaluation, index);
                let progress = Progress {
                    index,
                    force_approval: vec![evaluation.requires_approval()],
                    attempt: Some(Attempt {
                        number: 1,
                        params,
                        sensitivity,
                        approved: false,
                    }),
                };
                if evaluation.should_pause() {
                    self.progress = Some(progress);
                    return Ok(Flow::Stop(self.pause_at(evaluation.condition_errors())));
                }
                progress
            }
        };

        let mut attempt = progress.attempt.take().unwrap_or_else(|| {
            let params = self.params_for(index, step);
            Attempt {
                number: 1,
                sensitivity: guardrails::effective_sensitivity(step.sensitivity, &params),
                params,
                approved: false,
            }
        });

        loop {
            let forced = progress.force_approval.first().copied().unwrap_or(false);
            if !attempt.approved && (forced || self.needs_approval(attempt.sensitivity)) {
                match self
                    .gate(index, step, &attempt.params, attempt.sensitivity, forced, true)
                    .await?
                {
                    Gate::Approved(params) => {
                        attempt.sensitivity = attempt
                            .sensitivity
                            .max(guardrails::effective_sensitivity(step.sensitivity, &params));
                        attempt.params = params;
                        attempt.approved = true;
                        progress.force_approval = vec![false];
                    }
                    Gate::Denied(error) => return Ok(self.skip_or_fail(index, step, error)),
                    Gate::Interrupted => {
                        if self.handle.is_abort_requested() {
                            return Ok(Flow::Stop(self.finish_aborted()));
                        }
                        self.handle.take_pause();
                        progress.attempt = Some(attempt);
                        self.progress = Some(progress);
                        tracing::info!(step = %step.id, "paused while waiting for approval");
                        return Ok(Flow::Stop(self.outcome(Vec::new())));
                    }
                }
            }

            let tool = attempt.params.tool_name();
            if self.state.status_of(index) == Some(StepStatus::Pending) {
                self.state.set_status(index, StepStatus::Running);
            }
            self.sink.emit(EngineEvent::StepStarted {
                step_id: step.id.clone(),
                tool: tool.to_string(),
                attempt: attempt.number,
            });
            tracing::info!(step = %step.id, tool, attempt = attempt.number, "invoking tool");
            let invocation = self.invoke(&attempt.params).await;
            self.state.record_usage(tool);

            let error = match invocation {
                Invocation::Done(Ok(result)) if result.success => {
                    self.commit_success(index, step, tool, result)?;
                    let evaluation = self.breakpoints.evaluate(
                        Checkpoint::AfterStep {
                            tool,
                            success: true,
                        },
                        &self.state,
                    );
                    self.report_hits(&evaluation, index);
                    if evaluation.should_pause() {
                        return Ok(Flow::Stop(self.pause_at(evaluation.condition_errors())));
                    }
                    return Ok(Flow::Continue);
                }
                Invocation::Done(Ok(result)) => result.failure_text(),
                Invocation::Done(Err(error)) => format!("{error:#}"),
                Invocation::Cancelled => {
                    self.cancel_step(index, step, tool);
                    return Ok(Flow::Stop(self.finish_aborted()));
                }
            };
            if self.handle.is_abort_requested() {
                self.cancel_step(index, step, tool);
                return Ok(Flow::Stop(self.finish_aborted()));
            }

            self.record_failure(step, tool, attempt.number, &error);
            let evaluation = self.breakpoints.evaluate(
                Checkpoint::AfterStep {
                    tool,
                    success: false,
                },
                &self.state,
            );
            self.report_hits(&evaluation, index);

            if attempt.number > self.config.max_retries {
                self.state.set_status(index, StepStatus::Failed);
                let chain = self
                    .journal
                    .retries
                    .iter()
                    .filter(|record| record.step_id == step.id)
                    .map(|record| format!("attempt {}: {}", record.attempt, record.error))
                    .collect::<Vec<_>>()
                    .join("; ");
                return Ok(Flow::Stop(self.fail(EngineError::ToolExecution {
                    step_id: step.id.clone(),
                    tool: tool.to_string(),
                    attempts: attempt.number,
                    message: chain,
                })));
            }

            attempt = self.revise(index, step, attempt, &error).await;
            if evaluation.should_pause() {
                progress.attempt = Some(attempt);
                self.progress = Some(progress);
                return Ok(Flow::Stop(self.pause_at(evaluation.condition_errors())));
            }
        }
    }

    /// Ask the planner for an alternate approach to a failed step. A planner
    /// failure or an invalid revision retries the same parameters.
    async fn revise(&mut self, index: usize, step: &Step, attempt: Attempt, error: &str) -> Attempt {
        let failed = Step {
            params: attempt.params.clone(),
            ..step.clone()
        };
        let planner = Arc::clone(&self.planner);
        let answer = planner.revise_step(&failed, error, &self.state).await;
        let revised = match answer {
            Ok(revised) => match revised.params.validate() {
                Ok(()) => revised,
                Err(invalid) => {
                    tracing::warn!(step = %step.id, error = %invalid, "planner revision rejected, retrying unchanged");
                    failed
                }
            },
            Err(planner_error) => {
                tracing::warn!(step = %step.id, error = %planner_error, "planner could not revise step, retrying unchanged");
                failed
            }
        };

        let changed = revised.params != attempt.params;
        let sensitivity = guardrails::effective_sensitivity(
            step.sensitivity.max(revised.sensitivity),
            &revised.params,
        );
        let escalated = sensitivity > attempt.sensitivity;
        if changed {
            self.state.overrides.insert(index, revised.params.clone());
        }
        let next = Attempt {
            number: attempt.number + 1,
            params: revised.params,
            sensitivity: sensitivity.max(attempt.sensitivity),
            approved: attempt.approved && !escalated,
        };
        tracing::info!(step = %step.id, attempt = next.number, revised = changed, escalated, "retrying step");
        self.sink.emit(EngineEvent::RetryScheduled {
            step_id: step.id.clone(),
            attempt: next.number,
            revised: changed,
        });
        next
    }

    /// Put `params` in front of the approval middleware. Pausable gates give
    /// way to pause and abort requests; the others only to aborts.
    pub(super) async fn gate(
        &mut self,
        index: usize,
        step: &Step,
        params: &ToolParams,
        sensitivity: Sensitivity,
        forced: bool,
        pausable: bool,
    ) -> Result<Gate> {
        let request = approval_request(step, params, sensitivity, forced);
        let request_id = request.id.clone();
        let subject = request.subject();
        self.transition(EngineStatus::WaitingApproval);

        let approvals = Arc::clone(&self.approvals);
        let handle = self.handle.clone();
        let interrupted = async {
            if pausable {
                handle.interrupted().await;
            } else {
                handle.aborted().await;
            }
        };
        let answered = tokio::select! {
            outcome = approvals.request(request) => Some(outcome),
            () = interrupted => None,
        };
        let Some(outcome) = answered else {
            tracing::info!(request_id = %request_id, "approval discarded");
            self.sink.emit(EngineEvent::ApprovalDiscarded { request_id });
            return Ok(Gate::Interrupted);
        };
        let outcome = outcome?;

        if !outcome.is_approved() {
            let error = if outcome.timed_out {
                EngineError::ApprovalTimeout {
                    subject,
                    waited_secs: self.approvals.timeout().as_secs(),
                }
            } else {
                EngineError::ApprovalDenied {
                    subject,
                    reason: outcome.reason.unwrap_or_else(|| "denied".to_string()),
                }
            };
            return Ok(Gate::Denied(error));
        }

        let params = if outcome.resolution == Resolution::Modified {
            match params.with_fields(&outcome.payload.fields) {
                Ok(edited) => {
                    self.state.overrides.insert(index, edited.clone());
                    edited
                }
                Err(invalid) => {
                    return Ok(Gate::Denied(EngineError::ApprovalDenied {
                        subject,
                        reason: format!("edited parameters rejected: {invalid}"),
                    }));
                }
            }
        } else {
            params.clone()
        };
        self.transition(EngineStatus::Running);
        Ok(Gate::Approved(params))
    }

    /// A denied step is skipped unless it is mandatory, in which case the
    /// plan fails.
    fn skip_or_fail(&mut self, index: usize, step: &Step, error: EngineError) -> Flow {
        self.progress = None;
        self.state.set_status(index, StepStatus::Skipped);
        if step.mandatory {
            return Flow::Stop(self.fail(error));
        }
        tracing::info!(step = %step.id, reason = %error, "step skipped");
        self.sink.emit(EngineEvent::StepSkipped {
            step_id: step.id.clone(),
            reason: error.to_string(),
        });
        self.state.step_index = index + 1;
        self.transition(EngineStatus::Running);
        Flow::Continue
    }

    async fn invoke(&self, params: &ToolParams) -> Invocation {
        let mut call = self
            .invoker
            .invoke(params.tool_name(), params, self.handle.cancel_signal());
        tokio::select! {
            result = &mut call => Invocation::Done(result),
            () = self.handle.aborted() => {
                match tokio::time::timeout(self.grace(), &mut call).await {
                    Ok(result) => Invocation::Done(result),
                    Err(_) => Invocation::Cancelled,
                }
            }
        }
    }

    /// Record a succeeded step and take the automatic snapshot.
    pub(super) fn commit_success(
        &mut self,
        index: usize,
        step: &Step,
        tool: &str,
        result: ToolResult,
    ) -> Result<()> {
        self.state.set_status(index, StepStatus::Succeeded);
        if let Some(key) = &step.output_var {
            self.state.variables.insert(key.clone(), result.data.clone());
        }
        self.state.history.push(HistoryEntry {
            step_id: step.id.clone(),
            tool: tool.to_string(),
            success: true,
            message: result.message,
            data: result.data,
        });
        self.state.step_index = self.state.step_index.max(index + 1);
        self.progress = None;
        tracing::info!(step = %step.id, tool, "step succeeded");
        self.sink.emit(EngineEvent::StepSucceeded {
            step_id: step.id.clone(),
            tool: tool.to_string(),
        });
        self.take_snapshot(SnapshotOrigin::Auto, None)?;
        Ok(())
    }

    pub(super) fn record_failure(&mut self, step: &Step, tool: &str, attempt: u32, error: &str) {
        tracing::warn!(step = %step.id, tool, attempt, error, "step attempt failed");
        self.state.history.push(HistoryEntry {
            step_id: step.id.clone(),
            tool: tool.to_string(),
            success: false,
            message: error.to_string(),
            data: serde_json::Value::Null,
        });
        self.journal.retries.push(RetryRecord {
            step_id: step.id.clone(),
            attempt,
            tool: tool.to_string(),
            error: error.to_string(),
        });
        self.sink.emit(EngineEvent::StepFailed {
            step_id: step.id.clone(),
            tool: tool.to_string(),
            attempt,
            error: error.to_string(),
        });
    }

    pub(super) fn cancel_step(&mut self, index: usize, step: &Step, tool: &str) {
        self.state.set_status(index, StepStatus::Failed);
        self.state.history.push(HistoryEntry {
            step_id: step.id.clone(),
            tool: tool.to_string(),
            success: false,
            message: "failed: cancelled".to_string(),
            data: serde_json::Value::Null,
        });
        tracing::warn!(step = %step.id, tool, "tool call cancelled");
        self.sink.emit(EngineEvent::Cancelled {
            step_id: step.id.clone(),
        });
    }
}

/// Approval request for one step. Breakpoint-triggered requests never carry
/// a signature, so a remembered decision cannot answer them.
pub(super) fn approval_request(
    step: &Step,
    params: &ToolParams,
    sensitivity: Sensitivity,
    forced: bool,
) -> ApprovalRequest {
    let tool = params.tool_name();
    let fields = params.fields();
    let kind = if forced && !sensitivity.requires_approval() {
        ApprovalKind::Breakpoint
    } else {
        guardrails::infer_kind(tool, &fields, sensitivity)
    };
    let description = if step.description.trim().is_empty() {
        guardrails::describe(tool, &fields)
    } else {
        step.description.clone()
    };
    let editable: Vec<String> = fields.keys().cloned().collect();
    let request = ApprovalRequest::new(kind, description, ApprovalPayload::new(fields).editable(editable))
        .tool(tool)
        .step(step.id.clone())
        .sensitivity(sensitivity);
    if forced {
        request
    } else {
        request.signature(ActionSignature::from_params(params))
    }
}
