use super::dispatch::{Flow, Gate, Progress};
use super::report::{JoinOutcome, JoinStatus, UnreconciledEffect};
use super::state::EngineStatus;
use super::ExecutionEngine;
use crate::approval::guardrails;
use crate::breakpoints::{Checkpoint, Evaluation};
use crate::error::{EngineError, Result};
use crate::observability::EngineEvent;
use crate::plan::{Step, StepStatus, ToolParams};
use crate::tools::ToolResult;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::{self, JoinError, JoinSet};

type MemberResult = (usize, anyhow::Result<ToolResult>);

enum Next {
    Joined(Option<std::result::Result<MemberResult, JoinError>>),
    Abort,
}

impl ExecutionEngine {
    /// Run the join-group members starting at `start` concurrently.
    ///
    /// Breakpoints and approvals are handled one member at a time on the
    /// control task; each approved member is spawned right away. Results,
    /// history and snapshots are applied in member order once every call
    /// has settled, so the recorded order never depends on timing.
    pub(super) async fn run_group(&mut self, start: usize, members: Vec<Step>) -> Result<Flow> {
        let group = members
            .first()
            .and_then(|step| step.join_group.clone())
            .unwrap_or_default();
        let count = members.len();
        let params: Vec<ToolParams> = members
            .iter()
            .enumerate()
            .map(|(offset, step)| self.params_for(start + offset, step))
            .collect();
        let sensitivities: Vec<_> = members
            .iter()
            .zip(&params)
            .map(|(step, params)| guardrails::effective_sensitivity(step.sensitivity, params))
            .collect();

        let force_approval = match self.progress.take() {
            Some(progress) if progress.index == start => progress.force_approval,
            _ => {
                let mut combined = Evaluation::default();
                let mut force = Vec::with_capacity(count);
                let mut paused_at = None;
                for (offset, member) in params.iter().enumerate() {
                    let evaluation = self.evaluate_at(
                        start + offset,
                        Checkpoint::BeforeStep {
                            tool: member.tool_name(),
                            sensitivity: sensitivities[offset],
                        },
                    );
                    self.report_hits(&evaluation, start + offset);
                    if paused_at.is_none() && evaluation.should_pause() {
                        paused_at = Some(start + offset);
                    }
                    force.push(evaluation.requires_approval());
                    combined.hits.extend(evaluation.hits);
                }
                if let Some(member_index) = paused_at {
                    self.progress = Some(Progress {
                        index: start,
                        force_approval: force,
                        attempt: None,
                    });
                    let mut outcome = self.pause_at(combined.condition_errors());
                    outcome.paused_at = Some(member_index);
                    return Ok(Flow::Stop(outcome));
                }
                force
            }
        };

        tracing::info!(group = %group, members = count, "dispatching join group");
        let mut calls: JoinSet<MemberResult> = JoinSet::new();
        let mut spawned: HashMap<task::Id, usize> = HashMap::new();
        let mut approved = params.clone();
        let mut dispatched = vec![false; count];
        let mut denial: Option<(usize, EngineError)> = None;
        for (offset, step) in members.iter().enumerate() {
            let index = start + offset;
            let forced = force_approval.get(offset).copied().unwrap_or(false);
            if forced || self.needs_approval(sensitivities[offset]) {
                match self
                    .gate(index, step, &params[offset], sensitivities[offset], forced, false)
                    .await?
                {
                    Gate::Approved(edited) => approved[offset] = edited,
                    Gate::Denied(error) => {
                        denial = Some((offset, error));
                        break;
                    }
                    Gate::Interrupted => break,
                }
            }
            if self.handle.is_abort_requested() {
                break;
            }

            let call_params = approved[offset].clone();
            let tool = call_params.tool_name();
            self.state.set_status(index, StepStatus::Running);
            self.state.record_usage(tool);
            self.sink.emit(EngineEvent::StepStarted {
                step_id: step.id.clone(),
                tool: tool.to_string(),
                attempt: 1,
            });
            let invoker = Arc::clone(&self.invoker);
            let cancel = self.handle.cancel_signal();
            let member_task = calls.spawn(async move {
                let result = invoker.invoke(tool, &call_params, cancel).await;
                (offset, result)
            });
            spawned.insert(member_task.id(), offset);
            dispatched[offset] = true;
        }
        if denial.is_some() {
            self.transition(EngineStatus::Running);
        }

        let mut results: Vec<Option<anyhow::Result<ToolResult>>> =
            (0..count).map(|_| None).collect();
        let mut cancelled = false;
        let handle = self.handle.clone();
        loop {
            let next = tokio::select! {
                joined = calls.join_next() => Next::Joined(joined),
                () = handle.aborted(), if !cancelled => Next::Abort,
            };
            match next {
                Next::Joined(None) => break,
                Next::Joined(Some(joined)) => settle(&mut results, &spawned, joined, &group),
                Next::Abort => {
                    cancelled = true;
                    let drained = tokio::time::timeout(self.grace(), async {
                        while let Some(joined) = calls.join_next().await {
                            settle(&mut results, &spawned, joined, &group);
                        }
                    })
                    .await;
                    if drained.is_err() {
                        tracing::warn!(group = %group, "grace period elapsed, cancelling remaining calls");
                        calls.abort_all();
                    }
                    break;
                }
            }
        }

        let mut committed = Vec::new();
        let mut failure: Option<EngineError> = None;
        let mut after_errors = Vec::new();
        let mut pause_after = false;
        let mut denial_reason = denial.as_ref().map(|(offset, error)| (*offset, error.to_string()));
        for (offset, step) in members.iter().enumerate() {
            let index = start + offset;
            let tool = approved[offset].tool_name();
            if !dispatched[offset] {
                let reason = match denial_reason.take() {
                    Some((denied, reason)) if denied == offset => reason,
                    other => {
                        denial_reason = other;
                        "join group aborted".to_string()
                    }
                };
                self.state.set_status(index, StepStatus::Skipped);
                self.state.step_index = self.state.step_index.max(index + 1);
                self.sink.emit(EngineEvent::StepSkipped {
                    step_id: step.id.clone(),
                    reason,
                });
                continue;
            }

            // Only calls cut off after the abort grace period have no result.
            let error = match results[offset].take() {
                Some(Ok(result)) if result.success => {
                    self.commit_success(index, step, tool, result)?;
                    committed.push(step.id.clone());
                    let evaluation = self.evaluate_at(
                        index + 1,
                        Checkpoint::AfterStep {
                            tool,
                            success: true,
                        },
                    );
                    self.report_hits(&evaluation, index);
                    pause_after |= evaluation.should_pause();
                    after_errors.extend(evaluation.condition_errors());
                    continue;
                }
                Some(Ok(result)) => result.failure_text(),
                Some(Err(error)) => format!("{error:#}"),
                None => {
                    self.cancel_step(index, step, tool);
                    self.state.step_index = self.state.step_index.max(index + 1);
                    continue;
                }
            };
            self.record_failure(step, tool, 1, &error);
            self.state.set_status(index, StepStatus::Failed);
            self.state.step_index = self.state.step_index.max(index + 1);
            let evaluation = self.evaluate_at(
                index + 1,
                Checkpoint::AfterStep {
                    tool,
                    success: false,
                },
            );
            self.report_hits(&evaluation, index);
            pause_after |= evaluation.should_pause();
            after_errors.extend(evaluation.condition_errors());
            failure.get_or_insert(EngineError::ToolExecution {
                step_id: step.id.clone(),
                tool: tool.to_string(),
                attempts: 1,
                message: error,
            });
        }

        let aborted = denial.is_some() || failure.is_some() || cancelled || committed.len() < count;
        let status = if aborted {
            JoinStatus::Aborted
        } else {
            JoinStatus::Succeeded
        };
        if aborted {
            for step_id in &committed {
                let tool = members
                    .iter()
                    .position(|step| &step.id == step_id)
                    .map_or("", |offset| approved[offset].tool_name());
                tracing::warn!(group = %group, step = %step_id, "side effect left unreconciled");
                self.journal.unreconciled.push(UnreconciledEffect {
                    group: group.clone(),
                    step_id: step_id.clone(),
                    tool: tool.to_string(),
                });
                self.sink.emit(EngineEvent::UnreconciledEffect {
                    group: group.clone(),
                    step_id: step_id.clone(),
                });
            }
        }
        self.journal.join_groups.push(JoinOutcome {
            group: group.clone(),
            status,
            members: members.iter().map(|step| step.id.clone()).collect(),
            committed,
        });
        tracing::info!(group = %group, status = %status, "join group settled");
        self.sink.emit(EngineEvent::JoinGroupSettled { group, status });
        self.progress = None;

        if cancelled || self.handle.is_abort_requested() {
            return Ok(Flow::Stop(self.finish_aborted()));
        }
        if let Some(error) = failure {
            return Ok(Flow::Stop(self.fail(error)));
        }
        if let Some((_, error)) = denial
            && members.iter().any(|step| step.mandatory)
        {
            return Ok(Flow::Stop(self.fail(error)));
        }
        if pause_after {
            return Ok(Flow::Stop(self.pause_at(after_errors)));
        }
        Ok(Flow::Continue)
    }
}

/// Store a member's result. A member task that panicked counts as a failed
/// call; tasks cancelled by `abort_all` are never joined, so they keep no
/// result.
fn settle(
    results: &mut [Option<anyhow::Result<ToolResult>>],
    spawned: &HashMap<task::Id, usize>,
    joined: std::result::Result<MemberResult, JoinError>,
    group: &str,
) {
    match joined {
        Ok((offset, result)) => results[offset] = Some(result),
        Err(error) => {
            let Some(&offset) = spawned.get(&error.id()) else {
                return;
            };
            tracing::warn!(group, error = %error, "join group member task ended abnormally");
            if error.is_panic() {
                results[offset] = Some(Err(anyhow::anyhow!("tool call panicked")));
            }
        }
    }
}
