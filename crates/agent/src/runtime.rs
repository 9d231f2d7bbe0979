//! Agent runtime.
//!
//! The orchestrating state machine over `AgentRun.status`: queued runs
//! start, loop through plan/act rounds against the language model and
//! the tool registry, and terminate in completed, failed, or cancelled.
//! A single run executes its rounds sequentially; tool calls within one
//! round are dispatched concurrently but all settle before the next
//! planning round, because the next prompt depends on their outcomes.

use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::{json, Value};
use uuid::Uuid;

use skipper_core::chrono::Utc;
use skipper_core::domain::decision::{SafetyDecision, SafetyDecisionId, SafetyVerdict};
use skipper_core::domain::evidence::{Evidence, EvidenceId, EvidenceSource};
use skipper_core::domain::invocation::{InvocationStatus, ToolInvocation, ToolInvocationId};
use skipper_core::domain::run::{AgentMode, AgentRun, AgentRunId, RunStatus, UserId};
use skipper_core::domain::step::{AgentStep, StepKind};
use skipper_core::errors::DomainError;
use thiserror::Error;

use skipper_db::repositories::{
    AgentRunRepository, AuditTrailRepository, InvocationRepository, RepositoryError,
};

use crate::guard::SafetyGuard;
use crate::limiter::RateLimiter;
use crate::llm::{GenerateOptions, LlmClient};
use crate::plan::{parse_planner_output, PlannerOutput, ProposedCall};
use crate::prompts;
use crate::registry::{ToolContext, ToolRegistry};
use crate::router::Router;

const RESULT_SNIPPET_MAX: usize = 300;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("run `{0}` not found")]
    RunNotFound(String),
    #[error("invocation `{0}` not found")]
    InvocationNotFound(String),
    #[error("invocation `{0}` is already resolved")]
    AlreadyResolved(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// How a drive through the loop ended. `AwaitingConfirmation` leaves the
/// run in `running`; the caller resumes it with [`AgentRuntime::continue_run`]
/// after resolving the pending invocations.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(AgentRun),
    AwaitingConfirmation { run: AgentRun, pending: Vec<ToolInvocationId> },
    Cancelled(AgentRun),
    Failed(AgentRun),
}

pub struct AgentRuntime {
    runs: Arc<dyn AgentRunRepository>,
    invocations: Arc<dyn InvocationRepository>,
    audit: Arc<dyn AuditTrailRepository>,
    registry: Arc<ToolRegistry>,
    guard: SafetyGuard,
    router: Router,
    llm: Arc<dyn LlmClient>,
    limiter: Arc<RateLimiter>,
    max_steps_per_run: u32,
}

impl AgentRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runs: Arc<dyn AgentRunRepository>,
        invocations: Arc<dyn InvocationRepository>,
        audit: Arc<dyn AuditTrailRepository>,
        registry: Arc<ToolRegistry>,
        guard: SafetyGuard,
        router: Router,
        llm: Arc<dyn LlmClient>,
        limiter: Arc<RateLimiter>,
        max_steps_per_run: u32,
    ) -> Self {
        Self {
            runs,
            invocations,
            audit,
            registry,
            guard,
            router,
            llm,
            limiter,
            max_steps_per_run,
        }
    }

    /// Create a queued run for an interactive caller. The goal is
    /// sanitized before it is persisted anywhere.
    pub async fn create_run(
        &self,
        user_id: UserId,
        mode: AgentMode,
        goal: &str,
        input_json: Option<String>,
    ) -> Result<AgentRun, RuntimeError> {
        skipper_core::sanitizer::sanitize(
            goal,
            "goal",
            &skipper_core::sanitizer::SanitizeOptions::default(),
        )
        .map_err(DomainError::from)?;

        let run = AgentRun::queued(
            AgentRunId(Uuid::new_v4().to_string()),
            user_id,
            mode,
            goal,
            input_json,
        );
        self.runs.save(run.clone()).await?;

        tracing::info!(
            event_name = "agent.run.created",
            run_id = %run.id.0,
            mode = run.mode.as_str(),
            "agent run queued"
        );
        Ok(run)
    }

    /// Start a queued run and drive it until a terminal state or a
    /// confirmation pause.
    pub async fn run(&self, run_id: &AgentRunId) -> Result<RunOutcome, RuntimeError> {
        let mut run = self.load_run(run_id).await?;
        self.transition_run(&mut run, RunStatus::Running)?;
        run.started_at = Some(Utc::now());
        self.runs.save(run.clone()).await?;

        let tool_names: Vec<String> =
            self.registry.list().into_iter().map(|summary| summary.name).collect();
        let routing = self.router.route(&run.id, None, run.mode, &tool_names);
        self.audit.record_routing_decision(routing).await?;

        tracing::info!(
            event_name = "agent.run.started",
            run_id = %run.id.0,
            "agent run started"
        );

        self.drive(run, 0, 0, Vec::new()).await
    }

    /// Re-enter the loop from persisted state. Used after a confirmation
    /// pause; finished steps are never re-executed.
    pub async fn continue_run(&self, run_id: &AgentRunId) -> Result<RunOutcome, RuntimeError> {
        let run = self.load_run(run_id).await?;
        match run.status {
            RunStatus::Running => {}
            from => {
                return Err(RuntimeError::Domain(DomainError::InvalidRunTransition {
                    from,
                    to: RunStatus::Running,
                }))
            }
        }

        let existing = self.invocations.list_for_run(run_id).await?;
        let pending: Vec<ToolInvocationId> = existing
            .iter()
            .filter(|invocation| invocation.status == InvocationStatus::NeedsConfirmation)
            .map(|invocation| invocation.id.clone())
            .collect();
        if !pending.is_empty() {
            return Ok(RunOutcome::AwaitingConfirmation { run, pending });
        }

        let steps = self.runs.list_steps(run_id).await?;
        let rounds_used =
            steps.iter().filter(|step| step.kind == StepKind::Plan).count() as u32;
        let next_index = steps.len() as u32;

        // Outcomes of the paused round become context for the next plan.
        let mut feedback = Vec::new();
        if let Some(last_act) = steps.iter().rev().find(|step| step.kind == StepKind::Act) {
            for invocation in
                existing.iter().filter(|invocation| invocation.step_index == last_act.step_index)
            {
                feedback.push(invocation_feedback(invocation));
            }
        }

        self.drive(run, rounds_used, next_index, feedback).await
    }

    /// Cancel a queued or running run. Terminal runs are left untouched
    /// and reported as an invalid transition.
    pub async fn cancel(&self, run_id: &AgentRunId) -> Result<AgentRun, RuntimeError> {
        let mut run = self.load_run(run_id).await?;
        self.transition_run(&mut run, RunStatus::Cancelled)?;
        run.finished_at = Some(Utc::now());
        self.runs.save(run.clone()).await?;

        tracing::info!(
            event_name = "agent.run.cancelled",
            run_id = %run.id.0,
            "agent run cancelled"
        );
        Ok(run)
    }

    /// Resolve a `needs_confirmation` invocation. Approving executes the
    /// handler now; denying marks the invocation denied. Confirming an
    /// already-terminal invocation is an explicit error, not a silent
    /// success.
    pub async fn confirm_invocation(
        &self,
        invocation_id: &ToolInvocationId,
        approved: bool,
    ) -> Result<ToolInvocation, RuntimeError> {
        let mut invocation = self
            .invocations
            .find_by_id(invocation_id)
            .await?
            .ok_or_else(|| RuntimeError::InvocationNotFound(invocation_id.0.clone()))?;

        if invocation.status != InvocationStatus::NeedsConfirmation {
            return Err(RuntimeError::AlreadyResolved(invocation_id.0.clone()));
        }

        let run = self.load_run(&invocation.run_id).await?;

        if !approved {
            transition_invocation(&mut invocation, InvocationStatus::Denied)?;
            invocation.finished_at = Some(Utc::now());
            self.invocations.save(invocation.clone()).await?;

            tracing::info!(
                event_name = "agent.invocation.denied",
                run_id = %run.id.0,
                invocation_id = %invocation.id.0,
                tool = %invocation.tool_name,
                "confirmation denied by operator"
            );
            return Ok(invocation);
        }

        let ctx = ToolContext { user_id: run.user_id.clone(), run_id: Some(run.id.clone()) };
        let args: Value =
            serde_json::from_str(&invocation.args_json).unwrap_or(Value::Null);
        invocation.started_at = Some(Utc::now());

        match self.registry.execute(&invocation.tool_name, args, &ctx).await {
            Ok(result) => {
                transition_invocation(&mut invocation, InvocationStatus::Executed)?;
                invocation.result_json = Some(result.to_string());
            }
            Err(error) => {
                transition_invocation(&mut invocation, InvocationStatus::Failed)?;
                invocation.error_message = Some(error.to_string());
            }
        }
        invocation.finished_at = Some(Utc::now());
        self.invocations.save(invocation.clone()).await?;

        // The owning act step's output is patched once with the late
        // result; step identity and order never change.
        self.runs
            .update_step_output(
                &invocation.run_id,
                invocation.step_index,
                &json!({
                    "confirmed_invocation": invocation.id.0,
                    "status": invocation.status.as_str(),
                    "result": invocation.result_json,
                    "error": invocation.error_message,
                })
                .to_string(),
            )
            .await?;

        tracing::info!(
            event_name = "agent.invocation.confirmed",
            run_id = %run.id.0,
            invocation_id = %invocation.id.0,
            tool = %invocation.tool_name,
            status = invocation.status.as_str(),
            "confirmation resolved"
        );
        Ok(invocation)
    }

    async fn drive(
        &self,
        mut run: AgentRun,
        mut rounds_used: u32,
        mut next_index: u32,
        mut feedback: Vec<String>,
    ) -> Result<RunOutcome, RuntimeError> {
        let mut consecutive_parse_failures = 0u32;

        loop {
            // Cancellation wins at the checkpoint before each planning
            // round, even if a model call completed in the meantime.
            let current = self.load_run(&run.id).await?;
            if current.status == RunStatus::Cancelled {
                tracing::info!(
                    event_name = "agent.run.cancel_observed",
                    run_id = %current.id.0,
                    "cancellation observed before planning round"
                );
                return Ok(RunOutcome::Cancelled(current));
            }
            run = current;

            if rounds_used >= self.max_steps_per_run {
                return self
                    .finalize(
                        run,
                        next_index,
                        "Step limit reached before the agent produced a final answer.",
                        vec!["Re-run or continue the run to let the agent keep working."
                            .to_string()],
                        Vec::new(),
                    )
                    .await;
            }

            let prompt =
                match prompts::planning_prompt(&run.goal, &self.registry.list(), &feedback) {
                    Ok(prompt) => prompt,
                    Err(violation) => return self.fail(run, violation.to_string()).await,
                };

            self.limiter.acquire().await;
            let raw = match self.llm.generate(&prompt, &GenerateOptions::json()).await {
                Ok(raw) => raw,
                Err(error) => return self.fail(run, error.to_string()).await,
            };
            rounds_used += 1;

            let output = match parse_planner_output(&raw) {
                Ok(output) => output,
                Err(error) => {
                    consecutive_parse_failures += 1;
                    self.runs
                        .append_step(AgentStep::new(
                            run.id.clone(),
                            next_index,
                            StepKind::Plan,
                            None,
                            Some(json!({"parse_error": error.to_string()}).to_string()),
                        ))
                        .await?;
                    next_index += 1;

                    if consecutive_parse_failures >= 2 {
                        return self
                            .fail(run, format!("planner output unparsable twice: {error}"))
                            .await;
                    }
                    feedback.push(
                        "Your previous response did not match the required JSON schema. \
                         Respond with exactly one JSON object."
                            .to_string(),
                    );
                    continue;
                }
            };
            consecutive_parse_failures = 0;

            match output {
                PlannerOutput::Final { message, hints, questions } => {
                    return self.finalize(run, next_index, &message, hints, questions).await;
                }
                PlannerOutput::Plan { thought, tool_calls, claims } => {
                    self.runs
                        .append_step(AgentStep::new(
                            run.id.clone(),
                            next_index,
                            StepKind::Plan,
                            None,
                            Some(
                                json!({
                                    "thought": thought,
                                    "proposed_calls": tool_calls
                                        .iter()
                                        .map(|call| call.tool.clone())
                                        .collect::<Vec<_>>(),
                                })
                                .to_string(),
                            ),
                        ))
                        .await?;
                    next_index += 1;

                    for claim in claims {
                        self.audit
                            .append_evidence(Evidence {
                                id: EvidenceId(Uuid::new_v4().to_string()),
                                run_id: run.id.clone(),
                                claim: claim.claim,
                                source: EvidenceSource::ModelAssertion,
                                confidence: claim.confidence,
                                created_at: Utc::now(),
                            })
                            .await?;
                    }

                    if tool_calls.is_empty() {
                        feedback.push(
                            "The plan proposed no tool calls. Either call a tool or \
                             return a final answer."
                                .to_string(),
                        );
                        continue;
                    }

                    let act_index = next_index;
                    let round =
                        self.run_tool_round(&run, act_index, tool_calls, &mut feedback).await?;
                    next_index += 1;

                    if !round.pending.is_empty() {
                        tracing::info!(
                            event_name = "agent.run.awaiting_confirmation",
                            run_id = %run.id.0,
                            pending = round.pending.len(),
                            "run paused on human confirmation"
                        );
                        return Ok(RunOutcome::AwaitingConfirmation {
                            run,
                            pending: round.pending,
                        });
                    }
                }
            }
        }
    }

    /// Guard and execute one round of proposed tool calls. Allowed calls
    /// are dispatched concurrently and all settle before this returns.
    async fn run_tool_round(
        &self,
        run: &AgentRun,
        act_index: u32,
        tool_calls: Vec<ProposedCall>,
        feedback: &mut Vec<String>,
    ) -> Result<ToolRound, RuntimeError> {
        let mut allowed = Vec::new();
        let mut pending = Vec::new();
        let mut outcomes = Vec::new();

        for call in tool_calls {
            let mut invocation = ToolInvocation::pending(
                ToolInvocationId(Uuid::new_v4().to_string()),
                run.id.clone(),
                act_index,
                call.tool.clone(),
                call.args.to_string(),
            );

            let verdict = self
                .guard
                .decide(self.registry.get(&call.tool).map(|tool| tool.as_ref()), &call.args);

            let status = match verdict.verdict {
                SafetyVerdict::Allow => InvocationStatus::Allowed,
                SafetyVerdict::Block => InvocationStatus::Blocked,
                SafetyVerdict::NeedsConfirmation => InvocationStatus::NeedsConfirmation,
            };
            transition_invocation(&mut invocation, status)?;

            tracing::info!(
                event_name = "agent.guard.verdict",
                run_id = %run.id.0,
                invocation_id = %invocation.id.0,
                tool = %invocation.tool_name,
                verdict = verdict.verdict.as_str(),
                "guard decided on proposed tool call"
            );

            match verdict.verdict {
                SafetyVerdict::Block => {
                    invocation.error_message =
                        Some(verdict.reasons.join(", "));
                    invocation.finished_at = Some(Utc::now());
                    if let Some(text) = &verdict.feedback {
                        feedback.push(format!("Tool `{}`: {text}", invocation.tool_name));
                    }
                    outcomes.push(json!({
                        "invocation": invocation.id.0,
                        "tool": invocation.tool_name,
                        "status": invocation.status.as_str(),
                    }));
                }
                SafetyVerdict::NeedsConfirmation => {
                    if let Some(text) = &verdict.feedback {
                        feedback.push(text.clone());
                    }
                    pending.push(invocation.id.clone());
                    outcomes.push(json!({
                        "invocation": invocation.id.0,
                        "tool": invocation.tool_name,
                        "status": invocation.status.as_str(),
                    }));
                }
                SafetyVerdict::Allow => {
                    invocation.started_at = Some(Utc::now());
                }
            }

            self.invocations.save(invocation.clone()).await?;
            self.audit
                .record_safety_decision(SafetyDecision {
                    id: SafetyDecisionId(Uuid::new_v4().to_string()),
                    run_id: run.id.clone(),
                    invocation_id: invocation.id.clone(),
                    verdict: verdict.verdict,
                    reasons: verdict.reasons,
                    feedback: verdict.feedback,
                    decided_at: Utc::now(),
                })
                .await?;

            if invocation.status == InvocationStatus::Allowed {
                allowed.push(invocation);
            }
        }

        let executions = allowed.into_iter().map(|invocation| {
            let registry = Arc::clone(&self.registry);
            let ctx =
                ToolContext { user_id: run.user_id.clone(), run_id: Some(run.id.clone()) };
            async move {
                let args: Value =
                    serde_json::from_str(&invocation.args_json).unwrap_or(Value::Null);
                let result = registry.execute(&invocation.tool_name, args, &ctx).await;
                (invocation, result)
            }
        });

        for (mut invocation, result) in join_all(executions).await {
            match result {
                Ok(value) => {
                    transition_invocation(&mut invocation, InvocationStatus::Executed)?;
                    invocation.result_json = Some(value.to_string());
                }
                Err(error) => {
                    transition_invocation(&mut invocation, InvocationStatus::Failed)?;
                    invocation.error_message = Some(error.to_string());
                }
            }
            invocation.finished_at = Some(Utc::now());
            feedback.push(invocation_feedback(&invocation));
            outcomes.push(json!({
                "invocation": invocation.id.0,
                "tool": invocation.tool_name,
                "status": invocation.status.as_str(),
            }));
            self.invocations.save(invocation).await?;
        }

        let output = if pending.is_empty() {
            json!({"results": outcomes})
        } else {
            json!({
                "results": outcomes,
                "awaiting_confirmation": pending
                    .iter()
                    .map(|id| id.0.clone())
                    .collect::<Vec<_>>(),
            })
        };
        self.runs
            .append_step(AgentStep::new(
                run.id.clone(),
                act_index,
                StepKind::Act,
                None,
                Some(output.to_string()),
            ))
            .await?;

        Ok(ToolRound { pending })
    }

    async fn finalize(
        &self,
        mut run: AgentRun,
        next_index: u32,
        message: &str,
        hints: Vec<String>,
        questions: Vec<String>,
    ) -> Result<RunOutcome, RuntimeError> {
        let result =
            json!({"message": message, "hints": hints, "questions": questions}).to_string();

        self.runs
            .append_step(AgentStep::new(
                run.id.clone(),
                next_index,
                StepKind::Final,
                None,
                Some(result.clone()),
            ))
            .await?;

        self.transition_run(&mut run, RunStatus::Completed)?;
        run.result_json = Some(result);
        run.finished_at = Some(Utc::now());
        self.runs.save(run.clone()).await?;

        tracing::info!(
            event_name = "agent.run.completed",
            run_id = %run.id.0,
            "agent run completed"
        );
        Ok(RunOutcome::Completed(run))
    }

    async fn fail(
        &self,
        mut run: AgentRun,
        message: String,
    ) -> Result<RunOutcome, RuntimeError> {
        self.transition_run(&mut run, RunStatus::Failed)?;
        run.error_message = Some(message.clone());
        run.finished_at = Some(Utc::now());
        self.runs.save(run.clone()).await?;

        tracing::warn!(
            event_name = "agent.run.failed",
            run_id = %run.id.0,
            error = %message,
            "agent run failed"
        );
        Ok(RunOutcome::Failed(run))
    }

    async fn load_run(&self, run_id: &AgentRunId) -> Result<AgentRun, RuntimeError> {
        self.runs
            .find_by_id(run_id)
            .await?
            .ok_or_else(|| RuntimeError::RunNotFound(run_id.0.clone()))
    }

    fn transition_run(&self, run: &mut AgentRun, to: RunStatus) -> Result<(), RuntimeError> {
        if !RunStatus::can_transition(run.status, to) {
            return Err(RuntimeError::Domain(DomainError::InvalidRunTransition {
                from: run.status,
                to,
            }));
        }
        run.status = to;
        Ok(())
    }
}

struct ToolRound {
    pending: Vec<ToolInvocationId>,
}

fn transition_invocation(
    invocation: &mut ToolInvocation,
    to: InvocationStatus,
) -> Result<(), RuntimeError> {
    if !InvocationStatus::can_transition(invocation.status, to) {
        return Err(RuntimeError::Domain(DomainError::InvalidInvocationTransition {
            from: invocation.status,
            to,
        }));
    }
    invocation.status = to;
    Ok(())
}

fn invocation_feedback(invocation: &ToolInvocation) -> String {
    match invocation.status {
        InvocationStatus::Executed => {
            let snippet = invocation
                .result_json
                .as_deref()
                .map(|result| truncate(result, RESULT_SNIPPET_MAX))
                .unwrap_or_default();
            format!("Tool `{}` executed: {snippet}", invocation.tool_name)
        }
        InvocationStatus::Failed => format!(
            "Tool `{}` failed: {}",
            invocation.tool_name,
            invocation.error_message.as_deref().unwrap_or("unknown error")
        ),
        InvocationStatus::Denied => {
            format!("Tool `{}` was denied by the operator.", invocation.tool_name)
        }
        other => format!("Tool `{}` ended as {}.", invocation.tool_name, other.as_str()),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max).collect();
    format!("{truncated}…")
}
