//! Outbox-driven autopilot.
//!
//! One poll cycle leases a batch of unprocessed outbox events and turns
//! each into at most one autopilot run, keyed by the event's dedup key.
//! Processing is at-least-once: a crash between execution and
//! `mark_processed` re-leases the event, and the trigger-key uniqueness
//! on autopilot runs is what keeps the replay from doing the work twice.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use skipper_core::chrono::{DateTime, Duration, Utc};
use skipper_core::domain::autopilot::{
    AutopilotRun, AutopilotRunId, AutopilotRunStatus, TriggerType,
};
use skipper_core::domain::outbox::OutboxEvent;
use skipper_core::domain::run::UserId;
use skipper_core::sanitizer::SanitizeViolation;

use skipper_db::repositories::{AutopilotRunRepository, OutboxRepository, RepositoryError};

use crate::guard::SafetyGuard;
use crate::limiter::RateLimiter;
use crate::llm::{GenerateOptions, LlmClient};
use crate::plan::parse_autopilot_plan;
use crate::prompts;
use crate::registry::{ToolContext, ToolRegistry};

/// Retry schedule in minutes, indexed by how often the event has already
/// failed. Failures past the end of the table reuse the last entry.
const BACKOFF_MINUTES: [i64; 5] = [1, 5, 30, 120, 360];

#[derive(Debug, Error)]
pub enum AutopilotError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Clone, Copy, Debug)]
pub struct ExecuteOptions {
    pub limit: u32,
    pub now: DateTime<Utc>,
}

impl ExecuteOptions {
    pub fn batch(limit: u32) -> Self {
        Self { limit, now: Utc::now() }
    }
}

/// Counters for one poll cycle. `leased` is the batch size; the other
/// counters partition it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecuteReport {
    pub leased: usize,
    pub processed: usize,
    pub deduplicated: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

/// Why one event's processing attempt did not complete. Permanent causes
/// dead-letter immediately; transient ones go through the retry schedule.
enum EventFailure {
    Permanent(String),
    Transient(String),
}

impl From<SanitizeViolation> for EventFailure {
    fn from(violation: SanitizeViolation) -> Self {
        // A sanitizer violation is deterministic; retrying the same
        // payload can never succeed.
        Self::Permanent(violation.to_string())
    }
}

pub struct AutopilotRunner {
    outbox: Arc<dyn OutboxRepository>,
    autopilot_runs: Arc<dyn AutopilotRunRepository>,
    registry: Arc<ToolRegistry>,
    guard: SafetyGuard,
    llm: Arc<dyn LlmClient>,
    limiter: Arc<RateLimiter>,
    max_retries: u32,
}

impl AutopilotRunner {
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        autopilot_runs: Arc<dyn AutopilotRunRepository>,
        registry: Arc<ToolRegistry>,
        llm: Arc<dyn LlmClient>,
        limiter: Arc<RateLimiter>,
        max_retries: u32,
    ) -> Self {
        Self {
            outbox,
            autopilot_runs,
            registry,
            // Autopilot has no human in the loop; the trigger itself is
            // the pre-authorization for side effects.
            guard: SafetyGuard::auto_approving(),
            llm,
            limiter,
            max_retries,
        }
    }

    /// One poll cycle: lease, process sequentially, settle each event.
    pub async fn execute(&self, options: ExecuteOptions) -> Result<ExecuteReport, AutopilotError> {
        let batch = self.outbox.lease_next_batch(options.limit, options.now).await?;
        let mut report = ExecuteReport { leased: batch.len(), ..ExecuteReport::default() };

        for event in batch {
            match self.process_event(&event).await? {
                EventOutcome::Processed => {
                    self.outbox.mark_processed(&event.id, options.now).await?;
                    report.processed += 1;
                }
                EventOutcome::Deduplicated => {
                    self.outbox.mark_processed(&event.id, options.now).await?;
                    report.deduplicated += 1;
                }
                EventOutcome::Failed(EventFailure::Permanent(error)) => {
                    self.outbox.record_failure(&event.id, &error, None).await?;
                    self.outbox.mark_processed(&event.id, options.now).await?;
                    report.failed += 1;
                    report.dead_lettered += 1;
                    tracing::warn!(
                        event_name = "autopilot.event.dead_lettered",
                        outbox_event_id = %event.id.0,
                        event_type = %event.event_type,
                        error = %error,
                        "event failed permanently"
                    );
                }
                EventOutcome::Failed(EventFailure::Transient(error)) => {
                    report.failed += 1;
                    if event.error_count + 1 >= self.max_retries {
                        self.outbox.record_failure(&event.id, &error, None).await?;
                        self.outbox.mark_processed(&event.id, options.now).await?;
                        report.dead_lettered += 1;
                        tracing::warn!(
                            event_name = "autopilot.event.dead_lettered",
                            outbox_event_id = %event.id.0,
                            event_type = %event.event_type,
                            attempts = event.error_count + 1,
                            error = %error,
                            "retry budget exhausted"
                        );
                    } else {
                        let minutes = BACKOFF_MINUTES
                            [(event.error_count as usize).min(BACKOFF_MINUTES.len() - 1)];
                        let next_retry_at = options.now + Duration::minutes(minutes);
                        self.outbox.record_failure(&event.id, &error, Some(next_retry_at)).await?;
                        tracing::warn!(
                            event_name = "autopilot.event.retry_scheduled",
                            outbox_event_id = %event.id.0,
                            event_type = %event.event_type,
                            attempts = event.error_count + 1,
                            backoff_minutes = minutes,
                            error = %error,
                            "event failed, retry scheduled"
                        );
                    }
                }
            }
        }

        tracing::info!(
            event_name = "autopilot.cycle.finished",
            leased = report.leased,
            processed = report.processed,
            deduplicated = report.deduplicated,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            "autopilot poll cycle finished"
        );
        Ok(report)
    }

    async fn process_event(
        &self,
        event: &OutboxEvent,
    ) -> Result<EventOutcome, AutopilotError> {
        let Some(trigger) = TriggerType::from_event_type(&event.event_type) else {
            return Ok(EventOutcome::Failed(EventFailure::Permanent(format!(
                "unknown event type `{}`",
                event.event_type
            ))));
        };

        let user_id = match extract_user_id(&event.payload_json) {
            Some(user_id) => user_id,
            None => {
                return Ok(EventOutcome::Failed(EventFailure::Permanent(
                    "payload carries no user id".to_string(),
                )))
            }
        };

        let candidate = AutopilotRun::queued(
            AutopilotRunId(Uuid::new_v4().to_string()),
            event.dedup_key.clone(),
            trigger,
            user_id,
            Some(event.payload_json.clone()),
        );

        let run = match self.autopilot_runs.create_queued(candidate).await? {
            Some(run) => run,
            None => {
                // A run for this trigger key already exists. A failed one
                // is retried in place; anything else means a replay of
                // work that already happened (or is happening).
                let existing =
                    self.autopilot_runs.find_by_trigger_key(&event.dedup_key).await?;
                match existing {
                    Some(run) if run.status == AutopilotRunStatus::Failed => run,
                    _ => {
                        tracing::info!(
                            event_name = "autopilot.event.deduplicated",
                            outbox_event_id = %event.id.0,
                            trigger_key = %event.dedup_key,
                            "trigger key already handled"
                        );
                        return Ok(EventOutcome::Deduplicated);
                    }
                }
            }
        };

        match self.drive_run(run, trigger).await? {
            Ok(()) => Ok(EventOutcome::Processed),
            Err(failure) => Ok(EventOutcome::Failed(failure)),
        }
    }

    /// Plan once, then execute the planned actions in order. Any failure
    /// marks the run failed and is reported for retry scheduling.
    async fn drive_run(
        &self,
        mut run: AutopilotRun,
        trigger: TriggerType,
    ) -> Result<Result<(), EventFailure>, AutopilotError> {
        run.status = AutopilotRunStatus::Running;
        run.started_at = Some(Utc::now());
        run.error_message = None;
        self.autopilot_runs.save(run.clone()).await?;

        tracing::info!(
            event_name = "autopilot.run.started",
            autopilot_run_id = %run.id.0,
            trigger = trigger.as_str(),
            "autopilot run started"
        );

        match self.plan_and_act(&mut run, trigger).await {
            Ok(results) => {
                run.status = AutopilotRunStatus::Completed;
                run.result_json = Some(Value::Array(results).to_string());
                run.finished_at = Some(Utc::now());
                self.autopilot_runs.save(run.clone()).await?;

                tracing::info!(
                    event_name = "autopilot.run.completed",
                    autopilot_run_id = %run.id.0,
                    "autopilot run completed"
                );
                Ok(Ok(()))
            }
            Err(failure) => {
                let message = match &failure {
                    EventFailure::Permanent(error) | EventFailure::Transient(error) => {
                        error.clone()
                    }
                };
                run.status = AutopilotRunStatus::Failed;
                run.error_message = Some(message.clone());
                run.finished_at = Some(Utc::now());
                self.autopilot_runs.save(run.clone()).await?;

                tracing::warn!(
                    event_name = "autopilot.run.failed",
                    autopilot_run_id = %run.id.0,
                    error = %message,
                    "autopilot run failed"
                );
                Ok(Err(failure))
            }
        }
    }

    async fn plan_and_act(
        &self,
        run: &mut AutopilotRun,
        trigger: TriggerType,
    ) -> Result<Vec<Value>, EventFailure> {
        let context = run.context_json.as_deref().unwrap_or("{}");
        let prompt =
            prompts::autopilot_prompt(trigger.as_str(), context, &self.registry.list())?;

        self.limiter.acquire().await;
        let raw = self
            .llm
            .generate(&prompt, &GenerateOptions::json())
            .await
            .map_err(|error| EventFailure::Transient(error.to_string()))?;

        let plan = parse_autopilot_plan(&raw)
            .map_err(|error| EventFailure::Transient(error.to_string()))?;
        run.plan_json = Some(raw);
        self.autopilot_runs
            .save(run.clone())
            .await
            .map_err(|error| EventFailure::Transient(error.to_string()))?;

        let ctx = ToolContext::for_user(run.user_id.clone());
        let mut results = Vec::with_capacity(plan.actions.len());

        // Actions run strictly in order; a failure aborts the remainder
        // so the retry re-plans from scratch.
        for action in plan.actions {
            let verdict = self
                .guard
                .decide(self.registry.get(&action.tool).map(|tool| tool.as_ref()), &action.args);
            if verdict.verdict != skipper_core::domain::decision::SafetyVerdict::Allow {
                return Err(EventFailure::Transient(format!(
                    "action `{}` rejected: {}",
                    action.tool,
                    verdict.reasons.join(", ")
                )));
            }

            let result = self
                .registry
                .execute(&action.tool, action.args, &ctx)
                .await
                .map_err(|error| EventFailure::Transient(error.to_string()))?;

            tracing::info!(
                event_name = "autopilot.action.executed",
                autopilot_run_id = %run.id.0,
                tool = %action.tool,
                "autopilot action executed"
            );
            results.push(serde_json::json!({"tool": action.tool, "result": result}));
        }

        Ok(results)
    }
}

enum EventOutcome {
    Processed,
    Deduplicated,
    Failed(EventFailure),
}

/// Pull the user id out of an event payload. Both `userId` and `user_id`
/// spellings occur in the wild; an empty string counts as missing.
fn extract_user_id(payload_json: &str) -> Option<UserId> {
    let payload: Value = serde_json::from_str(payload_json).ok()?;
    let raw = payload
        .get("userId")
        .or_else(|| payload.get("user_id"))
        .and_then(Value::as_str)?
        .trim();
    if raw.is_empty() {
        return None;
    }
    Some(UserId(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use uuid::Uuid;

    use skipper_core::chrono::{Duration, Utc};
    use skipper_core::domain::autopilot::AutopilotRunStatus;
    use skipper_core::domain::outbox::{OutboxEvent, OutboxEventId};

    use skipper_db::repositories::{
        AutopilotRunRepository, InMemoryAutopilotRunRepository, InMemoryOutboxRepository,
        OutboxRepository,
    };

    use crate::limiter::RateLimiter;
    use crate::llm::{LlmError, MockLlm};
    use crate::registry::{EchoTool, ToolRegistry};

    use super::{extract_user_id, AutopilotRunner, ExecuteOptions, BACKOFF_MINUTES};

    const PLAN: &str = r#"{"summary": "greet", "actions": [{"tool": "echo", "args": {"text": "hi"}}]}"#;

    struct Harness {
        runner: AutopilotRunner,
        outbox: Arc<InMemoryOutboxRepository>,
        runs: Arc<InMemoryAutopilotRunRepository>,
    }

    fn harness(llm: MockLlm, max_retries: u32) -> Harness {
        let outbox = Arc::new(InMemoryOutboxRepository::new());
        let runs = Arc::new(InMemoryAutopilotRunRepository::new());

        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);

        let runner = AutopilotRunner::new(
            Arc::clone(&outbox) as Arc<dyn OutboxRepository>,
            Arc::clone(&runs) as Arc<dyn AutopilotRunRepository>,
            Arc::new(registry),
            Arc::new(llm),
            Arc::new(RateLimiter::disabled()),
            max_retries,
        );

        Harness { runner, outbox, runs }
    }

    fn event(event_type: &str, payload: serde_json::Value, dedup_key: &str) -> OutboxEvent {
        OutboxEvent::new(
            OutboxEventId(Uuid::new_v4().to_string()),
            event_type,
            payload.to_string(),
            dedup_key,
        )
    }

    #[tokio::test]
    async fn a_leased_event_becomes_a_completed_autopilot_run() {
        let h = harness(MockLlm::replying(vec![PLAN]), 5);
        let evt = event("submission.evaluated", json!({"userId": "user-1"}), "sub-1");
        h.outbox.enqueue(evt.clone()).await.expect("enqueue");

        let report = h.runner.execute(ExecuteOptions::batch(10)).await.expect("cycle");
        assert_eq!(report.leased, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 0);

        let run = h.runs.find_by_trigger_key("sub-1").await.expect("query").expect("run");
        assert_eq!(run.status, AutopilotRunStatus::Completed);
        assert!(run.plan_json.as_deref().expect("plan").contains("echo"));
        assert!(run.result_json.as_deref().expect("result").contains("hi"));

        let settled = h.outbox.find_by_id(&evt.id).await.expect("query").expect("event");
        assert!(settled.processed_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_trigger_keys_process_the_work_once() {
        let h = harness(MockLlm::replying(vec![PLAN, PLAN]), 5);
        h.outbox
            .enqueue(event("submission.evaluated", json!({"userId": "user-1"}), "sub-1"))
            .await
            .expect("enqueue first");
        h.outbox
            .enqueue(event("submission.evaluated", json!({"userId": "user-1"}), "sub-1"))
            .await
            .expect("enqueue replay");

        let report = h.runner.execute(ExecuteOptions::batch(10)).await.expect("cycle");
        assert_eq!(report.leased, 2);
        assert_eq!(report.processed, 1);
        assert_eq!(report.deduplicated, 1);

        // Both events are settled; neither is leasable again.
        let next = h.runner.execute(ExecuteOptions::batch(10)).await.expect("second cycle");
        assert_eq!(next.leased, 0);
    }

    #[tokio::test]
    async fn unknown_event_type_dead_letters_immediately() {
        let h = harness(MockLlm::replying(vec![PLAN]), 5);
        let evt = event("billing.invoice_paid", json!({"userId": "user-1"}), "inv-1");
        h.outbox.enqueue(evt.clone()).await.expect("enqueue");

        let report = h.runner.execute(ExecuteOptions::batch(10)).await.expect("cycle");
        assert_eq!(report.failed, 1);
        assert_eq!(report.dead_lettered, 1);

        let settled = h.outbox.find_by_id(&evt.id).await.expect("query").expect("event");
        assert!(settled.processed_at.is_some());
        assert_eq!(settled.error_count, 1);
        assert!(settled.last_error.as_deref().expect("error").contains("unknown event type"));
    }

    #[tokio::test]
    async fn missing_or_empty_user_id_dead_letters_immediately() {
        let h = harness(MockLlm::replying(vec![PLAN, PLAN]), 5);
        let no_user = event("manual", json!({"note": "no user"}), "man-1");
        let empty_user = event("manual", json!({"userId": "  "}), "man-2");
        h.outbox.enqueue(no_user.clone()).await.expect("enqueue");
        h.outbox.enqueue(empty_user.clone()).await.expect("enqueue");

        let report = h.runner.execute(ExecuteOptions::batch(10)).await.expect("cycle");
        assert_eq!(report.dead_lettered, 2);
        assert!(h.runs.find_by_trigger_key("man-1").await.expect("query").is_none());
    }

    #[tokio::test]
    async fn transient_failure_schedules_backoff_and_a_retry_succeeds() {
        let now = Utc::now();
        let h = harness(
            MockLlm::scripted(vec![
                Err(LlmError::Exhausted("providers down".into())),
                Ok(PLAN.to_string()),
            ]),
            5,
        );
        let evt = event("manual", json!({"user_id": "user-2"}), "man-3");
        h.outbox.enqueue(evt.clone()).await.expect("enqueue");

        let report =
            h.runner.execute(ExecuteOptions { limit: 10, now }).await.expect("first cycle");
        assert_eq!(report.failed, 1);
        assert_eq!(report.dead_lettered, 0);

        let pending = h.outbox.find_by_id(&evt.id).await.expect("query").expect("event");
        assert!(pending.processed_at.is_none());
        assert_eq!(pending.error_count, 1);
        assert_eq!(
            pending.next_retry_at.expect("retry scheduled"),
            now + Duration::minutes(BACKOFF_MINUTES[0])
        );

        // The run row is failed, so the retry re-executes it in place.
        let failed_run =
            h.runs.find_by_trigger_key("man-3").await.expect("query").expect("run");
        assert_eq!(failed_run.status, AutopilotRunStatus::Failed);

        // Before the retry window nothing is leasable.
        let early =
            h.runner.execute(ExecuteOptions { limit: 10, now }).await.expect("early cycle");
        assert_eq!(early.leased, 0);

        let later = now + Duration::minutes(BACKOFF_MINUTES[0]);
        let retry = h
            .runner
            .execute(ExecuteOptions { limit: 10, now: later })
            .await
            .expect("retry cycle");
        assert_eq!(retry.processed, 1);

        let recovered =
            h.runs.find_by_trigger_key("man-3").await.expect("query").expect("run");
        assert_eq!(recovered.status, AutopilotRunStatus::Completed);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_dead_letters_the_event() {
        let h = harness(
            MockLlm::scripted(vec![Err(LlmError::Exhausted("still down".into()))]),
            1,
        );
        let evt = event("manual", json!({"userId": "user-3"}), "man-4");
        h.outbox.enqueue(evt.clone()).await.expect("enqueue");

        let report = h.runner.execute(ExecuteOptions::batch(10)).await.expect("cycle");
        assert_eq!(report.failed, 1);
        assert_eq!(report.dead_lettered, 1);

        let settled = h.outbox.find_by_id(&evt.id).await.expect("query").expect("event");
        assert!(settled.processed_at.is_some());
    }

    #[tokio::test]
    async fn backoff_schedule_grows_with_the_error_count() {
        let now = Utc::now();
        let h = harness(
            MockLlm::scripted(vec![
                Err(LlmError::Exhausted("down".into())),
                Err(LlmError::Exhausted("down".into())),
            ]),
            10,
        );
        let evt = event("manual", json!({"userId": "user-4"}), "man-5");
        h.outbox.enqueue(evt.clone()).await.expect("enqueue");

        h.runner.execute(ExecuteOptions { limit: 10, now }).await.expect("first cycle");
        let after_first = now + Duration::minutes(BACKOFF_MINUTES[0]);
        h.runner
            .execute(ExecuteOptions { limit: 10, now: after_first })
            .await
            .expect("second cycle");

        let pending = h.outbox.find_by_id(&evt.id).await.expect("query").expect("event");
        assert_eq!(pending.error_count, 2);
        assert_eq!(
            pending.next_retry_at.expect("retry scheduled"),
            after_first + Duration::minutes(BACKOFF_MINUTES[1])
        );
    }

    #[tokio::test]
    async fn side_effect_tools_run_without_confirmation_under_autopilot() {
        // The runner's guard is auto-approving; the plan below would pause
        // an interactive run.
        let h = harness(
            MockLlm::replying(vec![
                r#"{"summary": "hallucinated", "actions": [{"tool": "vanish", "args": {}}]}"#,
            ]),
            5,
        );
        let evt = event("manual", json!({"userId": "user-5"}), "man-6");
        h.outbox.enqueue(evt.clone()).await.expect("enqueue");

        // Unknown tools are still blocked even when auto-approving.
        let report = h.runner.execute(ExecuteOptions::batch(10)).await.expect("cycle");
        assert_eq!(report.failed, 1);
        let run = h.runs.find_by_trigger_key("man-6").await.expect("query").expect("run");
        assert_eq!(run.status, AutopilotRunStatus::Failed);
        assert!(run.error_message.as_deref().expect("error").contains("unknown_tool"));
    }

    #[test]
    fn user_id_extraction_accepts_both_spellings() {
        assert_eq!(
            extract_user_id(r#"{"userId": "user-1"}"#).map(|user| user.0),
            Some("user-1".to_string())
        );
        assert_eq!(
            extract_user_id(r#"{"user_id": "user-2"}"#).map(|user| user.0),
            Some("user-2".to_string())
        );
        assert_eq!(extract_user_id(r#"{"userId": ""}"#), None);
        assert_eq!(extract_user_id("not json"), None);
    }
}
