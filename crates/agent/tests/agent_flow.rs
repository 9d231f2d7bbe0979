//! End-to-end exercises of the agent crate through its public surface:
//! an interactive run from goal to final answer, the confirmation pause
//! and resume, and an outbox cycle feeding the autopilot.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use skipper_agent::{
    AgentRuntime, AutopilotRunner, EchoTool, ExecuteOptions, MockLlm, RateLimiter, Router,
    RunOutcome, SafetyGuard, ToolRegistry,
};
use skipper_core::domain::autopilot::AutopilotRunStatus;
use skipper_core::domain::invocation::InvocationStatus;
use skipper_core::domain::outbox::{OutboxEvent, OutboxEventId};
use skipper_core::domain::run::{AgentMode, RunStatus, UserId};
use skipper_core::domain::step::StepKind;
use skipper_db::repositories::{
    AgentRunRepository, AuditTrailRepository, AutopilotRunRepository,
    InMemoryAgentRunRepository, InMemoryAuditTrailRepository, InMemoryAutopilotRunRepository,
    InMemoryInvocationRepository, InMemoryOutboxRepository, InvocationRepository,
    OutboxRepository,
};

fn registry() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    Arc::new(registry)
}

fn runtime(
    llm: MockLlm,
    runs: &Arc<InMemoryAgentRunRepository>,
    invocations: &Arc<InMemoryInvocationRepository>,
    audit: &Arc<InMemoryAuditTrailRepository>,
) -> AgentRuntime {
    AgentRuntime::new(
        Arc::clone(runs) as Arc<dyn AgentRunRepository>,
        Arc::clone(invocations) as Arc<dyn InvocationRepository>,
        Arc::clone(audit) as Arc<dyn AuditTrailRepository>,
        registry(),
        SafetyGuard::new(),
        Router::new("mock", "scripted"),
        Arc::new(llm),
        Arc::new(RateLimiter::disabled()),
        6,
    )
}

#[tokio::test]
async fn interactive_run_reaches_a_final_answer_with_full_audit_trail() {
    let runs = Arc::new(InMemoryAgentRunRepository::new());
    let invocations = Arc::new(InMemoryInvocationRepository::new());
    let audit = Arc::new(InMemoryAuditTrailRepository::new());

    let llm = MockLlm::replying(vec![
        r#"{"stage": "plan", "thought": "echo the greeting",
            "tool_calls": [{"tool": "echo", "args": {"text": "hello there"}}],
            "claims": [{"claim": "the user wants a greeting echoed", "confidence": 0.95}]}"#,
        r#"{"stage": "final", "message": "Echoed your greeting.",
            "hints": ["try a longer message next time"], "questions": []}"#,
    ]);
    let runtime = runtime(llm, &runs, &invocations, &audit);

    let run = runtime
        .create_run(UserId("user-1".into()), AgentMode::Generic, "echo hello there", None)
        .await
        .expect("create run");
    let outcome = runtime.run(&run.id).await.expect("run to completion");

    let RunOutcome::Completed(completed) = outcome else {
        panic!("expected a completed run");
    };
    assert_eq!(completed.status, RunStatus::Completed);
    assert!(completed.started_at.is_some());
    assert!(completed.finished_at.is_some());

    // Plan, act, final: at least three steps, gap-free and in order.
    let steps = runs.list_steps(&run.id).await.expect("list steps");
    assert!(steps.len() >= 3);
    assert_eq!(steps[0].kind, StepKind::Plan);
    assert_eq!(steps.last().expect("final step").kind, StepKind::Final);
    for (expected, step) in steps.iter().enumerate() {
        assert_eq!(step.step_index as usize, expected);
    }

    let recorded = invocations.list_for_run(&run.id).await.expect("invocations");
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].status, InvocationStatus::Executed);
    assert!(recorded[0].result_json.as_deref().expect("result").contains("hello there"));

    assert_eq!(audit.list_safety_decisions(&run.id).await.expect("safety").len(), 1);
    assert_eq!(audit.list_routing_decisions(&run.id).await.expect("routing").len(), 1);
    assert_eq!(audit.list_evidence(&run.id).await.expect("evidence").len(), 1);
}

#[tokio::test]
async fn confirmation_pause_resumes_through_the_public_surface() {
    struct WipeTool;

    #[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
    struct WipeArgs {
        #[allow(dead_code)]
        target: String,
        #[serde(default)]
        #[allow(dead_code)]
        user_id: Option<String>,
    }

    #[derive(Debug, serde::Serialize, schemars::JsonSchema)]
    struct WipeOutput {
        wiped: bool,
    }

    #[async_trait::async_trait]
    impl skipper_agent::TypedTool for WipeTool {
        type Args = WipeArgs;
        type Output = WipeOutput;

        fn name(&self) -> &str {
            "wipe_board"
        }

        fn description(&self) -> &str {
            "Clears the user's planning board."
        }

        fn permission(&self) -> skipper_agent::ToolPermission {
            skipper_agent::ToolPermission::Write
        }

        fn side_effects(&self) -> bool {
            true
        }

        async fn run(
            &self,
            _ctx: &skipper_agent::ToolContext,
            _args: WipeArgs,
        ) -> Result<WipeOutput, skipper_agent::ToolError> {
            Ok(WipeOutput { wiped: true })
        }
    }

    let runs = Arc::new(InMemoryAgentRunRepository::new());
    let invocations = Arc::new(InMemoryInvocationRepository::new());
    let audit = Arc::new(InMemoryAuditTrailRepository::new());

    let mut tools = ToolRegistry::new();
    tools.register(WipeTool);

    let llm = MockLlm::replying(vec![
        r#"{"stage": "plan", "tool_calls": [{"tool": "wipe_board", "args": {"target": "all"}}]}"#,
        r#"{"stage": "final", "message": "Board wiped."}"#,
    ]);
    let runtime = AgentRuntime::new(
        Arc::clone(&runs) as Arc<dyn AgentRunRepository>,
        Arc::clone(&invocations) as Arc<dyn InvocationRepository>,
        Arc::clone(&audit) as Arc<dyn AuditTrailRepository>,
        Arc::new(tools),
        SafetyGuard::new(),
        Router::new("mock", "scripted"),
        Arc::new(llm),
        Arc::new(RateLimiter::disabled()),
        6,
    );

    let run = runtime
        .create_run(UserId("user-1".into()), AgentMode::Coach, "wipe my board", None)
        .await
        .expect("create run");

    let RunOutcome::AwaitingConfirmation { run: paused, pending } =
        runtime.run(&run.id).await.expect("run until pause")
    else {
        panic!("expected a confirmation pause");
    };
    assert_eq!(paused.status, RunStatus::Running);
    assert_eq!(pending.len(), 1);

    let confirmed = runtime.confirm_invocation(&pending[0], true).await.expect("confirm");
    assert_eq!(confirmed.status, InvocationStatus::Executed);

    let RunOutcome::Completed(completed) =
        runtime.continue_run(&run.id).await.expect("continue")
    else {
        panic!("expected completion after confirmation");
    };
    assert!(completed.result_json.as_deref().expect("result").contains("Board wiped"));
}

#[tokio::test]
async fn outbox_cycle_feeds_the_autopilot_and_replays_are_idempotent() {
    let outbox = Arc::new(InMemoryOutboxRepository::new());
    let autopilot_runs = Arc::new(InMemoryAutopilotRunRepository::new());

    let llm = MockLlm::replying(vec![
        r#"{"summary": "acknowledge the evaluation",
            "actions": [{"tool": "echo", "args": {"text": "evaluation received"}}]}"#,
    ]);
    let runner = AutopilotRunner::new(
        Arc::clone(&outbox) as Arc<dyn OutboxRepository>,
        Arc::clone(&autopilot_runs) as Arc<dyn AutopilotRunRepository>,
        registry(),
        Arc::new(llm),
        Arc::new(RateLimiter::disabled()),
        5,
    );

    let original = OutboxEvent::new(
        OutboxEventId(Uuid::new_v4().to_string()),
        "submission.evaluated",
        json!({"userId": "user-1", "submissionId": "sub-42"}).to_string(),
        "autopilot:submission_evaluated:sub-42",
    );
    let replay = OutboxEvent::new(
        OutboxEventId(Uuid::new_v4().to_string()),
        "submission.evaluated",
        json!({"userId": "user-1", "submissionId": "sub-42"}).to_string(),
        "autopilot:submission_evaluated:sub-42",
    );
    outbox.enqueue(original.clone()).await.expect("enqueue original");
    outbox.enqueue(replay.clone()).await.expect("enqueue replay");

    let report = runner.execute(ExecuteOptions::batch(10)).await.expect("cycle");
    assert_eq!(report.leased, 2);
    assert_eq!(report.processed, 1);
    assert_eq!(report.deduplicated, 1);
    assert_eq!(report.failed, 0);

    let run = autopilot_runs
        .find_by_trigger_key("autopilot:submission_evaluated:sub-42")
        .await
        .expect("query")
        .expect("run exists");
    assert_eq!(run.status, AutopilotRunStatus::Completed);
    assert!(run.result_json.as_deref().expect("result").contains("evaluation received"));

    // Both events settled: a later cycle leases nothing.
    for id in [&original.id, &replay.id] {
        let settled = outbox.find_by_id(id).await.expect("query").expect("event");
        assert!(settled.processed_at.is_some());
    }
    let quiet = runner.execute(ExecuteOptions::batch(10)).await.expect("quiet cycle");
    assert_eq!(quiet.leased, 0);
}
