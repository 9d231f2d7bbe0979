use async_trait::async_trait;
use thiserror::Error;

use skipper_core::chrono::{DateTime, Utc};
use skipper_core::domain::autopilot::{AutopilotRun, AutopilotRunId};
use skipper_core::domain::decision::{RoutingDecision, SafetyDecision};
use skipper_core::domain::evidence::Evidence;
use skipper_core::domain::invocation::{ToolInvocation, ToolInvocationId};
use skipper_core::domain::outbox::{OutboxEvent, OutboxEventId};
use skipper_core::domain::run::{AgentRun, AgentRunId};
use skipper_core::domain::step::AgentStep;

pub mod agent_run;
pub mod audit;
pub mod invocation;
pub mod memory;
pub mod outbox;

pub use agent_run::SqlAgentRunRepository;
pub use audit::SqlAuditTrailRepository;
pub use invocation::SqlInvocationRepository;
pub use memory::{
    InMemoryAgentRunRepository, InMemoryAuditTrailRepository, InMemoryAutopilotRunRepository,
    InMemoryInvocationRepository, InMemoryOutboxRepository,
};
pub use outbox::{SqlAutopilotRunRepository, SqlOutboxRepository};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait AgentRunRepository: Send + Sync {
    async fn find_by_id(&self, id: &AgentRunId) -> Result<Option<AgentRun>, RepositoryError>;

    /// Upserts the full run row; status transitions are validated by the
    /// caller before reaching the repository.
    async fn save(&self, run: AgentRun) -> Result<(), RepositoryError>;

    async fn append_step(&self, step: AgentStep) -> Result<(), RepositoryError>;

    /// Steps ordered by `step_index` ascending.
    async fn list_steps(&self, run_id: &AgentRunId) -> Result<Vec<AgentStep>, RepositoryError>;

    /// Patches the output of an existing step; used once per run at most,
    /// when a continuation fills in the output of the step that paused.
    async fn update_step_output(
        &self,
        run_id: &AgentRunId,
        step_index: u32,
        output_json: &str,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait InvocationRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &ToolInvocationId,
    ) -> Result<Option<ToolInvocation>, RepositoryError>;

    async fn save(&self, invocation: ToolInvocation) -> Result<(), RepositoryError>;

    async fn list_for_run(
        &self,
        run_id: &AgentRunId,
    ) -> Result<Vec<ToolInvocation>, RepositoryError>;
}

#[async_trait]
pub trait AuditTrailRepository: Send + Sync {
    async fn record_safety_decision(
        &self,
        decision: SafetyDecision,
    ) -> Result<(), RepositoryError>;

    async fn record_routing_decision(
        &self,
        decision: RoutingDecision,
    ) -> Result<(), RepositoryError>;

    async fn append_evidence(&self, evidence: Evidence) -> Result<(), RepositoryError>;

    async fn list_safety_decisions(
        &self,
        run_id: &AgentRunId,
    ) -> Result<Vec<SafetyDecision>, RepositoryError>;

    async fn list_routing_decisions(
        &self,
        run_id: &AgentRunId,
    ) -> Result<Vec<RoutingDecision>, RepositoryError>;

    async fn list_evidence(&self, run_id: &AgentRunId)
        -> Result<Vec<Evidence>, RepositoryError>;
}

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    async fn enqueue(&self, event: OutboxEvent) -> Result<(), RepositoryError>;

    async fn find_by_id(
        &self,
        id: &OutboxEventId,
    ) -> Result<Option<OutboxEvent>, RepositoryError>;

    /// Unprocessed events whose retry window has elapsed, oldest first,
    /// at most `limit` of them.
    async fn lease_next_batch(
        &self,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>, RepositoryError>;

    async fn mark_processed(
        &self,
        id: &OutboxEventId,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    /// Increments `error_count`, records the error text, and schedules
    /// the next attempt. Pass `None` to retry immediately on the next poll.
    async fn record_failure(
        &self,
        id: &OutboxEventId,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait AutopilotRunRepository: Send + Sync {
    /// Inserts a queued run unless one already exists for its trigger key.
    /// Returns `None` on conflict, which is how outbox replays stay
    /// idempotent.
    async fn create_queued(
        &self,
        run: AutopilotRun,
    ) -> Result<Option<AutopilotRun>, RepositoryError>;

    async fn find_by_id(
        &self,
        id: &AutopilotRunId,
    ) -> Result<Option<AutopilotRun>, RepositoryError>;

    async fn find_by_trigger_key(
        &self,
        trigger_key: &str,
    ) -> Result<Option<AutopilotRun>, RepositoryError>;

    /// Upserts by id; used for status and result updates after creation.
    async fn save(&self, run: AutopilotRun) -> Result<(), RepositoryError>;
}
