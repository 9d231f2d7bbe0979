//! In-memory repository implementations.
//!
//! Behavior-equivalent stand-ins for the Sql* repositories, used by the
//! agent crate's unit and integration tests where a database pool would
//! only add noise. Locking is a plain `std::sync::Mutex`; no lock is held
//! across an await point.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use skipper_core::chrono::{DateTime, Utc};
use skipper_core::domain::autopilot::{AutopilotRun, AutopilotRunId};
use skipper_core::domain::decision::{RoutingDecision, SafetyDecision};
use skipper_core::domain::evidence::Evidence;
use skipper_core::domain::invocation::{ToolInvocation, ToolInvocationId};
use skipper_core::domain::outbox::{OutboxEvent, OutboxEventId};
use skipper_core::domain::run::{AgentRun, AgentRunId};
use skipper_core::domain::step::AgentStep;

use super::{
    AgentRunRepository, AuditTrailRepository, AutopilotRunRepository, InvocationRepository,
    OutboxRepository, RepositoryError,
};

#[derive(Default)]
pub struct InMemoryAgentRunRepository {
    runs: Mutex<HashMap<String, AgentRun>>,
    steps: Mutex<HashMap<String, Vec<AgentStep>>>,
}

impl InMemoryAgentRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentRunRepository for InMemoryAgentRunRepository {
    async fn find_by_id(&self, id: &AgentRunId) -> Result<Option<AgentRun>, RepositoryError> {
        Ok(self.runs.lock().expect("runs lock").get(&id.0).cloned())
    }

    async fn save(&self, run: AgentRun) -> Result<(), RepositoryError> {
        self.runs.lock().expect("runs lock").insert(run.id.0.clone(), run);
        Ok(())
    }

    async fn append_step(&self, step: AgentStep) -> Result<(), RepositoryError> {
        let mut steps = self.steps.lock().expect("steps lock");
        let entries = steps.entry(step.run_id.0.clone()).or_default();
        if entries.iter().any(|existing| existing.step_index == step.step_index) {
            return Err(RepositoryError::Decode(format!(
                "duplicate step index {} for run `{}`",
                step.step_index, step.run_id.0
            )));
        }
        entries.push(step);
        entries.sort_by_key(|entry| entry.step_index);
        Ok(())
    }

    async fn list_steps(&self, run_id: &AgentRunId) -> Result<Vec<AgentStep>, RepositoryError> {
        Ok(self.steps.lock().expect("steps lock").get(&run_id.0).cloned().unwrap_or_default())
    }

    async fn update_step_output(
        &self,
        run_id: &AgentRunId,
        step_index: u32,
        output_json: &str,
    ) -> Result<(), RepositoryError> {
        let mut steps = self.steps.lock().expect("steps lock");
        if let Some(entries) = steps.get_mut(&run_id.0) {
            if let Some(step) = entries.iter_mut().find(|step| step.step_index == step_index) {
                step.output_json = Some(output_json.to_string());
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryInvocationRepository {
    invocations: Mutex<HashMap<String, ToolInvocation>>,
}

impl InMemoryInvocationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvocationRepository for InMemoryInvocationRepository {
    async fn find_by_id(
        &self,
        id: &ToolInvocationId,
    ) -> Result<Option<ToolInvocation>, RepositoryError> {
        Ok(self.invocations.lock().expect("invocations lock").get(&id.0).cloned())
    }

    async fn save(&self, invocation: ToolInvocation) -> Result<(), RepositoryError> {
        self.invocations
            .lock()
            .expect("invocations lock")
            .insert(invocation.id.0.clone(), invocation);
        Ok(())
    }

    async fn list_for_run(
        &self,
        run_id: &AgentRunId,
    ) -> Result<Vec<ToolInvocation>, RepositoryError> {
        let mut listed: Vec<ToolInvocation> = self
            .invocations
            .lock()
            .expect("invocations lock")
            .values()
            .filter(|invocation| invocation.run_id == *run_id)
            .cloned()
            .collect();
        listed.sort_by(|a, b| {
            a.step_index.cmp(&b.step_index).then(a.created_at.cmp(&b.created_at))
        });
        Ok(listed)
    }
}

#[derive(Default)]
pub struct InMemoryAuditTrailRepository {
    safety: Mutex<Vec<SafetyDecision>>,
    routing: Mutex<Vec<RoutingDecision>>,
    evidence: Mutex<Vec<Evidence>>,
}

impl InMemoryAuditTrailRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditTrailRepository for InMemoryAuditTrailRepository {
    async fn record_safety_decision(
        &self,
        decision: SafetyDecision,
    ) -> Result<(), RepositoryError> {
        self.safety.lock().expect("safety lock").push(decision);
        Ok(())
    }

    async fn record_routing_decision(
        &self,
        decision: RoutingDecision,
    ) -> Result<(), RepositoryError> {
        self.routing.lock().expect("routing lock").push(decision);
        Ok(())
    }

    async fn append_evidence(&self, evidence: Evidence) -> Result<(), RepositoryError> {
        self.evidence.lock().expect("evidence lock").push(evidence);
        Ok(())
    }

    async fn list_safety_decisions(
        &self,
        run_id: &AgentRunId,
    ) -> Result<Vec<SafetyDecision>, RepositoryError> {
        Ok(self
            .safety
            .lock()
            .expect("safety lock")
            .iter()
            .filter(|decision| decision.run_id == *run_id)
            .cloned()
            .collect())
    }

    async fn list_routing_decisions(
        &self,
        run_id: &AgentRunId,
    ) -> Result<Vec<RoutingDecision>, RepositoryError> {
        Ok(self
            .routing
            .lock()
            .expect("routing lock")
            .iter()
            .filter(|decision| decision.run_id == *run_id)
            .cloned()
            .collect())
    }

    async fn list_evidence(
        &self,
        run_id: &AgentRunId,
    ) -> Result<Vec<Evidence>, RepositoryError> {
        Ok(self
            .evidence
            .lock()
            .expect("evidence lock")
            .iter()
            .filter(|evidence| evidence.run_id == *run_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryOutboxRepository {
    events: Mutex<HashMap<String, OutboxEvent>>,
}

impl InMemoryOutboxRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    async fn enqueue(&self, event: OutboxEvent) -> Result<(), RepositoryError> {
        self.events.lock().expect("events lock").insert(event.id.0.clone(), event);
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &OutboxEventId,
    ) -> Result<Option<OutboxEvent>, RepositoryError> {
        Ok(self.events.lock().expect("events lock").get(&id.0).cloned())
    }

    async fn lease_next_batch(
        &self,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>, RepositoryError> {
        let mut leasable: Vec<OutboxEvent> = self
            .events
            .lock()
            .expect("events lock")
            .values()
            .filter(|event| event.is_leasable(now))
            .cloned()
            .collect();
        leasable.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        leasable.truncate(limit as usize);
        Ok(leasable)
    }

    async fn mark_processed(
        &self,
        id: &OutboxEventId,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        if let Some(event) = self.events.lock().expect("events lock").get_mut(&id.0) {
            event.processed_at = Some(now);
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        id: &OutboxEventId,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        if let Some(event) = self.events.lock().expect("events lock").get_mut(&id.0) {
            event.error_count += 1;
            event.last_error = Some(error.to_string());
            event.next_retry_at = next_retry_at;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryAutopilotRunRepository {
    runs: Mutex<HashMap<String, AutopilotRun>>,
}

impl InMemoryAutopilotRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AutopilotRunRepository for InMemoryAutopilotRunRepository {
    async fn create_queued(
        &self,
        run: AutopilotRun,
    ) -> Result<Option<AutopilotRun>, RepositoryError> {
        let mut runs = self.runs.lock().expect("runs lock");
        if runs.values().any(|existing| existing.trigger_key == run.trigger_key) {
            return Ok(None);
        }
        runs.insert(run.id.0.clone(), run.clone());
        Ok(Some(run))
    }

    async fn find_by_id(
        &self,
        id: &AutopilotRunId,
    ) -> Result<Option<AutopilotRun>, RepositoryError> {
        Ok(self.runs.lock().expect("runs lock").get(&id.0).cloned())
    }

    async fn find_by_trigger_key(
        &self,
        trigger_key: &str,
    ) -> Result<Option<AutopilotRun>, RepositoryError> {
        Ok(self
            .runs
            .lock()
            .expect("runs lock")
            .values()
            .find(|run| run.trigger_key == trigger_key)
            .cloned())
    }

    async fn save(&self, run: AutopilotRun) -> Result<(), RepositoryError> {
        self.runs.lock().expect("runs lock").insert(run.id.0.clone(), run);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use skipper_core::chrono::{Duration, Utc};
    use skipper_core::domain::autopilot::{AutopilotRun, AutopilotRunId, TriggerType};
    use skipper_core::domain::outbox::{OutboxEvent, OutboxEventId};
    use skipper_core::domain::run::UserId;

    use super::{InMemoryAutopilotRunRepository, InMemoryOutboxRepository};
    use crate::repositories::{AutopilotRunRepository, OutboxRepository};

    #[tokio::test]
    async fn in_memory_lease_matches_sql_semantics() {
        let repo = InMemoryOutboxRepository::new();
        let now = Utc::now();

        let mut ready = OutboxEvent::new(OutboxEventId("evt-1".into()), "manual", "{}", "k1");
        ready.created_at = now - Duration::minutes(2);
        let mut deferred = OutboxEvent::new(OutboxEventId("evt-2".into()), "manual", "{}", "k2");
        deferred.created_at = now - Duration::minutes(1);

        repo.enqueue(ready).await.expect("enqueue ready");
        repo.enqueue(deferred.clone()).await.expect("enqueue deferred");
        repo.record_failure(&deferred.id, "boom", Some(now + Duration::minutes(5)))
            .await
            .expect("record failure");

        let leased = repo.lease_next_batch(10, now).await.expect("lease");
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id.0, "evt-1");

        repo.mark_processed(&leased[0].id, now).await.expect("mark processed");
        let leased_again = repo.lease_next_batch(10, now).await.expect("lease again");
        assert!(leased_again.is_empty());
    }

    #[tokio::test]
    async fn in_memory_trigger_key_conflict_returns_none() {
        let repo = InMemoryAutopilotRunRepository::new();

        let first = AutopilotRun::queued(
            AutopilotRunId("ap-1".into()),
            "autopilot:manual:k1",
            TriggerType::Manual,
            UserId("user-1".into()),
            None,
        );
        let duplicate = AutopilotRun::queued(
            AutopilotRunId("ap-2".into()),
            "autopilot:manual:k1",
            TriggerType::Manual,
            UserId("user-1".into()),
            None,
        );

        assert!(repo.create_queued(first).await.expect("create first").is_some());
        assert!(repo.create_queued(duplicate).await.expect("create duplicate").is_none());
    }
}
