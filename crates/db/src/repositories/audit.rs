use sqlx::{sqlite::SqliteRow, Row};

use skipper_core::domain::decision::{
    RoutingDecision, RoutingDecisionId, SafetyDecision, SafetyDecisionId, SafetyVerdict,
};
use skipper_core::domain::evidence::{Evidence, EvidenceId, EvidenceSource};
use skipper_core::domain::invocation::ToolInvocationId;
use skipper_core::domain::run::AgentRunId;

use super::agent_run::{parse_timestamp, parse_u32};
use super::{AuditTrailRepository, RepositoryError};
use crate::DbPool;

/// Safety decisions, routing decisions, and evidence are append-only;
/// nothing in here updates an existing row.
pub struct SqlAuditTrailRepository {
    pool: DbPool,
}

impl SqlAuditTrailRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AuditTrailRepository for SqlAuditTrailRepository {
    async fn record_safety_decision(
        &self,
        decision: SafetyDecision,
    ) -> Result<(), RepositoryError> {
        let reasons_json = serde_json::to_string(&decision.reasons)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        sqlx::query(
            "INSERT INTO safety_decision (
                id,
                run_id,
                invocation_id,
                verdict,
                reasons_json,
                feedback,
                decided_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&decision.id.0)
        .bind(&decision.run_id.0)
        .bind(&decision.invocation_id.0)
        .bind(decision.verdict.as_str())
        .bind(&reasons_json)
        .bind(decision.feedback.as_deref())
        .bind(decision.decided_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_routing_decision(
        &self,
        decision: RoutingDecision,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO routing_decision (
                id,
                run_id,
                step_index,
                provider,
                model,
                toolset,
                reason,
                decided_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&decision.id.0)
        .bind(&decision.run_id.0)
        .bind(decision.step_index.map(i64::from))
        .bind(&decision.provider)
        .bind(&decision.model)
        .bind(&decision.toolset)
        .bind(&decision.reason)
        .bind(decision.decided_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_evidence(&self, evidence: Evidence) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO evidence (
                id,
                run_id,
                claim,
                source,
                confidence,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&evidence.id.0)
        .bind(&evidence.run_id.0)
        .bind(&evidence.claim)
        .bind(evidence.source.as_str())
        .bind(evidence.confidence)
        .bind(evidence.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_safety_decisions(
        &self,
        run_id: &AgentRunId,
    ) -> Result<Vec<SafetyDecision>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, run_id, invocation_id, verdict, reasons_json, feedback, decided_at
             FROM safety_decision
             WHERE run_id = ?
             ORDER BY decided_at ASC",
        )
        .bind(&run_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(safety_decision_from_row).collect()
    }

    async fn list_routing_decisions(
        &self,
        run_id: &AgentRunId,
    ) -> Result<Vec<RoutingDecision>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, run_id, step_index, provider, model, toolset, reason, decided_at
             FROM routing_decision
             WHERE run_id = ?
             ORDER BY decided_at ASC",
        )
        .bind(&run_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(routing_decision_from_row).collect()
    }

    async fn list_evidence(
        &self,
        run_id: &AgentRunId,
    ) -> Result<Vec<Evidence>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, run_id, claim, source, confidence, created_at
             FROM evidence
             WHERE run_id = ?
             ORDER BY created_at ASC",
        )
        .bind(&run_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(evidence_from_row).collect()
    }
}

fn safety_decision_from_row(row: SqliteRow) -> Result<SafetyDecision, RepositoryError> {
    let verdict_raw = row.try_get::<String, _>("verdict")?;
    let verdict = SafetyVerdict::parse(&verdict_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown safety verdict `{verdict_raw}`"))
    })?;

    let reasons_json = row.try_get::<String, _>("reasons_json")?;
    let reasons: Vec<String> = serde_json::from_str(&reasons_json)
        .map_err(|error| RepositoryError::Decode(format!("invalid reasons_json: {error}")))?;

    Ok(SafetyDecision {
        id: SafetyDecisionId(row.try_get("id")?),
        run_id: AgentRunId(row.try_get("run_id")?),
        invocation_id: ToolInvocationId(row.try_get("invocation_id")?),
        verdict,
        reasons,
        feedback: row.try_get("feedback")?,
        decided_at: parse_timestamp("decided_at", row.try_get("decided_at")?)?,
    })
}

fn routing_decision_from_row(row: SqliteRow) -> Result<RoutingDecision, RepositoryError> {
    let step_index = row
        .try_get::<Option<i64>, _>("step_index")?
        .map(|value| parse_u32("step_index", value))
        .transpose()?;

    Ok(RoutingDecision {
        id: RoutingDecisionId(row.try_get("id")?),
        run_id: AgentRunId(row.try_get("run_id")?),
        step_index,
        provider: row.try_get("provider")?,
        model: row.try_get("model")?,
        toolset: row.try_get("toolset")?,
        reason: row.try_get("reason")?,
        decided_at: parse_timestamp("decided_at", row.try_get("decided_at")?)?,
    })
}

fn evidence_from_row(row: SqliteRow) -> Result<Evidence, RepositoryError> {
    let source_raw = row.try_get::<String, _>("source")?;
    let source = EvidenceSource::parse(&source_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown evidence source `{source_raw}`"))
    })?;

    Ok(Evidence {
        id: EvidenceId(row.try_get("id")?),
        run_id: AgentRunId(row.try_get("run_id")?),
        claim: row.try_get("claim")?,
        source,
        confidence: row.try_get("confidence")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use skipper_core::chrono::{DateTime, Utc};
    use skipper_core::domain::decision::{
        RoutingDecision, RoutingDecisionId, SafetyDecision, SafetyDecisionId, SafetyVerdict,
    };
    use skipper_core::domain::evidence::{Evidence, EvidenceId, EvidenceSource};
    use skipper_core::domain::invocation::{ToolInvocation, ToolInvocationId};
    use skipper_core::domain::run::{AgentMode, AgentRun, AgentRunId, RunStatus, UserId};

    use super::SqlAuditTrailRepository;
    use crate::migrations;
    use crate::repositories::{
        AgentRunRepository, AuditTrailRepository, InvocationRepository, SqlAgentRunRepository,
        SqlInvocationRepository,
    };
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn audit_trail_round_trips_all_record_kinds() {
        let pool = setup_pool().await;
        let run_id = AgentRunId("run-audit-001".to_string());

        SqlAgentRunRepository::new(pool.clone())
            .save(AgentRun {
                id: run_id.clone(),
                user_id: UserId("user-1".to_string()),
                mode: AgentMode::Coach,
                goal: "goal".to_string(),
                input_json: None,
                status: RunStatus::Running,
                result_json: None,
                error_message: None,
                created_at: parse_ts("2026-03-01T09:00:00Z"),
                started_at: Some(parse_ts("2026-03-01T09:00:01Z")),
                finished_at: None,
            })
            .await
            .expect("insert run");

        let invocation_id = ToolInvocationId("inv-audit-1".to_string());
        SqlInvocationRepository::new(pool.clone())
            .save(ToolInvocation::pending(
                invocation_id.clone(),
                run_id.clone(),
                0,
                "send_message",
                "{}",
            ))
            .await
            .expect("insert invocation");

        let repo = SqlAuditTrailRepository::new(pool.clone());

        let safety = SafetyDecision {
            id: SafetyDecisionId("sd-1".to_string()),
            run_id: run_id.clone(),
            invocation_id,
            verdict: SafetyVerdict::NeedsConfirmation,
            reasons: vec!["side_effects".to_string(), "untrusted_args".to_string()],
            feedback: Some("message delivery requires confirmation".to_string()),
            decided_at: parse_ts("2026-03-01T09:00:02Z"),
        };
        repo.record_safety_decision(safety.clone()).await.expect("record safety decision");

        let routing = RoutingDecision {
            id: RoutingDecisionId("rd-1".to_string()),
            run_id: run_id.clone(),
            step_index: Some(0),
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            toolset: "coach".to_string(),
            reason: "mode default".to_string(),
            decided_at: parse_ts("2026-03-01T09:00:02Z"),
        };
        repo.record_routing_decision(routing.clone()).await.expect("record routing decision");

        let evidence = Evidence {
            id: EvidenceId("ev-1".to_string()),
            run_id: run_id.clone(),
            claim: "user completed three submissions this week".to_string(),
            source: EvidenceSource::ToolResult,
            confidence: Some(0.9),
            created_at: parse_ts("2026-03-01T09:00:03Z"),
        };
        repo.append_evidence(evidence.clone()).await.expect("append evidence");

        assert_eq!(
            repo.list_safety_decisions(&run_id).await.expect("list safety"),
            vec![safety]
        );
        assert_eq!(
            repo.list_routing_decisions(&run_id).await.expect("list routing"),
            vec![routing]
        );
        assert_eq!(repo.list_evidence(&run_id).await.expect("list evidence"), vec![evidence]);

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}
