use sqlx::{sqlite::SqliteRow, Row};

use skipper_core::chrono::{DateTime, Utc};
use skipper_core::domain::autopilot::{
    AutopilotRun, AutopilotRunId, AutopilotRunStatus, TriggerType,
};
use skipper_core::domain::outbox::{OutboxEvent, OutboxEventId};
use skipper_core::domain::run::UserId;

use super::agent_run::{parse_optional_timestamp, parse_timestamp, parse_u32};
use super::{AutopilotRunRepository, OutboxRepository, RepositoryError};
use crate::DbPool;

pub struct SqlOutboxRepository {
    pool: DbPool,
}

impl SqlOutboxRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl OutboxRepository for SqlOutboxRepository {
    async fn enqueue(&self, event: OutboxEvent) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO outbox_event (
                id,
                event_type,
                payload_json,
                dedup_key,
                error_count,
                next_retry_at,
                last_error,
                processed_at,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id.0)
        .bind(&event.event_type)
        .bind(&event.payload_json)
        .bind(&event.dedup_key)
        .bind(i64::from(event.error_count))
        .bind(event.next_retry_at.map(|value| value.to_rfc3339()))
        .bind(event.last_error.as_deref())
        .bind(event.processed_at.map(|value| value.to_rfc3339()))
        .bind(event.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &OutboxEventId,
    ) -> Result<Option<OutboxEvent>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                event_type,
                payload_json,
                dedup_key,
                error_count,
                next_retry_at,
                last_error,
                processed_at,
                created_at
             FROM outbox_event
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(event_from_row).transpose()
    }

    async fn lease_next_batch(
        &self,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                event_type,
                payload_json,
                dedup_key,
                error_count,
                next_retry_at,
                last_error,
                processed_at,
                created_at
             FROM outbox_event
             WHERE processed_at IS NULL
               AND (next_retry_at IS NULL OR next_retry_at <= ?)
             ORDER BY created_at ASC
             LIMIT ?",
        )
        .bind(now.to_rfc3339())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(event_from_row).collect()
    }

    async fn mark_processed(
        &self,
        id: &OutboxEventId,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE outbox_event SET processed_at = ? WHERE id = ?")
            .bind(now.to_rfc3339())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn record_failure(
        &self,
        id: &OutboxEventId,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE outbox_event
             SET error_count = error_count + 1,
                 last_error = ?,
                 next_retry_at = ?
             WHERE id = ?",
        )
        .bind(error)
        .bind(next_retry_at.map(|value| value.to_rfc3339()))
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

pub struct SqlAutopilotRunRepository {
    pool: DbPool,
}

impl SqlAutopilotRunRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AutopilotRunRepository for SqlAutopilotRunRepository {
    async fn create_queued(
        &self,
        run: AutopilotRun,
    ) -> Result<Option<AutopilotRun>, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO autopilot_run (
                id,
                trigger_key,
                trigger_type,
                user_id,
                status,
                context_json,
                plan_json,
                result_json,
                error_message,
                created_at,
                started_at,
                finished_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(trigger_key) DO NOTHING",
        )
        .bind(&run.id.0)
        .bind(&run.trigger_key)
        .bind(run.trigger_type.as_str())
        .bind(&run.user_id.0)
        .bind(run.status.as_str())
        .bind(run.context_json.as_deref())
        .bind(run.plan_json.as_deref())
        .bind(run.result_json.as_deref())
        .bind(run.error_message.as_deref())
        .bind(run.created_at.to_rfc3339())
        .bind(run.started_at.map(|value| value.to_rfc3339()))
        .bind(run.finished_at.map(|value| value.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(run))
    }

    async fn find_by_id(
        &self,
        id: &AutopilotRunId,
    ) -> Result<Option<AutopilotRun>, RepositoryError> {
        let row = sqlx::query(&autopilot_select("id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(autopilot_from_row).transpose()
    }

    async fn find_by_trigger_key(
        &self,
        trigger_key: &str,
    ) -> Result<Option<AutopilotRun>, RepositoryError> {
        let row = sqlx::query(&autopilot_select("trigger_key = ?"))
            .bind(trigger_key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(autopilot_from_row).transpose()
    }

    async fn save(&self, run: AutopilotRun) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO autopilot_run (
                id,
                trigger_key,
                trigger_type,
                user_id,
                status,
                context_json,
                plan_json,
                result_json,
                error_message,
                created_at,
                started_at,
                finished_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                context_json = excluded.context_json,
                plan_json = excluded.plan_json,
                result_json = excluded.result_json,
                error_message = excluded.error_message,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at",
        )
        .bind(&run.id.0)
        .bind(&run.trigger_key)
        .bind(run.trigger_type.as_str())
        .bind(&run.user_id.0)
        .bind(run.status.as_str())
        .bind(run.context_json.as_deref())
        .bind(run.plan_json.as_deref())
        .bind(run.result_json.as_deref())
        .bind(run.error_message.as_deref())
        .bind(run.created_at.to_rfc3339())
        .bind(run.started_at.map(|value| value.to_rfc3339()))
        .bind(run.finished_at.map(|value| value.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn autopilot_select(predicate: &str) -> String {
    format!(
        "SELECT
            id,
            trigger_key,
            trigger_type,
            user_id,
            status,
            context_json,
            plan_json,
            result_json,
            error_message,
            created_at,
            started_at,
            finished_at
         FROM autopilot_run
         WHERE {predicate}"
    )
}

fn event_from_row(row: SqliteRow) -> Result<OutboxEvent, RepositoryError> {
    Ok(OutboxEvent {
        id: OutboxEventId(row.try_get("id")?),
        event_type: row.try_get("event_type")?,
        payload_json: row.try_get("payload_json")?,
        dedup_key: row.try_get("dedup_key")?,
        error_count: parse_u32("error_count", row.try_get("error_count")?)?,
        next_retry_at: parse_optional_timestamp("next_retry_at", row.try_get("next_retry_at")?)?,
        last_error: row.try_get("last_error")?,
        processed_at: parse_optional_timestamp("processed_at", row.try_get("processed_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn autopilot_from_row(row: SqliteRow) -> Result<AutopilotRun, RepositoryError> {
    let trigger_raw = row.try_get::<String, _>("trigger_type")?;
    let trigger_type = TriggerType::parse(&trigger_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown trigger type `{trigger_raw}`"))
    })?;

    let status_raw = row.try_get::<String, _>("status")?;
    let status = AutopilotRunStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown autopilot run status `{status_raw}`"))
    })?;

    Ok(AutopilotRun {
        id: AutopilotRunId(row.try_get("id")?),
        trigger_key: row.try_get("trigger_key")?,
        trigger_type,
        user_id: UserId(row.try_get("user_id")?),
        status,
        context_json: row.try_get("context_json")?,
        plan_json: row.try_get("plan_json")?,
        result_json: row.try_get("result_json")?,
        error_message: row.try_get("error_message")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        started_at: parse_optional_timestamp("started_at", row.try_get("started_at")?)?,
        finished_at: parse_optional_timestamp("finished_at", row.try_get("finished_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use skipper_core::chrono::{DateTime, Duration, Utc};
    use skipper_core::domain::autopilot::{AutopilotRun, AutopilotRunId, TriggerType};
    use skipper_core::domain::outbox::{OutboxEvent, OutboxEventId};
    use skipper_core::domain::run::UserId;

    use super::{SqlAutopilotRunRepository, SqlOutboxRepository};
    use crate::migrations;
    use crate::repositories::{AutopilotRunRepository, OutboxRepository};
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn lease_skips_processed_and_not_yet_retryable_events() {
        let pool = setup_pool().await;
        let repo = SqlOutboxRepository::new(pool.clone());
        let now = parse_ts("2026-03-01T09:00:00Z");

        let ready = sample_event("evt-ready", "key-ready", now - Duration::minutes(2));
        let processed = sample_event("evt-done", "key-done", now - Duration::minutes(3));
        let deferred = sample_event("evt-later", "key-later", now - Duration::minutes(1));

        repo.enqueue(ready.clone()).await.expect("enqueue ready");
        repo.enqueue(processed.clone()).await.expect("enqueue processed");
        repo.enqueue(deferred.clone()).await.expect("enqueue deferred");

        repo.mark_processed(&processed.id, now).await.expect("mark processed");
        repo.record_failure(&deferred.id, "runtime offline", Some(now + Duration::minutes(5)))
            .await
            .expect("record failure");

        let leased = repo.lease_next_batch(10, now).await.expect("lease");
        assert_eq!(
            leased.iter().map(|event| event.id.0.as_str()).collect::<Vec<_>>(),
            vec!["evt-ready"]
        );

        let leased_later =
            repo.lease_next_batch(10, now + Duration::minutes(5)).await.expect("lease later");
        assert_eq!(
            leased_later.iter().map(|event| event.id.0.as_str()).collect::<Vec<_>>(),
            vec!["evt-ready", "evt-later"]
        );

        let deferred_after = repo
            .find_by_id(&deferred.id)
            .await
            .expect("find deferred")
            .expect("deferred exists");
        assert_eq!(deferred_after.error_count, 1);
        assert_eq!(deferred_after.last_error.as_deref(), Some("runtime offline"));

        pool.close().await;
    }

    #[tokio::test]
    async fn lease_respects_batch_limit_and_age_order() {
        let pool = setup_pool().await;
        let repo = SqlOutboxRepository::new(pool.clone());
        let now = parse_ts("2026-03-01T09:00:00Z");

        for offset in 0..5 {
            repo.enqueue(sample_event(
                &format!("evt-{offset}"),
                &format!("key-{offset}"),
                now - Duration::minutes(10 - offset),
            ))
            .await
            .expect("enqueue");
        }

        let leased = repo.lease_next_batch(2, now).await.expect("lease");
        assert_eq!(
            leased.iter().map(|event| event.id.0.as_str()).collect::<Vec<_>>(),
            vec!["evt-0", "evt-1"]
        );

        pool.close().await;
    }

    #[tokio::test]
    async fn duplicate_trigger_key_yields_none_without_error() {
        let pool = setup_pool().await;
        let repo = SqlAutopilotRunRepository::new(pool.clone());

        let first = AutopilotRun::queued(
            AutopilotRunId("ap-1".to_string()),
            "autopilot:submission_evaluated:sub-42",
            TriggerType::SubmissionEvaluated,
            UserId("user-1".to_string()),
            Some("{\"submission_id\":\"sub-42\"}".to_string()),
        );
        let duplicate = AutopilotRun::queued(
            AutopilotRunId("ap-2".to_string()),
            "autopilot:submission_evaluated:sub-42",
            TriggerType::SubmissionEvaluated,
            UserId("user-1".to_string()),
            None,
        );

        let created = repo.create_queued(first.clone()).await.expect("create first");
        assert!(created.is_some());

        let rejected = repo.create_queued(duplicate).await.expect("create duplicate");
        assert!(rejected.is_none());

        let by_key = repo
            .find_by_trigger_key("autopilot:submission_evaluated:sub-42")
            .await
            .expect("find by trigger key")
            .expect("run exists");
        assert_eq!(by_key.id, first.id);

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn sample_event(id: &str, dedup_key: &str, created_at: DateTime<Utc>) -> OutboxEvent {
        let mut event = OutboxEvent::new(
            OutboxEventId(id.to_string()),
            "submission_evaluated",
            "{\"submission_id\":\"sub-42\",\"user_id\":\"user-1\"}",
            dedup_key,
        );
        event.created_at = created_at;
        event
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}
