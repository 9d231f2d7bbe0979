use sqlx::{sqlite::SqliteRow, Row};

use skipper_core::domain::invocation::{InvocationStatus, ToolInvocation, ToolInvocationId};
use skipper_core::domain::run::AgentRunId;

use super::agent_run::{parse_optional_timestamp, parse_timestamp, parse_u32};
use super::{InvocationRepository, RepositoryError};
use crate::DbPool;

pub struct SqlInvocationRepository {
    pool: DbPool,
}

impl SqlInvocationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl InvocationRepository for SqlInvocationRepository {
    async fn find_by_id(
        &self,
        id: &ToolInvocationId,
    ) -> Result<Option<ToolInvocation>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                run_id,
                step_index,
                tool_name,
                args_json,
                status,
                result_json,
                error_message,
                created_at,
                started_at,
                finished_at
             FROM tool_invocation
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(invocation_from_row).transpose()
    }

    async fn save(&self, invocation: ToolInvocation) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO tool_invocation (
                id,
                run_id,
                step_index,
                tool_name,
                args_json,
                status,
                result_json,
                error_message,
                created_at,
                started_at,
                finished_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                result_json = excluded.result_json,
                error_message = excluded.error_message,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at",
        )
        .bind(&invocation.id.0)
        .bind(&invocation.run_id.0)
        .bind(i64::from(invocation.step_index))
        .bind(&invocation.tool_name)
        .bind(&invocation.args_json)
        .bind(invocation.status.as_str())
        .bind(invocation.result_json.as_deref())
        .bind(invocation.error_message.as_deref())
        .bind(invocation.created_at.to_rfc3339())
        .bind(invocation.started_at.map(|value| value.to_rfc3339()))
        .bind(invocation.finished_at.map(|value| value.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_run(
        &self,
        run_id: &AgentRunId,
    ) -> Result<Vec<ToolInvocation>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                run_id,
                step_index,
                tool_name,
                args_json,
                status,
                result_json,
                error_message,
                created_at,
                started_at,
                finished_at
             FROM tool_invocation
             WHERE run_id = ?
             ORDER BY step_index ASC, created_at ASC",
        )
        .bind(&run_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(invocation_from_row).collect()
    }
}

fn invocation_from_row(row: SqliteRow) -> Result<ToolInvocation, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = InvocationStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown invocation status `{status_raw}`"))
    })?;

    Ok(ToolInvocation {
        id: ToolInvocationId(row.try_get("id")?),
        run_id: AgentRunId(row.try_get("run_id")?),
        step_index: parse_u32("step_index", row.try_get("step_index")?)?,
        tool_name: row.try_get("tool_name")?,
        args_json: row.try_get("args_json")?,
        status,
        result_json: row.try_get("result_json")?,
        error_message: row.try_get("error_message")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        started_at: parse_optional_timestamp("started_at", row.try_get("started_at")?)?,
        finished_at: parse_optional_timestamp("finished_at", row.try_get("finished_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use skipper_core::chrono::{DateTime, Utc};
    use skipper_core::domain::invocation::{InvocationStatus, ToolInvocation, ToolInvocationId};
    use skipper_core::domain::run::{AgentMode, AgentRun, AgentRunId, RunStatus, UserId};

    use super::SqlInvocationRepository;
    use crate::migrations;
    use crate::repositories::{AgentRunRepository, InvocationRepository, SqlAgentRunRepository};
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn sql_invocation_repo_round_trips_and_lists_in_step_order() {
        let pool = setup_pool().await;
        let run_id = insert_run(&pool, "run-inv-001").await;

        let repo = SqlInvocationRepository::new(pool.clone());

        let mut first = sample_invocation("inv-1", &run_id, 1);
        let second = sample_invocation("inv-2", &run_id, 0);

        repo.save(first.clone()).await.expect("save first");
        repo.save(second.clone()).await.expect("save second");

        first.status = InvocationStatus::Allowed;
        repo.save(first.clone()).await.expect("update first");

        let found = repo.find_by_id(&first.id).await.expect("find first");
        assert_eq!(found, Some(first.clone()));

        let listed = repo.list_for_run(&run_id).await.expect("list invocations");
        assert_eq!(listed, vec![second, first]);

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    async fn insert_run(pool: &DbPool, id: &str) -> AgentRunId {
        let run = AgentRun {
            id: AgentRunId(id.to_string()),
            user_id: UserId("user-1".to_string()),
            mode: AgentMode::Generic,
            goal: "goal".to_string(),
            input_json: None,
            status: RunStatus::Running,
            result_json: None,
            error_message: None,
            created_at: parse_ts("2026-03-01T09:00:00Z"),
            started_at: Some(parse_ts("2026-03-01T09:00:01Z")),
            finished_at: None,
        };
        SqlAgentRunRepository::new(pool.clone()).save(run.clone()).await.expect("insert run");
        run.id
    }

    fn sample_invocation(id: &str, run_id: &AgentRunId, step_index: u32) -> ToolInvocation {
        ToolInvocation {
            id: ToolInvocationId(id.to_string()),
            run_id: run_id.clone(),
            step_index,
            tool_name: "lookup_submissions".to_string(),
            args_json: "{\"limit\":3}".to_string(),
            status: InvocationStatus::Pending,
            result_json: None,
            error_message: None,
            created_at: parse_ts("2026-03-01T09:00:02Z"),
            started_at: None,
            finished_at: None,
        }
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}
