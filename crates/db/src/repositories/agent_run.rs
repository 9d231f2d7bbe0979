use sqlx::{sqlite::SqliteRow, Row};

use skipper_core::chrono::{DateTime, Utc};
use skipper_core::domain::run::{AgentMode, AgentRun, AgentRunId, RunStatus, UserId};
use skipper_core::domain::step::{AgentStep, StepKind};

use super::{AgentRunRepository, RepositoryError};
use crate::DbPool;

pub struct SqlAgentRunRepository {
    pool: DbPool,
}

impl SqlAgentRunRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AgentRunRepository for SqlAgentRunRepository {
    async fn find_by_id(&self, id: &AgentRunId) -> Result<Option<AgentRun>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                user_id,
                mode,
                goal,
                input_json,
                status,
                result_json,
                error_message,
                created_at,
                started_at,
                finished_at
             FROM agent_run
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(run_from_row).transpose()
    }

    async fn save(&self, run: AgentRun) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO agent_run (
                id,
                user_id,
                mode,
                goal,
                input_json,
                status,
                result_json,
                error_message,
                created_at,
                started_at,
                finished_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                mode = excluded.mode,
                goal = excluded.goal,
                input_json = excluded.input_json,
                status = excluded.status,
                result_json = excluded.result_json,
                error_message = excluded.error_message,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at",
        )
        .bind(&run.id.0)
        .bind(&run.user_id.0)
        .bind(run.mode.as_str())
        .bind(&run.goal)
        .bind(run.input_json.as_deref())
        .bind(run.status.as_str())
        .bind(run.result_json.as_deref())
        .bind(run.error_message.as_deref())
        .bind(run.created_at.to_rfc3339())
        .bind(run.started_at.map(|value| value.to_rfc3339()))
        .bind(run.finished_at.map(|value| value.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_step(&self, step: AgentStep) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO agent_step (
                run_id,
                step_index,
                kind,
                input_json,
                output_json,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&step.run_id.0)
        .bind(i64::from(step.step_index))
        .bind(step.kind.as_str())
        .bind(step.input_json.as_deref())
        .bind(step.output_json.as_deref())
        .bind(step.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_steps(&self, run_id: &AgentRunId) -> Result<Vec<AgentStep>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                run_id,
                step_index,
                kind,
                input_json,
                output_json,
                created_at
             FROM agent_step
             WHERE run_id = ?
             ORDER BY step_index ASC",
        )
        .bind(&run_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(step_from_row).collect()
    }

    async fn update_step_output(
        &self,
        run_id: &AgentRunId,
        step_index: u32,
        output_json: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE agent_step SET output_json = ? WHERE run_id = ? AND step_index = ?",
        )
        .bind(output_json)
        .bind(&run_id.0)
        .bind(i64::from(step_index))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn run_from_row(row: SqliteRow) -> Result<AgentRun, RepositoryError> {
    let mode_raw = row.try_get::<String, _>("mode")?;
    let mode = AgentMode::parse(&mode_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown agent mode `{mode_raw}`")))?;

    let status_raw = row.try_get::<String, _>("status")?;
    let status = RunStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown run status `{status_raw}`")))?;

    Ok(AgentRun {
        id: AgentRunId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        mode,
        goal: row.try_get("goal")?,
        input_json: row.try_get("input_json")?,
        status,
        result_json: row.try_get("result_json")?,
        error_message: row.try_get("error_message")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        started_at: parse_optional_timestamp("started_at", row.try_get("started_at")?)?,
        finished_at: parse_optional_timestamp("finished_at", row.try_get("finished_at")?)?,
    })
}

fn step_from_row(row: SqliteRow) -> Result<AgentStep, RepositoryError> {
    let kind_raw = row.try_get::<String, _>("kind")?;
    let kind = StepKind::parse(&kind_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown step kind `{kind_raw}`")))?;

    Ok(AgentStep {
        run_id: AgentRunId(row.try_get("run_id")?),
        step_index: parse_u32("step_index", row.try_get("step_index")?)?,
        kind,
        input_json: row.try_get("input_json")?,
        output_json: row.try_get("output_json")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}
