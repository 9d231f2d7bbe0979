use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::run::UserId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AutopilotRunId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    SubmissionEvaluated,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubmissionEvaluated => "submission_evaluated",
            Self::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "submission_evaluated" => Some(Self::SubmissionEvaluated),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }

    /// Map an outbox event type onto the trigger it represents.
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type.trim().to_ascii_lowercase().as_str() {
            "submission_evaluated" | "submission.evaluated" => Some(Self::SubmissionEvaluated),
            "manual" | "autopilot.manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutopilotRunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl AutopilotRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// An autonomously triggered run, keyed by `trigger_key`.
///
/// At most one autopilot run may exist per trigger key; the creating
/// repository operation returns `None` on conflict rather than erroring,
/// which is what makes outbox replays idempotent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutopilotRun {
    pub id: AutopilotRunId,
    pub trigger_key: String,
    pub trigger_type: TriggerType,
    pub user_id: UserId,
    pub status: AutopilotRunStatus,
    pub context_json: Option<String>,
    pub plan_json: Option<String>,
    pub result_json: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AutopilotRun {
    pub fn queued(
        id: AutopilotRunId,
        trigger_key: impl Into<String>,
        trigger_type: TriggerType,
        user_id: UserId,
        context_json: Option<String>,
    ) -> Self {
        Self {
            id,
            trigger_key: trigger_key.into(),
            trigger_type,
            user_id,
            status: AutopilotRunStatus::Queued,
            context_json,
            plan_json: None,
            result_json: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}
