use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentRunId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    Mentor,
    Coach,
    DeepResearch,
    CodeAssist,
    Generic,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mentor => "mentor",
            Self::Coach => "coach",
            Self::DeepResearch => "deep_research",
            Self::CodeAssist => "code_assist",
            Self::Generic => "generic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mentor" => Some(Self::Mentor),
            "coach" => Some(Self::Coach),
            "deep_research" => Some(Self::DeepResearch),
            "code_assist" => Some(Self::CodeAssist),
            "generic" => Some(Self::Generic),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Run transitions are monotonic: no run leaves a terminal state.
    pub fn can_transition(from: Self, to: Self) -> bool {
        match (from, to) {
            (Self::Queued, Self::Running) => true,
            (Self::Running, Self::Completed) => true,
            (Self::Running, Self::Failed) => true,
            (Self::Queued | Self::Running, Self::Cancelled) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: AgentRunId,
    pub user_id: UserId,
    pub mode: AgentMode,
    pub goal: String,
    pub input_json: Option<String>,
    pub status: RunStatus,
    pub result_json: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AgentRun {
    /// A freshly queued run, owned by `user_id`, pursuing `goal`.
    pub fn queued(
        id: AgentRunId,
        user_id: UserId,
        mode: AgentMode,
        goal: impl Into<String>,
        input_json: Option<String>,
    ) -> Self {
        Self {
            id,
            user_id,
            mode,
            goal: goal.into(),
            input_json,
            status: RunStatus::Queued,
            result_json: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}
