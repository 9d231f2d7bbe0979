use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::run::AgentRunId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvidenceId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    ModelAssertion,
    ToolResult,
    UserProvided,
}

impl EvidenceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelAssertion => "model_assertion",
            Self::ToolResult => "tool_result",
            Self::UserProvided => "user_provided",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "model_assertion" => Some(Self::ModelAssertion),
            "tool_result" => Some(Self::ToolResult),
            "user_provided" => Some(Self::UserProvided),
            _ => None,
        }
    }
}

/// A claim the agent asserted during a run. Append-only, informational.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub id: EvidenceId,
    pub run_id: AgentRunId,
    pub claim: String,
    pub source: EvidenceSource,
    pub confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
}
