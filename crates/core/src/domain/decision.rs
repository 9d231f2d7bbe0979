use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::invocation::ToolInvocationId;
use crate::domain::run::AgentRunId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SafetyDecisionId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingDecisionId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyVerdict {
    Allow,
    Block,
    NeedsConfirmation,
}

impl SafetyVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
            Self::NeedsConfirmation => "needs_confirmation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "allow" => Some(Self::Allow),
            "block" => Some(Self::Block),
            "needs_confirmation" => Some(Self::NeedsConfirmation),
            _ => None,
        }
    }
}

/// 1:1 with a tool invocation that passed through the guard. `reasons`
/// are machine-readable codes; `feedback` is the natural-language text
/// fed back into the next planning prompt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyDecision {
    pub id: SafetyDecisionId,
    pub run_id: AgentRunId,
    pub invocation_id: ToolInvocationId,
    pub verdict: SafetyVerdict,
    pub reasons: Vec<String>,
    pub feedback: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Audit record of which provider/model/toolset was selected for a run
/// (optionally a specific step) and why. Never consulted for control flow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub id: RoutingDecisionId,
    pub run_id: AgentRunId,
    pub step_index: Option<u32>,
    pub provider: String,
    pub model: String,
    pub toolset: String,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
}
