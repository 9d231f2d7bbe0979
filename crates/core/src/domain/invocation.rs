use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::run::AgentRunId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolInvocationId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    Allowed,
    Blocked,
    NeedsConfirmation,
    Executed,
    Denied,
    Failed,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Allowed => "allowed",
            Self::Blocked => "blocked",
            Self::NeedsConfirmation => "needs_confirmation",
            Self::Executed => "executed",
            Self::Denied => "denied",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "allowed" => Some(Self::Allowed),
            "blocked" => Some(Self::Blocked),
            "needs_confirmation" => Some(Self::NeedsConfirmation),
            "executed" => Some(Self::Executed),
            "denied" => Some(Self::Denied),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Blocked | Self::Executed | Self::Denied | Self::Failed)
    }

    /// pending -(guard)-> allowed|blocked|needs_confirmation,
    /// allowed -> executed|failed,
    /// needs_confirmation -(human)-> executed|failed|denied.
    pub fn can_transition(from: Self, to: Self) -> bool {
        match (from, to) {
            (Self::Pending, Self::Allowed) => true,
            (Self::Pending, Self::Blocked) => true,
            (Self::Pending, Self::NeedsConfirmation) => true,
            (Self::Allowed, Self::Executed | Self::Failed) => true,
            (Self::NeedsConfirmation, Self::Executed | Self::Failed | Self::Denied) => true,
            _ => false,
        }
    }
}

/// One concrete tool call proposed during a step. Exactly one invocation
/// exists per tool call proposed by a plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: ToolInvocationId,
    pub run_id: AgentRunId,
    pub step_index: u32,
    pub tool_name: String,
    pub args_json: String,
    pub status: InvocationStatus,
    pub result_json: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ToolInvocation {
    pub fn pending(
        id: ToolInvocationId,
        run_id: AgentRunId,
        step_index: u32,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
    ) -> Self {
        Self {
            id,
            run_id,
            step_index,
            tool_name: tool_name.into(),
            args_json: args_json.into(),
            status: InvocationStatus::Pending,
            result_json: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::InvocationStatus;

    #[test]
    fn invocation_status_round_trips_through_strings() {
        for status in [
            InvocationStatus::Pending,
            InvocationStatus::Allowed,
            InvocationStatus::Blocked,
            InvocationStatus::NeedsConfirmation,
            InvocationStatus::Executed,
            InvocationStatus::Denied,
            InvocationStatus::Failed,
        ] {
            assert_eq!(InvocationStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn guard_outcomes_are_only_reachable_from_pending() {
        assert!(InvocationStatus::can_transition(
            InvocationStatus::Pending,
            InvocationStatus::Blocked
        ));
        assert!(!InvocationStatus::can_transition(
            InvocationStatus::Executed,
            InvocationStatus::Blocked
        ));
    }

    #[test]
    fn confirmation_resolves_to_executed_failed_or_denied() {
        for target in
            [InvocationStatus::Executed, InvocationStatus::Failed, InvocationStatus::Denied]
        {
            assert!(InvocationStatus::can_transition(
                InvocationStatus::NeedsConfirmation,
                target
            ));
        }
        assert!(!InvocationStatus::can_transition(
            InvocationStatus::Denied,
            InvocationStatus::Executed
        ));
    }
}
