use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::run::AgentRunId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Plan,
    Act,
    Final,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Act => "act",
            Self::Final => "final",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "plan" => Some(Self::Plan),
            "act" => Some(Self::Act),
            "final" => Some(Self::Final),
            _ => None,
        }
    }
}

/// One plan/act/final round within a run. Steps are append-only and
/// `step_index` values within a run are gap-free and strictly increasing;
/// only the last step's output may be patched, once, to record a
/// continuation result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStep {
    pub run_id: AgentRunId,
    pub step_index: u32,
    pub kind: StepKind,
    pub input_json: Option<String>,
    pub output_json: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AgentStep {
    pub fn new(
        run_id: AgentRunId,
        step_index: u32,
        kind: StepKind,
        input_json: Option<String>,
        output_json: Option<String>,
    ) -> Self {
        Self { run_id, step_index, kind, input_json, output_json, created_at: Utc::now() }
    }
}
