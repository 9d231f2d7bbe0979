//! Planner output parsing.
//!
//! The model response is an untrusted string. It is validated into the
//! tagged [`PlannerOutput`] union before any field is read; a response
//! that does not parse is a [`PlanParseError`], never a trusted
//! structure.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PlanParseError {
    #[error("planner output is not valid JSON: {0}")]
    NotJson(String),
    #[error("planner output has an invalid shape: {0}")]
    InvalidShape(String),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ProposedCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PlannedClaim {
    pub claim: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// The tagged union the model must produce: either another planning
/// round with proposed tool calls, or the final answer.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum PlannerOutput {
    Plan {
        #[serde(default)]
        thought: Option<String>,
        #[serde(default)]
        tool_calls: Vec<ProposedCall>,
        #[serde(default)]
        claims: Vec<PlannedClaim>,
    },
    Final {
        message: String,
        #[serde(default)]
        hints: Vec<String>,
        #[serde(default)]
        questions: Vec<String>,
    },
}

/// The single-shot plan an autopilot round must produce: a summary and an
/// ordered list of actions. No final stage; the plan is the whole run.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AutopilotPlan {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub actions: Vec<ProposedCall>,
}

pub fn parse_autopilot_plan(raw: &str) -> Result<AutopilotPlan, PlanParseError> {
    let candidate = extract_json_candidate(raw);

    let value: Value = serde_json::from_str(candidate)
        .map_err(|error| PlanParseError::NotJson(error.to_string()))?;

    serde_json::from_value(value)
        .map_err(|error| PlanParseError::InvalidShape(error.to_string()))
}

/// Parse a raw model response into a [`PlannerOutput`].
///
/// Models wrap JSON in markdown fences or prose often enough that the
/// parser first trims fences, then falls back to the outermost brace
/// pair before giving up.
pub fn parse_planner_output(raw: &str) -> Result<PlannerOutput, PlanParseError> {
    let candidate = extract_json_candidate(raw);

    let value: Value = serde_json::from_str(candidate)
        .map_err(|error| PlanParseError::NotJson(error.to_string()))?;

    serde_json::from_value(value)
        .map_err(|error| PlanParseError::InvalidShape(error.to_string()))
}

fn extract_json_candidate(raw: &str) -> &str {
    let trimmed = raw.trim();

    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    if unfenced.starts_with('{') {
        return unfenced;
    }

    match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(start), Some(end)) if start < end => &unfenced[start..=end],
        _ => unfenced,
    }
}
