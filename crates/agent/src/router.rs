//! Routing decision recorder.
//!
//! Records which provider/model/toolset was selected for a run and why.
//! The record is an audit trail only: nothing in the core consults it for
//! control flow, and provider fallback lives at the LLM client boundary.

use uuid::Uuid;

use skipper_core::chrono::Utc;
use skipper_core::domain::decision::{RoutingDecision, RoutingDecisionId};
use skipper_core::domain::run::{AgentMode, AgentRunId};

#[derive(Clone, Debug)]
pub struct Router {
    provider: String,
    model: String,
}

impl Router {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self { provider: provider.into(), model: model.into() }
    }

    pub fn route(
        &self,
        run_id: &AgentRunId,
        step_index: Option<u32>,
        mode: AgentMode,
        tool_names: &[String],
    ) -> RoutingDecision {
        let toolset = if tool_names.is_empty() {
            "none".to_string()
        } else {
            tool_names.join(",")
        };

        RoutingDecision {
            id: RoutingDecisionId(Uuid::new_v4().to_string()),
            run_id: run_id.clone(),
            step_index,
            provider: self.provider.clone(),
            model: self.model.clone(),
            toolset,
            reason: reason_for_mode(mode),
            decided_at: Utc::now(),
        }
    }
}

fn reason_for_mode(mode: AgentMode) -> String {
    let rationale = match mode {
        AgentMode::Mentor => "mentor mode favors explanatory, low-temperature guidance",
        AgentMode::Coach => "coach mode favors short actionable feedback",
        AgentMode::DeepResearch => "deep research mode favors long-context synthesis",
        AgentMode::CodeAssist => "code assist mode favors structured code-aware output",
        AgentMode::Generic => "generic mode uses the default configured model",
    };
    format!("{rationale}; selected the configured provider chain")
}

#[cfg(test)]
mod tests {
    use skipper_core::domain::run::{AgentMode, AgentRunId};

    use super::Router;

    #[test]
    fn routing_decision_records_provider_model_and_toolset() {
        let router = Router::new("ollama", "llama3.1");
        let decision = router.route(
            &AgentRunId("run-1".to_string()),
            None,
            AgentMode::DeepResearch,
            &["echo".to_string(), "search".to_string()],
        );

        assert_eq!(decision.provider, "ollama");
        assert_eq!(decision.model, "llama3.1");
        assert_eq!(decision.toolset, "echo,search");
        assert!(decision.reason.contains("deep research"));
    }

    #[test]
    fn empty_toolset_is_recorded_explicitly() {
        let router = Router::new("mock", "scripted");
        let decision =
            router.route(&AgentRunId("run-2".to_string()), Some(0), AgentMode::Generic, &[]);
        assert_eq!(decision.toolset, "none");
        assert_eq!(decision.step_index, Some(0));
    }
}
