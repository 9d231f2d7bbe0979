//! Safety guard.
//!
//! Pure decision function over a proposed tool call: unknown tools are
//! blocked, side-effecting tools need human confirmation unless the guard
//! was constructed auto-approving (autopilot and tests, where a
//! supervising process pre-authorizes effects), everything else is
//! allowed.

use serde_json::Value;

use skipper_core::domain::decision::SafetyVerdict;

use crate::registry::Tool;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardVerdict {
    pub verdict: SafetyVerdict,
    /// Machine-readable reason codes, persisted with the decision.
    pub reasons: Vec<String>,
    /// Natural-language feedback fed into the next planning prompt.
    pub feedback: Option<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SafetyGuard {
    auto_approve: bool,
}

impl SafetyGuard {
    pub fn new() -> Self {
        Self { auto_approve: false }
    }

    pub fn auto_approving() -> Self {
        Self { auto_approve: true }
    }

    pub fn is_auto_approving(&self) -> bool {
        self.auto_approve
    }

    pub fn decide(&self, tool: Option<&dyn Tool>, _args: &Value) -> GuardVerdict {
        let Some(tool) = tool else {
            return GuardVerdict {
                verdict: SafetyVerdict::Block,
                reasons: vec!["unknown_tool".to_string()],
                feedback: Some(
                    "That tool does not exist. Only use tools from the provided list."
                        .to_string(),
                ),
            };
        };

        if tool.side_effects() && !self.auto_approve {
            return GuardVerdict {
                verdict: SafetyVerdict::NeedsConfirmation,
                reasons: vec!["side_effects".to_string()],
                feedback: Some(format!(
                    "Tool `{}` has side effects and is waiting for human confirmation.",
                    tool.name()
                )),
            };
        }

        GuardVerdict { verdict: SafetyVerdict::Allow, reasons: Vec::new(), feedback: None }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use skipper_core::domain::decision::SafetyVerdict;

    use super::SafetyGuard;
    use crate::registry::{Tool, ToolContext, ToolError, ToolPermission, TypedTool};

    struct SendMailTool;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct SendMailArgs {
        #[allow(dead_code)]
        to: String,
        #[serde(default)]
        #[allow(dead_code)]
        user_id: Option<String>,
    }

    #[derive(Debug, Serialize, JsonSchema)]
    struct SendMailOutput {
        sent: bool,
    }

    #[async_trait]
    impl TypedTool for SendMailTool {
        type Args = SendMailArgs;
        type Output = SendMailOutput;

        fn name(&self) -> &str {
            "send_mail"
        }

        fn description(&self) -> &str {
            "Sends an email."
        }

        fn permission(&self) -> ToolPermission {
            ToolPermission::Write
        }

        fn side_effects(&self) -> bool {
            true
        }

        async fn run(
            &self,
            _ctx: &ToolContext,
            _args: SendMailArgs,
        ) -> Result<SendMailOutput, ToolError> {
            Ok(SendMailOutput { sent: true })
        }
    }

    #[test]
    fn unknown_tool_is_blocked() {
        let verdict = SafetyGuard::new().decide(None, &json!({}));
        assert_eq!(verdict.verdict, SafetyVerdict::Block);
        assert_eq!(verdict.reasons, vec!["unknown_tool".to_string()]);
        assert!(verdict.feedback.is_some());
    }

    #[test]
    fn side_effects_need_confirmation_under_default_guard() {
        let tool = SendMailTool;
        let verdict = SafetyGuard::new().decide(Some(&tool as &dyn Tool), &json!({}));
        assert_eq!(verdict.verdict, SafetyVerdict::NeedsConfirmation);
        assert_eq!(verdict.reasons, vec!["side_effects".to_string()]);
    }

    #[test]
    fn auto_approving_guard_allows_side_effects() {
        let tool = SendMailTool;
        let verdict =
            SafetyGuard::auto_approving().decide(Some(&tool as &dyn Tool), &json!({}));
        assert_eq!(verdict.verdict, SafetyVerdict::Allow);
    }

    #[test]
    fn read_only_tools_are_allowed() {
        let tool = crate::registry::EchoTool;
        let verdict = SafetyGuard::new().decide(Some(&tool as &dyn Tool), &json!({}));
        assert_eq!(verdict.verdict, SafetyVerdict::Allow);
        assert!(verdict.reasons.is_empty());
    }
}
