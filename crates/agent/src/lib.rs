//! Agent orchestration: the plan/act/evaluate runtime, the tool
//! registry and safety guard around it, language model clients with
//! failover, and the outbox-driven autopilot.

pub mod autopilot;
pub mod guard;
pub mod limiter;
pub mod llm;
pub mod openai;
pub mod plan;
pub mod prompts;
pub mod registry;
pub mod router;
pub mod runtime;

pub use autopilot::{AutopilotRunner, ExecuteOptions, ExecuteReport};
pub use guard::{GuardVerdict, SafetyGuard};
pub use limiter::RateLimiter;
pub use llm::{FailoverChain, GenerateOptions, LlmClient, LlmError, MockLlm, StreamChunk};
pub use openai::OpenAiCompatClient;
pub use plan::{parse_autopilot_plan, parse_planner_output, PlanParseError, PlannerOutput};
pub use registry::{
    EchoTool, Tool, ToolContext, ToolError, ToolPermission, ToolRegistry, ToolSummary, TypedTool,
};
pub use router::Router;
pub use runtime::{AgentRuntime, RunOutcome, RuntimeError};
