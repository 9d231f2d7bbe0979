pub mod config;
pub mod domain;
pub mod errors;
pub mod sanitizer;

pub use chrono;

pub use domain::autopilot::{AutopilotRun, AutopilotRunId, AutopilotRunStatus, TriggerType};
pub use domain::decision::{
    RoutingDecision, RoutingDecisionId, SafetyDecision, SafetyDecisionId, SafetyVerdict,
};
pub use domain::evidence::{Evidence, EvidenceId, EvidenceSource};
pub use domain::invocation::{InvocationStatus, ToolInvocation, ToolInvocationId};
pub use domain::outbox::{OutboxEvent, OutboxEventId};
pub use domain::run::{AgentMode, AgentRun, AgentRunId, RunStatus, UserId};
pub use domain::step::{AgentStep, StepKind};
pub use errors::DomainError;
pub use sanitizer::{sanitize, sanitize_multiple, SanitizeOptions, SanitizeViolation};
