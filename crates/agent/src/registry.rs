//! Tool registry.
//!
//! Capabilities are registered by name with schema and permission
//! metadata, and looked up with an explicit unknown-tool error rather
//! than runtime probing. Validation is fail closed on both sides of a
//! handler: malformed args never reach it, and a handler returning a
//! shape its output schema cannot represent is a registry-level bug that
//! surfaces instead of being swallowed.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use skipper_core::domain::run::{AgentRunId, UserId};

#[derive(Clone, Debug)]
pub struct ToolContext {
    pub user_id: UserId,
    pub run_id: Option<AgentRunId>,
}

impl ToolContext {
    pub fn for_user(user_id: UserId) -> Self {
        Self { user_id, run_id: None }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPermission {
    Read,
    Write,
}

impl ToolPermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid arguments for `{tool}`: {message}")]
    InvalidArgs { tool: String, message: String },
    #[error("invalid output from `{tool}`: {message}")]
    InvalidOutput { tool: String, message: String },
    #[error("tool `{tool}` failed: {message}")]
    Handler { tool: String, message: String },
}

/// Object-safe tool contract. Most tools should implement [`TypedTool`]
/// instead and get schema generation and fail-closed validation from the
/// blanket impl.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn permission(&self) -> ToolPermission;

    /// Tools declaring side effects are gated behind human confirmation
    /// by a non-auto-approving guard.
    fn side_effects(&self) -> bool;

    /// Whether the registry should merge the caller's user id into the
    /// args object before validation. Tools that take no user scope opt
    /// out.
    fn merge_user_id(&self) -> bool;

    fn input_schema(&self) -> Value;

    fn output_schema(&self) -> Value;

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError>;
}

/// Typed tool contract: implement this with concrete `Args`/`Output`
/// types and the registry handles schema derivation, argument
/// deserialization, and output serialization.
#[async_trait]
pub trait TypedTool: Send + Sync {
    type Args: DeserializeOwned + JsonSchema + Send;
    type Output: Serialize + JsonSchema + Send;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn permission(&self) -> ToolPermission;

    fn side_effects(&self) -> bool {
        false
    }

    fn merge_user_id(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &ToolContext, args: Self::Args)
        -> Result<Self::Output, ToolError>;
}

#[async_trait]
impl<T: TypedTool> Tool for T {
    fn name(&self) -> &str {
        TypedTool::name(self)
    }

    fn description(&self) -> &str {
        TypedTool::description(self)
    }

    fn permission(&self) -> ToolPermission {
        TypedTool::permission(self)
    }

    fn side_effects(&self) -> bool {
        TypedTool::side_effects(self)
    }

    fn merge_user_id(&self) -> bool {
        TypedTool::merge_user_id(self)
    }

    fn input_schema(&self) -> Value {
        schema_value::<T::Args>()
    }

    fn output_schema(&self) -> Value {
        schema_value::<T::Output>()
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let typed_args: T::Args =
            serde_json::from_value(args).map_err(|error| ToolError::InvalidArgs {
                tool: TypedTool::name(self).to_string(),
                message: error.to_string(),
            })?;

        let output = self.run(ctx, typed_args).await?;

        serde_json::to_value(output).map_err(|error| ToolError::InvalidOutput {
            tool: TypedTool::name(self).to_string(),
            message: error.to_string(),
        })
    }
}

fn schema_value<S: JsonSchema>() -> Value {
    let schema = schemars::gen::SchemaGenerator::default().into_root_schema_for::<S>();
    serde_json::to_value(schema).unwrap_or(Value::Null)
}

/// Name and description only; schemas and handlers stay out of the model
/// context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
}

/// Name→definition map, populated at startup and read-only afterwards.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(Tool::name(&tool).to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn list(&self) -> Vec<ToolSummary> {
        self.tools
            .values()
            .map(|tool| ToolSummary {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
            })
            .collect()
    }

    pub async fn execute(
        &self,
        name: &str,
        raw_args: Value,
        ctx: &ToolContext,
    ) -> Result<Value, ToolError> {
        let tool = self.get(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        let args = if tool.merge_user_id() {
            merge_user_id(raw_args, &ctx.user_id)
        } else {
            raw_args
        };

        tool.call(ctx, args).await
    }
}

fn merge_user_id(args: Value, user_id: &UserId) -> Value {
    match args {
        Value::Object(mut map) => {
            map.entry("user_id").or_insert_with(|| Value::String(user_id.0.clone()));
            Value::Object(map)
        }
        Value::Null => {
            let mut map = serde_json::Map::new();
            map.insert("user_id".to_string(), Value::String(user_id.0.clone()));
            Value::Object(map)
        }
        other => other,
    }
}

/// Read-only echo tool, registered by default for tests and smoke runs.
pub struct EchoTool;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EchoArgs {
    pub text: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct EchoOutput {
    pub echoed: String,
}

#[async_trait]
impl TypedTool for EchoTool {
    type Args = EchoArgs;
    type Output = EchoOutput;

    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes the provided text back unchanged. Useful for verifying tool plumbing."
    }

    fn permission(&self) -> ToolPermission {
        ToolPermission::Read
    }

    async fn run(
        &self,
        _ctx: &ToolContext,
        args: EchoArgs,
    ) -> Result<EchoOutput, ToolError> {
        Ok(EchoOutput { echoed: args.text })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};

    use skipper_core::domain::run::UserId;

    use super::{
        EchoTool, Tool, ToolContext, ToolError, ToolPermission, ToolRegistry, TypedTool,
    };

    struct StrictTool;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct StrictArgs {
        count: u32,
        #[serde(default)]
        #[allow(dead_code)]
        user_id: Option<String>,
    }

    #[derive(Debug, Serialize, JsonSchema)]
    struct StrictOutput {
        doubled: u32,
    }

    #[async_trait]
    impl TypedTool for StrictTool {
        type Args = StrictArgs;
        type Output = StrictOutput;

        fn name(&self) -> &str {
            "double"
        }

        fn description(&self) -> &str {
            "Doubles a count."
        }

        fn permission(&self) -> ToolPermission {
            ToolPermission::Read
        }

        async fn run(
            &self,
            _ctx: &ToolContext,
            args: StrictArgs,
        ) -> Result<StrictOutput, ToolError> {
            Ok(StrictOutput { doubled: args.count * 2 })
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(StrictTool);
        registry
    }

    fn ctx() -> ToolContext {
        ToolContext::for_user(UserId("user-1".to_string()))
    }

    #[tokio::test]
    async fn unknown_tool_is_an_explicit_error() {
        let error = registry()
            .execute("launch_missiles", json!({}), &ctx())
            .await
            .expect_err("unknown tool");
        assert_eq!(error, ToolError::UnknownTool("launch_missiles".to_string()));
    }

    #[tokio::test]
    async fn invalid_args_never_reach_the_handler() {
        let error = registry()
            .execute("double", json!({"count": "not a number"}), &ctx())
            .await
            .expect_err("invalid args");
        assert!(matches!(error, ToolError::InvalidArgs { ref tool, .. } if tool == "double"));
    }

    #[tokio::test]
    async fn valid_args_execute_and_serialize_output() {
        let output = registry()
            .execute("double", json!({"count": 21}), &ctx())
            .await
            .expect("valid call");
        assert_eq!(output, json!({"doubled": 42}));
    }

    #[tokio::test]
    async fn user_id_is_merged_unless_already_present() {
        let output = registry()
            .execute("echo", json!({"text": "hi"}), &ctx())
            .await
            .expect("echo call");
        assert_eq!(output, json!({"echoed": "hi"}));

        // An explicit user_id in the args wins over the context merge.
        let output = registry()
            .execute("echo", json!({"text": "hi", "user_id": "user-override"}), &ctx())
            .await
            .expect("echo call with explicit user");
        assert_eq!(output, json!({"echoed": "hi"}));
    }

    #[test]
    fn list_exposes_names_and_descriptions_only() {
        let summaries = registry().list();
        assert_eq!(
            summaries.iter().map(|summary| summary.name.as_str()).collect::<Vec<_>>(),
            vec!["double", "echo"]
        );
        for summary in &summaries {
            assert!(!summary.description.is_empty());
        }
    }

    #[test]
    fn schemas_derive_from_typed_contracts() {
        let registry = registry();
        let tool = registry.get("double").expect("registered");
        let schema = tool.input_schema();
        assert_ne!(schema, Value::Null);
        assert!(schema["properties"]["count"].is_object());
    }
}
