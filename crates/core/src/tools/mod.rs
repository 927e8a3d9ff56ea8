//! Tools the assistant may call during a turn.
//!
//! A [`ToolRegistry`] is the catalog bound to every reasoning call. Tools
//! report failures as `Err(String)`; the agent records that text as the tool
//! result so the model can recover, and a failing tool never aborts a turn.

pub mod clock;
pub mod mcp;
pub mod province;
pub mod visits;

use crate::message::ToolCall;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// The model-facing description of a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

/// Telephony metadata about the person on the call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallerInfo {
    pub phone_number: Option<String>,
}

/// Per-invocation context handed to every tool.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub conversation_id: String,
    pub caller: CallerInfo,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    async fn call(&self, ctx: &ToolContext, arguments: Value) -> Result<String, String>;
}

/// Builds the JSON schema for an arguments struct.
pub fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| {
        serde_json::json!({ "type": "object", "properties": {} })
    })
}

/// Decodes tool arguments into `T`, reporting problems in a form the model
/// can act on.
pub fn parse_args<T: DeserializeOwned>(tool: &str, arguments: Value) -> Result<T, String> {
    serde_json::from_value(arguments)
        .map_err(|e| format!("Invalid arguments for tool '{tool}': {e}"))
}

#[derive(Clone)]
struct RegisteredTool {
    /// Taken once at registration; schemas are not rebuilt per call.
    spec: ToolSpec,
    tool: Arc<dyn Tool>,
}

/// The tool catalog, in registration order.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tool. A later tool with the same name replaces the earlier one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let entry = RegisteredTool {
            spec: tool.spec(),
            tool,
        };
        if let Some(existing) = self.tools.iter_mut().find(|t| t.spec.name == entry.spec.name) {
            warn!(tool = %entry.spec.name, "Replacing already registered tool");
            *existing = entry;
        } else {
            self.tools.push(entry);
        }
    }

    pub fn with(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec.clone()).collect()
    }

    /// Runs the tool a model requested. Unknown tools and malformed
    /// arguments are reported like any other tool failure.
    pub async fn invoke(&self, ctx: &ToolContext, call: &ToolCall) -> Result<String, String> {
        let Some(entry) = self.tools.iter().find(|t| t.spec.name == call.name) else {
            warn!(tool = %call.name, "Model requested an unknown tool");
            return Err(format!("Unknown tool '{}'", call.name));
        };

        let arguments = if call.arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&call.arguments)
                .map_err(|e| format!("Arguments for tool '{}' are not valid JSON: {e}", call.name))?
        };

        info!(tool = %call.name, call_id = %call.id, "Executing tool");
        entry.tool.call(ctx, arguments).await
    }
}
