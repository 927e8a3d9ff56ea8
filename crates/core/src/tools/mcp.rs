//! Tools served by an external MCP server.

use super::{Tool, ToolContext, ToolSpec};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use rmcp::{
    RoleClient, ServiceExt,
    model::{CallToolRequestParam, CallToolResult, RawContent},
    service::RunningService,
    transport::TokioChildProcess,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, warn};

type McpClient = RunningService<RoleClient, ()>;

/// Starts `command_line` as a child process speaking MCP over stdio and
/// returns every tool it lists. The server lives as long as its tools.
pub async fn spawn_mcp_tools(command_line: &str) -> Result<Vec<Arc<dyn Tool>>> {
    let mut parts = command_line.split_whitespace();
    let Some(program) = parts.next() else {
        bail!("MCP server command is empty");
    };
    let mut command = Command::new(program);
    command.args(parts);

    let transport = TokioChildProcess::new(command)
        .with_context(|| format!("Failed to start MCP server '{program}'"))?;
    let client = ().serve(transport).await.context("MCP handshake failed")?;
    load_tools(Arc::new(client)).await
}

async fn load_tools(client: Arc<McpClient>) -> Result<Vec<Arc<dyn Tool>>> {
    let listed = client
        .list_all_tools()
        .await
        .context("Failed to list MCP tools")?;

    let mut tools: Vec<Arc<dyn Tool>> = Vec::with_capacity(listed.len());
    for t in listed {
        let spec = ToolSpec {
            name: t.name.to_string(),
            description: t.description.map(|d| d.to_string()).unwrap_or_default(),
            parameters: serde_json::to_value(&*t.input_schema)?,
        };
        info!(tool = %spec.name, "Registered MCP tool");
        tools.push(Arc::new(McpTool {
            client: client.clone(),
            spec,
        }));
    }
    Ok(tools)
}

struct McpTool {
    client: Arc<McpClient>,
    spec: ToolSpec,
}

#[async_trait]
impl Tool for McpTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn call(&self, _ctx: &ToolContext, arguments: Value) -> Result<String, String> {
        let result = self
            .client
            .peer()
            .call_tool(CallToolRequestParam {
                name: self.spec.name.clone().into(),
                arguments: call_arguments(arguments)?,
            })
            .await
            .map_err(|e| {
                warn!(tool = %self.spec.name, error = ?e, "MCP tool call failed");
                format!("Tool '{}' failed: {e}", self.spec.name)
            })?;
        tool_output(result)
    }
}

/// MCP takes an argument object or nothing at all.
fn call_arguments(arguments: Value) -> Result<Option<Map<String, Value>>, String> {
    match arguments {
        Value::Object(map) => Ok(Some(map)),
        Value::Null => Ok(None),
        other => Err(format!("Tool arguments must be an object, got {other}")),
    }
}

/// The last text block of a tool result. A result flagged as an error
/// becomes `Err` with that text.
fn tool_output(result: CallToolResult) -> Result<String, String> {
    let text = result
        .content
        .unwrap_or_default()
        .into_iter()
        .rev()
        .find_map(|content| match content.raw {
            RawContent::Text(text_content) => Some(text_content.text),
            _ => None,
        })
        .ok_or_else(|| "Tool call returned no text content".to_string())?;

    if result.is_error == Some(true) {
        Err(text)
    } else {
        Ok(text)
    }
}
