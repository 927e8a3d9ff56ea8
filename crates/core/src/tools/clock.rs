use super::{Tool, ToolContext, ToolSpec, schema_of};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

#[derive(Deserialize, JsonSchema)]
struct NoArgs {}

/// Tells the model the local weekday and time.
pub struct CurrentDateTime;

impl CurrentDateTime {
    pub fn now_text() -> String {
        chrono::Local::now().format("%A %H:%M:%S").to_string()
    }
}

#[async_trait]
impl Tool for CurrentDateTime {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "current_date_time".into(),
            description: "Returns the current day of the week and local time.".into(),
            parameters: schema_of::<NoArgs>(),
        }
    }

    async fn call(&self, _ctx: &ToolContext, _arguments: Value) -> Result<String, String> {
        info!("Executing tool 'current_date_time'");
        Ok(Self::now_text())
    }
}
