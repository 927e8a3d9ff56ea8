use super::{Tool, ToolContext, ToolSpec, parse_args, schema_of};
use crate::resolver::LocalityResolver;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ResolveProvinceArgs {
    /// Name of the city, town or village, as said by the caller.
    #[schemars(description = "Name of the locality (city, town or village) to locate")]
    pub locality: String,
}

/// Exposes the locality resolver to the model.
pub struct ResolveProvince {
    resolver: Arc<LocalityResolver>,
}

impl ResolveProvince {
    pub fn new(resolver: Arc<LocalityResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Tool for ResolveProvince {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "resolve_province".into(),
            description: "Finds the province (voivodeship) a Polish locality belongs to. If the locality exists in several provinces, ask the caller which one they mean.".into(),
            parameters: schema_of::<ResolveProvinceArgs>(),
        }
    }

    async fn call(&self, ctx: &ToolContext, arguments: Value) -> Result<String, String> {
        let args: ResolveProvinceArgs = parse_args("resolve_province", arguments)?;
        info!(
            conversation_id = %ctx.conversation_id,
            locality = %args.locality,
            "Executing tool 'resolve_province'"
        );
        let resolution = self.resolver.resolve_province(&args.locality).await;
        serde_json::to_string(&resolution)
            .map_err(|e| format!("Failed to serialize resolution: {}", e))
    }
}
