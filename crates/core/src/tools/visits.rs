use super::{Tool, ToolContext, ToolSpec, parse_args, schema_of};
use crate::nfz::{NfzApiClient, find_available_visits, format_visit_results};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_VISIT_LIMIT: u32 = 5;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FindVisitsArgs {
    #[schemars(description = "Province name (e.g. 'MAŁOPOLSKIE') or two-digit province code")]
    pub province: String,
    #[schemars(description = "Medical service or clinic, e.g. 'Poradnia kardiologiczna'")]
    pub medical_service: String,
    #[serde(default)]
    #[schemars(description = "Only services for children")]
    pub for_children: bool,
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Searches NFZ waiting lists for the earliest available visits.
pub struct FindVisits {
    client: Arc<NfzApiClient>,
}

impl FindVisits {
    pub fn new(client: Arc<NfzApiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for FindVisits {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "find_visits".into(),
            description: "Finds the earliest available NFZ-funded visits for a medical service in a province. Resolve the province first if the caller only named a locality.".into(),
            parameters: schema_of::<FindVisitsArgs>(),
        }
    }

    async fn call(&self, ctx: &ToolContext, arguments: Value) -> Result<String, String> {
        let args: FindVisitsArgs = parse_args("find_visits", arguments)?;
        info!(
            conversation_id = %ctx.conversation_id,
            caller = ?ctx.caller.phone_number,
            province = %args.province,
            service = %args.medical_service,
            "Executing tool 'find_visits'"
        );

        let queues = find_available_visits(
            &self.client,
            &args.province,
            &args.medical_service,
            args.for_children,
            args.limit.unwrap_or(DEFAULT_VISIT_LIMIT),
        )
        .await
        .map_err(|e| {
            warn!(error = ?e, "Visit search failed");
            format!("Visit search failed: {e:#}")
        })?;
        Ok(format_visit_results(&queues))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_lists_required_fields() {
        let spec = FindVisits::new(Arc::new(NfzApiClient::default())).spec();
        let required = spec.parameters["required"].as_array().unwrap();
        assert!(required.contains(&Value::from("province")));
        assert!(required.contains(&Value::from("medical_service")));
        assert!(!required.contains(&Value::from("for_children")));
    }

    #[tokio::test]
    async fn test_unreachable_api_becomes_tool_error() {
        let client = NfzApiClient::new("http://127.0.0.1:9", "1.3");
        let tool = FindVisits::new(Arc::new(client));
        let err = tool
            .call(
                &ToolContext::default(),
                serde_json::json!({ "province": "07", "medical_service": "okulista" }),
            )
            .await
            .unwrap_err();
        assert!(err.starts_with("Visit search failed"));
    }
}
