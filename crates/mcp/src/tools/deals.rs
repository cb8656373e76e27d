// Local text search over the upstream deal list

use crate::protocol::{CallToolResult, ToolSchema};
use crate::tools::{json_schema_integer, json_schema_object, json_schema_string, Tool, ToolContext};
use dealgate_core::deals::DealFilter;
use dealgate_core::{DealpathApi, GatewayResult};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// `search_deals`: fetch `/deals` once and filter name and address locally.
pub struct SearchDealsTool {
    api: Arc<dyn DealpathApi>,
}

impl SearchDealsTool {
    pub fn new(api: Arc<dyn DealpathApi>) -> Self {
        Self { api }
    }
}

#[derive(Debug, Deserialize)]
struct SearchDealsArgs {
    query: String,
    #[serde(default)]
    updated_after: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

#[async_trait::async_trait]
impl Tool for SearchDealsTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "search_deals".to_string(),
            title: Some("Search Deals".to_string()),
            description: "Case-insensitive search over deal names and addresses.".to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "query": json_schema_string("Text to look for in deal name or address"),
                    "updated_after": json_schema_string("Only deals updated after this date (YYYY-MM-DD or RFC 3339)"),
                    "limit": json_schema_integer("Maximum results, 1-100 (default 25)")
                }),
                vec!["query"],
            ),
        }
    }

    async fn execute(&self, ctx: &ToolContext, arguments: Value) -> GatewayResult<CallToolResult> {
        let args: SearchDealsArgs = serde_json::from_value(arguments)
            .map_err(|e| dealgate_core::GatewayError::InvalidArguments(format!("search_deals: {}", e)))?;

        let filter = DealFilter::new(&args.query)
            .with_limit(args.limit)
            .with_updated_after(args.updated_after.as_deref())?;

        let deals = self.api.deals(&ctx.credential, &[]).await?;
        Ok(CallToolResult::json(&filter.apply(&deals)))
    }
}
