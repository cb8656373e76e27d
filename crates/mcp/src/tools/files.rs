// get_file_by_id: hands out links according to the delivery strategy

use crate::protocol::{CallToolResult, ToolContent, ToolSchema};
use crate::tools::{json_schema_object, json_schema_string, Tool, ToolContext};
use dealgate_core::files::{Delivery, FileDelivery};
use dealgate_core::{GatewayError, GatewayResult};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

pub struct GetFileByIdTool {
    delivery: Arc<FileDelivery>,
}

impl GetFileByIdTool {
    pub fn new(delivery: Arc<FileDelivery>) -> Self {
        Self { delivery }
    }
}

#[derive(Debug, Deserialize)]
struct GetFileArgs {
    file_id: String,
}

/// URL of the gateway's streaming route for a file.
pub fn proxy_url(base_url: &str, file_id: &str) -> String {
    format!(
        "{}/mcp/getFileById/{}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(file_id)
    )
}

#[async_trait::async_trait]
impl Tool for GetFileByIdTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "get_file_by_id".to_string(),
            title: Some("Get File".to_string()),
            description: "Return a download link for a file.".to_string(),
            input_schema: json_schema_object(
                serde_json::json!({
                    "file_id": json_schema_string("The file ID")
                }),
                vec!["file_id"],
            ),
        }
    }

    async fn execute(&self, ctx: &ToolContext, arguments: Value) -> GatewayResult<CallToolResult> {
        let args: GetFileArgs = serde_json::from_value(arguments)
            .map_err(|e| GatewayError::InvalidArguments(format!("get_file_by_id: {}", e)))?;
        let file_id = args.file_id.trim();

        let content = match self.delivery.deliver(&ctx.credential, file_id).await? {
            Delivery::Remote { descriptor } => vec![
                ToolContent::text(format!(
                    "Link for file '{}' (id {}):\n- Remote (expires): {}",
                    descriptor.filename, file_id, descriptor.remote_signed_url
                )),
                ToolContent::link(descriptor.remote_signed_url, descriptor.filename, descriptor.content_type),
            ],
            Delivery::Proxied { descriptor } => {
                let uri = proxy_url(&ctx.base_url, file_id);
                vec![
                    ToolContent::text(format!(
                        "Link for file '{}' (id {}):\n- Stream: {}",
                        descriptor.filename, file_id, uri
                    )),
                    ToolContent::link(uri, descriptor.filename, descriptor.content_type),
                ]
            }
            Delivery::Cached { entry, descriptor } => {
                let local = format!("{}{}", ctx.base_url.trim_end_matches('/'), entry.url_path());
                let mut summary = format!(
                    "Links for file '{}' (id {}):\n- Local: {}",
                    entry.filename, file_id, local
                );
                if let Some(d) = &descriptor {
                    summary.push_str(&format!("\n- Remote (expires): {}", d.remote_signed_url));
                }

                let mut parts = vec![
                    ToolContent::text(summary),
                    ToolContent::link(local, entry.filename.clone(), entry.content_type.clone()),
                ];
                // Remote last: some clients only show the final part.
                if let Some(d) = descriptor {
                    parts.push(ToolContent::link(d.remote_signed_url, entry.filename, d.content_type));
                }
                parts
            }
        };
        Ok(CallToolResult::new(content))
    }
}
