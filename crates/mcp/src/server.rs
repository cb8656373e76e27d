// MCP request dispatcher: the single entry point the HTTP transport calls

use crate::protocol::{
    CallToolParams, InitializeParams, InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ListChanged,
    ListToolsResult, ReadResourceParams, ReadResourceResult, ResourcesCapability, ServerCapabilities, ServerInfo,
    PROTOCOL_VERSION,
};
use crate::resources::ResourceRegistry;
use crate::tools::{validate_arguments, GetFileByIdTool, RecordTool, SearchDealsTool, ToolContext, ToolRegistry};
use dealgate_core::files::FileDelivery;
use dealgate_core::{Credential, DealpathApi, GatewayError, GatewayResult, SessionId, SessionManager};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Transport-level facts about one HTTP request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// From the `Mcp-Session-Id` header.
    pub session_id: Option<SessionId>,
    /// From the `X-Dealpath-Key` header.
    pub credential_header: Option<Credential>,
    /// Public base URL used to build links, without a trailing slash.
    pub base_url: String,
}

/// Response(s) for one HTTP body, plus the session a nested `initialize`
/// created or reused.
#[derive(Debug)]
pub struct Dispatched {
    pub body: Value,
    pub session_id: Option<SessionId>,
}

pub struct McpServer {
    tools: ToolRegistry,
    resources: ResourceRegistry,
    sessions: Arc<SessionManager>,
    server_info: ServerInfo,
}

impl McpServer {
    pub fn new(tools: ToolRegistry, resources: ResourceRegistry, sessions: Arc<SessionManager>) -> Self {
        Self {
            tools,
            resources,
            sessions,
            server_info: ServerInfo {
                name: "dealgate".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    /// Build the standard catalog: record passthroughs, `search_deals`,
    /// `get_file_by_id`, and the deal resources.
    pub fn with_default_catalog(
        api: Arc<dyn DealpathApi>,
        delivery: Arc<FileDelivery>,
        sessions: Arc<SessionManager>,
    ) -> GatewayResult<Self> {
        let mut tools = ToolRegistry::new();
        for tool in RecordTool::all(api.clone()) {
            tools.register(Arc::new(tool))?;
        }
        tools.register(Arc::new(SearchDealsTool::new(api.clone())))?;
        tools.register(Arc::new(GetFileByIdTool::new(delivery)))?;

        info!(tools = tools.len(), "Tool registry built");
        Ok(Self::new(tools, ResourceRegistry::new(api), sessions))
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Handle a raw HTTP body: a single request or a batch.
    pub async fn handle_body(&self, body: &[u8], ctx: &RequestContext) -> Dispatched {
        let value: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "Unparseable JSON-RPC body");
                return Dispatched {
                    body: to_value(JsonRpcResponse::error(Value::Null, JsonRpcError::parse_error())),
                    session_id: None,
                };
            }
        };

        match value {
            Value::Array(items) if items.is_empty() => Dispatched {
                body: to_value(JsonRpcResponse::error(
                    Value::Null,
                    JsonRpcError::invalid_request("Empty batch"),
                )),
                session_id: None,
            },
            Value::Array(items) => {
                let results =
                    futures::future::join_all(items.into_iter().map(|item| self.handle_value(item, ctx))).await;
                let session_id = results.iter().find_map(|(_, s)| s.clone());
                Dispatched {
                    body: Value::Array(results.into_iter().map(|(r, _)| to_value(r)).collect()),
                    session_id,
                }
            }
            single => {
                let (response, session_id) = self.handle_value(single, ctx).await;
                Dispatched {
                    body: to_value(response),
                    session_id,
                }
            }
        }
    }

    /// Handle one decoded JSON value. Always produces a response.
    pub async fn handle_value(&self, value: Value, ctx: &RequestContext) -> (JsonRpcResponse, Option<SessionId>) {
        let id = value.get("id").cloned().unwrap_or(Value::Null);
        if !value.is_object() {
            return (
                JsonRpcResponse::error(id, JsonRpcError::invalid_request("Request must be an object")),
                None,
            );
        }
        let request: JsonRpcRequest = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                return (
                    JsonRpcResponse::error(id, JsonRpcError::invalid_request(format!("Invalid Request: {}", e))),
                    None,
                )
            }
        };
        if request.jsonrpc.as_deref().is_some_and(|v| v != "2.0") {
            return (
                JsonRpcResponse::error(id, JsonRpcError::invalid_request("Unsupported jsonrpc version")),
                None,
            );
        }
        self.handle_request(request, ctx).await
    }

    pub async fn handle_request(
        &self,
        request: JsonRpcRequest,
        ctx: &RequestContext,
    ) -> (JsonRpcResponse, Option<SessionId>) {
        let id = request.response_id();
        let method = request.method.clone();
        debug!(method = %method, "JSON-RPC request");

        let outcome = if method == "initialize" {
            self.initialize(request.params, ctx)
                .map(|(result, session)| (result, Some(session)))
        } else {
            if let Some(session_id) = &ctx.session_id {
                self.sessions.touch(session_id);
            }
            self.dispatch(&method, request.params, ctx).await.map(|r| (r, None))
        };

        match outcome {
            Ok((result, session)) => (JsonRpcResponse::success(id, result), session),
            Err(err) => {
                log_failure(&method, &err);
                (JsonRpcResponse::error(id, JsonRpcError::from(&err)), None)
            }
        }
    }

    async fn dispatch(&self, method: &str, params: Option<Value>, ctx: &RequestContext) -> GatewayResult<Value> {
        match method {
            "tools/list" | "tools.list" => Ok(to_value(ListToolsResult {
                tools: self.tools.list_schemas(),
            })),
            "tools/call" | "tools.call" => self.call_tool(params, ctx).await,
            "resources/list" => Ok(json!({ "resources": self.resources.list() })),
            "resources/templates/list" => Ok(json!({ "resourceTemplates": self.resources.list_templates() })),
            "resources/read" => self.read_resource(params, ctx).await,
            "ping" => Ok(json!({})),
            m if m.starts_with("notifications/") => Ok(json!({})),
            other => Err(GatewayError::MethodNotFound(other.to_string())),
        }
    }

    fn initialize(&self, params: Option<Value>, ctx: &RequestContext) -> GatewayResult<(Value, SessionId)> {
        let params: InitializeParams = parse_params(params)?;
        self.sessions.reap_idle();

        let session_id = match &ctx.session_id {
            Some(existing) if self.sessions.contains(existing) => existing.clone(),
            _ => self.sessions.create_session(),
        };
        let override_credential = Credential::from_optional(params.dealpath_key.as_deref())
            .or_else(|| ctx.credential_header.clone());
        let has_override = override_credential.is_some();
        if let Some(credential) = override_credential {
            self.sessions.set_credential(&session_id, credential)?;
        }

        info!(
            session_id = %session_id,
            client = params.client_info.as_ref().map(|c| c.name.as_str()).unwrap_or("unknown"),
            credential_override = has_override,
            "Session initialized"
        );

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: ListChanged { list_changed: false },
                resources: ResourcesCapability {
                    subscribe: false,
                    list_changed: false,
                },
            },
            server_info: self.server_info.clone(),
        };
        Ok((to_value(result), session_id))
    }

    async fn call_tool(&self, params: Option<Value>, ctx: &RequestContext) -> GatewayResult<Value> {
        let params: CallToolParams = parse_params(params)?;
        if params.name.trim().is_empty() {
            return Err(GatewayError::InvalidArguments("Missing tool name".to_string()));
        }
        let (schema, tool) = self
            .tools
            .get(&params.name)
            .ok_or_else(|| GatewayError::NotFound(format!("tool {}", params.name)))?;

        let arguments = match params.arguments {
            None | Some(Value::Null) => json!({}),
            Some(args) => args,
        };
        validate_arguments(&schema.input_schema, &arguments)?;

        let tool_ctx = ToolContext {
            credential: self.credential(ctx)?,
            base_url: ctx.base_url.clone(),
        };
        debug!(tool = %params.name, "Calling tool");
        let result = tool.execute(&tool_ctx, arguments).await?;
        Ok(to_value(result))
    }

    async fn read_resource(&self, params: Option<Value>, ctx: &RequestContext) -> GatewayResult<Value> {
        let params: ReadResourceParams = parse_params(params)?;
        let matched = self
            .resources
            .resolve(&params.uri)
            .ok_or_else(|| GatewayError::NotFound(format!("resource {}", params.uri)))?;
        let credential = self.credential(ctx)?;
        let contents = self.resources.read(&matched, &credential).await?;
        Ok(to_value(ReadResourceResult {
            contents: vec![contents],
        }))
    }

    fn credential(&self, ctx: &RequestContext) -> GatewayResult<Credential> {
        let (credential, source) = self
            .sessions
            .resolve_credential(ctx.session_id.as_ref(), ctx.credential_header.as_ref())?;
        debug!(source = ?source, "Resolved upstream credential");
        Ok(credential)
    }
}

/// Absent params are treated as `{}`.
fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> GatewayResult<T> {
    let value = match params {
        None | Some(Value::Null) => json!({}),
        Some(value) => value,
    };
    serde_json::from_value(value).map_err(|e| GatewayError::InvalidArguments(format!("Invalid params: {}", e)))
}

fn to_value<T: serde::Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        error!(error = %e, "Failed to serialize response");
        Value::Null
    })
}

fn log_failure(method: &str, err: &GatewayError) {
    match err {
        GatewayError::Io(_) | GatewayError::Internal(_) | GatewayError::Config(_) => {
            error!(method, error = %err, "Request failed")
        }
        e if e.is_upstream() => warn!(method, error = %err, "Upstream call failed"),
        _ => debug!(method, code = err.code(), error = %err, "Request rejected"),
    }
}
