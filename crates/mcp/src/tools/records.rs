// Passthrough tools for upstream record endpoints, one table row per tool

use crate::protocol::{CallToolResult, ToolSchema};
use crate::tools::{json_schema_array, json_schema_integer, json_schema_object, json_schema_string, Tool, ToolContext};
use dealgate_core::upstream::QueryParams;
use dealgate_core::{Credential, DealpathApi, GatewayError, GatewayResult};
use serde_json::{json, Map, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    IntegerList,
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub description: &'static str,
}

const fn param(name: &'static str, kind: ParamKind, description: &'static str) -> ParamSpec {
    ParamSpec { name, kind, description }
}

/// One upstream GET endpoint exposed as a tool.
#[derive(Debug, Clone, Copy)]
pub struct RecordSpec {
    pub name: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    /// Slash-separated path; `{id}` is replaced by the id argument.
    pub path: &'static str,
    pub id: Option<ParamSpec>,
    /// Optional arguments forwarded as query parameters.
    pub query: &'static [ParamSpec],
    /// Query arguments that must be present.
    pub required_query: &'static [&'static str],
}

impl RecordSpec {
    /// camelCase name of the REST helper, e.g. `get_fields_by_deal_id` is
    /// served at `/mcp/getFieldsByDealId/{id}`.
    pub fn route_name(&self) -> String {
        let mut parts = self.name.split('_');
        let mut out = parts.next().unwrap_or_default().to_string();
        for part in parts {
            let mut chars = part.chars();
            if let Some(first) = chars.next() {
                out.push(first.to_ascii_uppercase());
                out.extend(chars);
            }
        }
        out
    }
}

const PAGING: &[ParamSpec] = &[
    param("page", ParamKind::Integer, "Page number"),
    param("per_page", ParamKind::Integer, "Results per page"),
];

const NEXT_TOKEN: &[ParamSpec] = &[param("next_token", ParamKind::String, "Pagination token from a previous call")];

const FILE_FILTERS: &[ParamSpec] = &[
    param("parent_folder_ids", ParamKind::IntegerList, "Only files inside these folders"),
    param("file_tag_definition_ids", ParamKind::IntegerList, "Only files carrying these tags"),
    param("updated_before", ParamKind::Integer, "Unix timestamp upper bound"),
    param("updated_after", ParamKind::Integer, "Unix timestamp lower bound"),
    param("next_token", ParamKind::String, "Pagination token from a previous call"),
];

const fn by_id(
    name: &'static str,
    title: &'static str,
    description: &'static str,
    path: &'static str,
    id: ParamSpec,
    query: &'static [ParamSpec],
) -> RecordSpec {
    RecordSpec {
        name,
        title,
        description,
        path,
        id: Some(id),
        query,
        required_query: &[],
    }
}

const fn listing(
    name: &'static str,
    title: &'static str,
    description: &'static str,
    path: &'static str,
    query: &'static [ParamSpec],
) -> RecordSpec {
    RecordSpec {
        name,
        title,
        description,
        path,
        id: None,
        query,
        required_query: &[],
    }
}

/// Every passthrough tool, in listing order.
pub const RECORD_TOOLS: &[RecordSpec] = &[
    listing(
        "get_deals",
        "List Deals",
        "Return deals with optional filters: status, propertyType.",
        "deals",
        &[
            param("status", ParamKind::String, "Deal status"),
            param("propertyType", ParamKind::String, "Property type"),
        ],
    ),
    by_id(
        "get_deal",
        "Get Deal",
        "Return a single deal by ID.",
        "deal/{id}",
        param("deal_id", ParamKind::String, "Deal ID"),
        &[],
    ),
    by_id(
        "get_deal_files",
        "Deal Files",
        "List files for a deal with optional filters.",
        "files/deal/{id}",
        param("deal_id", ParamKind::Integer, "Deal ID"),
        FILE_FILTERS,
    ),
    RecordSpec {
        name: "search",
        title: "Search",
        description: "Global Dealpath search.",
        path: "search",
        id: None,
        query: &[param("query", ParamKind::String, "Search text")],
        required_query: &["query"],
    },
    listing(
        "get_assets",
        "List Assets",
        "Return assets with optional filters.",
        "assets",
        &[
            param("property_type", ParamKind::String, "Property type"),
            param("status", ParamKind::String, "Asset status"),
        ],
    ),
    listing(
        "get_field_definitions",
        "Field Definitions",
        "List custom field definitions.",
        "field_definitions",
        PAGING,
    ),
    by_id(
        "get_fields_by_deal_id",
        "Deal Fields",
        "Custom field values for a deal.",
        "fields/deal/{id}",
        param("deal_id", ParamKind::String, "Deal ID"),
        NEXT_TOKEN,
    ),
    by_id(
        "get_fields_by_investment_id",
        "Investment Fields",
        "Custom field values for an investment.",
        "fields/investment/{id}",
        param("investment_id", ParamKind::String, "Investment ID"),
        NEXT_TOKEN,
    ),
    by_id(
        "get_fields_by_property_id",
        "Property Fields",
        "Custom field values for a property.",
        "fields/property/{id}",
        param("property_id", ParamKind::String, "Property ID"),
        NEXT_TOKEN,
    ),
    by_id(
        "get_fields_by_asset_id",
        "Asset Fields",
        "Custom field values for an asset.",
        "fields/asset/{id}",
        param("asset_id", ParamKind::String, "Asset ID"),
        NEXT_TOKEN,
    ),
    by_id(
        "get_fields_by_loan_id",
        "Loan Fields",
        "Custom field values for a loan.",
        "fields/loan/{id}",
        param("loan_id", ParamKind::String, "Loan ID"),
        NEXT_TOKEN,
    ),
    by_id(
        "get_fields_by_field_definition_id",
        "Fields by Definition",
        "All values recorded for one field definition.",
        "fields/field_definition/{id}",
        param("field_definition_id", ParamKind::String, "Field definition ID"),
        NEXT_TOKEN,
    ),
    by_id(
        "get_asset_files_by_id",
        "Asset Files",
        "List files for an asset with optional filters.",
        "files/asset/{id}",
        param("asset_id", ParamKind::Integer, "Asset ID"),
        FILE_FILTERS,
    ),
    listing(
        "get_file_tag_definitions",
        "File Tags",
        "List file tag definitions.",
        "file_tag_definitions",
        PAGING,
    ),
    by_id(
        "get_folders_by_deal_id",
        "Deal Folders",
        "List folders for a deal.",
        "folders/deal/{id}",
        param("deal_id", ParamKind::Integer, "Deal ID"),
        NEXT_TOKEN,
    ),
    by_id(
        "get_folders_by_asset_id",
        "Asset Folders",
        "List folders for an asset.",
        "folders/asset/{id}",
        param("asset_id", ParamKind::Integer, "Asset ID"),
        NEXT_TOKEN,
    ),
    listing("get_investments", "Investments", "List investments.", "investments", PAGING),
    by_id(
        "get_list_options_by_field_definition_id",
        "List Options",
        "Allowed values for a list-type field definition.",
        "list_options/field_definition/{id}",
        param("field_definition_id", ParamKind::String, "Field definition ID"),
        NEXT_TOKEN,
    ),
    listing("get_loans", "Loans", "List loans.", "loans", PAGING),
    listing("get_people", "People", "List people.", "people", PAGING),
    by_id(
        "get_property_by_id",
        "Get Property",
        "Return a single property by ID.",
        "property/{id}",
        param("property_id", ParamKind::String, "Property ID"),
        &[],
    ),
    listing("get_properties", "Properties", "List properties.", "properties", PAGING),
    by_id(
        "get_roles_by_deal_id",
        "Deal Roles",
        "People and their roles on a deal.",
        "roles/deal/{id}",
        param("deal_id", ParamKind::String, "Deal ID"),
        NEXT_TOKEN,
    ),
    by_id(
        "get_roles_by_asset_id",
        "Asset Roles",
        "People and their roles on an asset.",
        "roles/asset/{id}",
        param("asset_id", ParamKind::String, "Asset ID"),
        NEXT_TOKEN,
    ),
];

fn param_schema(p: &ParamSpec) -> Value {
    match p.kind {
        ParamKind::String => json_schema_string(p.description),
        ParamKind::Integer => json_schema_integer(p.description),
        ParamKind::IntegerList => json_schema_array(json!({"type": "integer"}), p.description),
    }
}

/// Render a scalar argument as a query or path value.
fn scalar(name: &str, value: &Value) -> GatewayResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(GatewayError::InvalidArguments(format!("argument '{}' must be a scalar", name))),
    }
}

/// A [`RecordSpec`] bound to an upstream client.
pub struct RecordTool {
    spec: &'static RecordSpec,
    api: Arc<dyn DealpathApi>,
}

impl RecordTool {
    pub fn new(spec: &'static RecordSpec, api: Arc<dyn DealpathApi>) -> Self {
        Self { spec, api }
    }

    /// One tool per row of [`RECORD_TOOLS`].
    pub fn all(api: Arc<dyn DealpathApi>) -> Vec<Self> {
        RECORD_TOOLS.iter().map(|spec| Self::new(spec, api.clone())).collect()
    }

    fn query(&self, args: &Map<String, Value>) -> GatewayResult<QueryParams> {
        let mut query = QueryParams::new();
        for p in self.spec.query {
            let Some(value) = args.get(p.name).filter(|v| !v.is_null()) else {
                continue;
            };
            match (p.kind, value) {
                (ParamKind::IntegerList, Value::Array(items)) => {
                    for item in items {
                        query.push((p.name.to_string(), scalar(p.name, item)?));
                    }
                }
                _ => {
                    let text = scalar(p.name, value)?;
                    // Blank optional filters are dropped rather than sent empty.
                    if !text.is_empty() {
                        query.push((p.name.to_string(), text));
                    }
                }
            }
        }
        Ok(query)
    }
}

#[async_trait::async_trait]
impl Tool for RecordTool {
    fn schema(&self) -> ToolSchema {
        let mut properties = Map::new();
        let mut required = Vec::new();
        if let Some(id) = &self.spec.id {
            properties.insert(id.name.to_string(), param_schema(id));
            required.push(id.name);
        }
        for p in self.spec.query {
            properties.insert(p.name.to_string(), param_schema(p));
        }
        required.extend(self.spec.required_query.iter().copied());

        ToolSchema {
            name: self.spec.name.to_string(),
            title: Some(self.spec.title.to_string()),
            description: self.spec.description.to_string(),
            input_schema: json_schema_object(Value::Object(properties), required),
        }
    }

    async fn execute(&self, ctx: &ToolContext, arguments: Value) -> GatewayResult<CallToolResult> {
        let args = arguments.as_object().cloned().unwrap_or_default();
        let payload = self.fetch(&ctx.credential, &args).await?;
        Ok(CallToolResult::json(&payload))
    }
}

impl RecordTool {
    /// Call the upstream endpoint and return its JSON untouched. Shared by
    /// `tools/call` and the REST helpers.
    pub async fn fetch(&self, credential: &Credential, args: &Map<String, Value>) -> GatewayResult<Value> {
        let id = match &self.spec.id {
            Some(p) => {
                let value = args
                    .get(p.name)
                    .ok_or_else(|| GatewayError::InvalidArguments(format!("missing required argument '{}'", p.name)))?;
                let id = scalar(p.name, value)?;
                if id.trim().is_empty() {
                    return Err(GatewayError::InvalidArguments(format!("argument '{}' must not be empty", p.name)));
                }
                Some(id)
            }
            None => None,
        };
        for name in self.spec.required_query {
            let present = args
                .get(*name)
                .and_then(Value::as_str)
                .is_some_and(|s| !s.trim().is_empty());
            if !present {
                return Err(GatewayError::InvalidArguments(format!("argument '{}' must not be empty", name)));
            }
        }

        let segments: Vec<&str> = self
            .spec
            .path
            .split('/')
            .map(|s| match (&id, s) {
                (Some(id), "{id}") => id.as_str(),
                _ => s,
            })
            .collect();
        let query = self.query(args)?;

        tracing::debug!(tool = self.spec.name, params = query.len(), "Calling upstream");
        self.api.get_json(credential, &segments, &query).await
    }
}
