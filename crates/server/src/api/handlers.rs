use super::mcp::request_context;
use super::ApiResult;
use crate::config::AppState;
use axum::{
    extract::{Path, Query, RawQuery, State},
    http::HeaderMap,
    routing::{get, MethodRouter},
    Json,
};
use dealgate_core::deals::DealFilter;
use dealgate_core::upstream::QueryParams;
use dealgate_core::{Credential, GatewayError};
use dealgate_mcp::tools::{ParamKind, RecordSpec, RecordTool, RECORD_TOOLS};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Credential for a REST call, resolved like a `tools/call`.
pub(super) fn credential(state: &AppState, headers: &HeaderMap) -> ApiResult<Credential> {
    let ctx = request_context(state, headers);
    let (credential, _) = state
        .sessions
        .resolve_credential(ctx.session_id.as_ref(), ctx.credential_header.as_ref())?;
    Ok(credential)
}

/// Keep only `allowed` keys from a raw query string, preserving repeats and
/// dropping blanks.
fn passthrough_query(raw: Option<&str>, allowed: &[&str]) -> QueryParams {
    raw.map(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .filter(|(k, v)| allowed.contains(&k.as_ref()) && !v.trim().is_empty())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    })
    .unwrap_or_default()
}

/// One `GET` route per passthrough record tool: `/mcp/{routeName}` or
/// `/mcp/{routeName}/{id}`.
pub(super) fn record_routes() -> Vec<(String, MethodRouter<Arc<AppState>>)> {
    RECORD_TOOLS
        .iter()
        .map(|spec| {
            let path = format!("/mcp/{}", spec.route_name());
            match spec.id {
                Some(_) => (
                    format!("{}/{{id}}", path),
                    get(
                        move |State(state): State<Arc<AppState>>,
                              headers: HeaderMap,
                              Path(id): Path<String>,
                              RawQuery(raw): RawQuery| {
                            record_helper(state, headers, spec, Some(id), raw)
                        },
                    ),
                ),
                None => (
                    path,
                    get(
                        move |State(state): State<Arc<AppState>>, headers: HeaderMap, RawQuery(raw): RawQuery| {
                            record_helper(state, headers, spec, None, raw)
                        },
                    ),
                ),
            }
        })
        .collect()
}

fn check_integer(name: &str, value: &str) -> ApiResult<()> {
    if value.parse::<i64>().is_err() {
        return Err(GatewayError::InvalidArguments(format!("'{}' must be an integer", name)).into());
    }
    Ok(())
}

/// Map the path id and allow-listed query parameters onto tool arguments,
/// then fetch through the same code path as `tools/call`.
async fn record_helper(
    state: Arc<AppState>,
    headers: HeaderMap,
    spec: &'static RecordSpec,
    id: Option<String>,
    raw: Option<String>,
) -> ApiResult<Json<Value>> {
    let mut args = Map::new();
    if let (Some(p), Some(id)) = (spec.id, id) {
        if p.kind == ParamKind::Integer {
            check_integer(p.name, &id)?;
        }
        args.insert(p.name.to_string(), Value::String(id));
    }

    let allowed: Vec<&str> = spec.query.iter().map(|p| p.name).collect();
    for (name, value) in passthrough_query(raw.as_deref(), &allowed) {
        let Some(p) = spec.query.iter().find(|p| p.name == name) else {
            continue;
        };
        if p.kind != ParamKind::String {
            check_integer(p.name, &value)?;
        }
        if p.kind == ParamKind::IntegerList {
            if let Some(items) = args.entry(name).or_insert_with(|| Value::Array(Vec::new())).as_array_mut() {
                items.push(Value::String(value));
            }
        } else {
            args.insert(name, Value::String(value));
        }
    }

    let credential = credential(&state, &headers)?;
    let payload = RecordTool::new(spec, state.api.clone()).fetch(&credential, &args).await?;
    Ok(Json(payload))
}

#[derive(Debug, Deserialize)]
pub struct SearchDealsParams {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub updated_after: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Local name/address filter over the deal list
pub async fn search_deals(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<SearchDealsParams>,
) -> ApiResult<Json<Value>> {
    let filter = DealFilter::new(&params.query)
        .with_limit(params.limit)
        .with_updated_after(params.updated_after.as_deref().filter(|s| !s.trim().is_empty()))?;
    let credential = credential(&state, &headers)?;
    let deals = state.api.deals(&credential, &[]).await?;
    Ok(Json(filter.apply(&deals)))
}
