//! Local filtering and rendering of deal records.
//!
//! Nothing here talks to the upstream; callers fetch first and hand the
//! payload over.

use crate::error::{GatewayError, GatewayResult};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::{json, Map, Value};
use std::fmt::Write as _;

pub const DEFAULT_SEARCH_LIMIT: usize = 25;
pub const MAX_SEARCH_LIMIT: usize = 100;

/// Text filter applied to an already-fetched deal list.
#[derive(Debug, Clone, PartialEq)]
pub struct DealFilter {
    query: String,
    updated_after: Option<DateTime<Utc>>,
    limit: usize,
}

impl DealFilter {
    pub fn new(query: &str) -> Self {
        Self {
            query: query.trim().to_lowercase(),
            updated_after: None,
            limit: DEFAULT_SEARCH_LIMIT,
        }
    }

    /// Clamp into `1..=100`; `None` keeps the default.
    pub fn with_limit(mut self, limit: Option<i64>) -> Self {
        if let Some(limit) = limit {
            self.limit = limit.clamp(1, MAX_SEARCH_LIMIT as i64) as usize;
        }
        self
    }

    /// Accepts RFC 3339, `YYYY-MM-DD`, or unix seconds.
    pub fn with_updated_after(mut self, raw: Option<&str>) -> GatewayResult<Self> {
        if let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) {
            let parsed = parse_timestamp(raw).ok_or_else(|| {
                GatewayError::InvalidArguments(format!("updated_after: unrecognized timestamp '{}'", raw))
            })?;
            self.updated_after = Some(parsed);
        }
        Ok(self)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn matches(&self, deal: &Value) -> bool {
        if let Some(after) = self.updated_after {
            let updated = deal
                .get("last_updated")
                .or_else(|| deal.get("updated_at"))
                .and_then(timestamp_of);
            match updated {
                Some(ts) if ts > after => {}
                _ => return false,
            }
        }

        if self.query.is_empty() {
            return true;
        }
        let mut haystack = String::new();
        if let Some(name) = deal.get("name") {
            collect_text(name, &mut haystack);
        }
        if let Some(address) = deal.get("address") {
            collect_text(address, &mut haystack);
        }
        haystack.to_lowercase().contains(&self.query)
    }

    /// Filter an upstream `/deals` payload into `{"deals":{"data":[..],"next_token":null}}`.
    pub fn apply(&self, payload: &Value) -> Value {
        let data: Vec<Value> = deal_list(payload)
            .iter()
            .filter(|d| self.matches(d))
            .take(self.limit)
            .cloned()
            .collect();
        json!({ "deals": { "data": data, "next_token": null } })
    }
}

/// Pull the deal array out of the upstream envelope. Accepts a bare array too.
pub fn deal_list(payload: &Value) -> &[Value] {
    payload
        .pointer("/deals/data")
        .or_else(|| payload.get("data"))
        .unwrap_or(payload)
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn collect_text(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            out.push_str(s);
            out.push(' ');
        }
        Value::Number(n) => {
            let _ = write!(out, "{} ", n);
        }
        Value::Array(items) => items.iter().for_each(|v| collect_text(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_text(v, out)),
        Value::Bool(_) | Value::Null => {}
    }
}

fn timestamp_of(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    // Upstream sometimes omits the offset
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|d| d.and_utc());
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

/// One fetched deal. JSON and Markdown views are both rendered from this,
/// so they always agree on the id.
#[derive(Debug, Clone)]
pub struct DealRecord {
    id: String,
    envelope: Value,
}

impl DealRecord {
    /// Wrap an upstream `/deal/{id}` payload, filling in the id if the upstream
    /// left it out.
    pub fn from_payload(requested_id: &str, payload: Value) -> Self {
        let mut envelope = payload;
        let id = match record_mut(&mut envelope) {
            Some(record) => match record.get("id") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => {
                    record.insert("id".to_string(), Value::String(requested_id.to_string()));
                    requested_id.to_string()
                }
            },
            None => {
                envelope = json!({ "deal": { "data": { "id": requested_id } } });
                requested_id.to_string()
            }
        };
        Self { id, envelope }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &Value {
        self.envelope
            .pointer("/deal/data")
            .unwrap_or(&self.envelope)
    }

    pub fn to_json_text(&self) -> String {
        self.envelope.to_string()
    }

    pub fn to_markdown(&self) -> String {
        let data = self.data();
        let name = data
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("Untitled deal");

        let mut md = format!("# {}\n\n", name);
        let _ = writeln!(md, "- **ID**: {}", self.id);

        let labelled = [
            ("deal_state", "Status"),
            ("deal_type", "Property type"),
            ("stage", "Stage"),
            ("last_updated", "Last updated"),
        ];
        for (field, label) in labelled {
            if let Some(value) = data.get(field).and_then(scalar_text) {
                let _ = writeln!(md, "- **{}**: {}", label, value);
            }
        }

        if let Some(address) = data.get("address") {
            let mut text = String::new();
            collect_text(address, &mut text);
            let text = text.trim();
            if !text.is_empty() {
                let _ = writeln!(md, "- **Address**: {}", text);
            }
        }

        let skip = ["id", "name", "deal_state", "deal_type", "stage", "last_updated", "address"];
        let extra: Vec<(&String, String)> = data
            .as_object()
            .into_iter()
            .flat_map(Map::iter)
            .filter(|(k, _)| !skip.contains(&k.as_str()))
            .filter_map(|(k, v)| scalar_text(v).map(|t| (k, t)))
            .collect();
        if !extra.is_empty() {
            md.push_str("\n## Details\n\n");
            for (key, value) in extra {
                let _ = writeln!(md, "- {}: {}", key, value);
            }
        }
        md
    }
}

fn record_mut(envelope: &mut Value) -> Option<&mut Map<String, Value>> {
    if envelope.pointer("/deal/data").is_some_and(Value::is_object) {
        envelope.pointer_mut("/deal/data").and_then(Value::as_object_mut)
    } else {
        envelope.as_object_mut()
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
