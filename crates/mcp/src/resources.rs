// URI-template resources backed by the deal endpoints

use crate::protocol::{ResourceContents, ResourceInfo, ResourceTemplateInfo};
use dealgate_core::deals::{DealFilter, DealRecord};
use dealgate_core::{Credential, DealpathApi, GatewayResult};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    DealJson,
    DealMarkdown,
    DealSearch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Placeholder(String),
}

/// A URI pattern with `{name}` placeholders.
#[derive(Debug, Clone)]
pub struct ResourceTemplate {
    pub uri_template: &'static str,
    pub name: &'static str,
    pub mime_type: &'static str,
    pub description: &'static str,
    pub kind: ResourceKind,
    parts: Vec<Part>,
}

impl ResourceTemplate {
    pub fn new(
        uri_template: &'static str,
        name: &'static str,
        mime_type: &'static str,
        description: &'static str,
        kind: ResourceKind,
    ) -> Self {
        Self {
            uri_template,
            name,
            mime_type,
            description,
            kind,
            parts: parse_template(uri_template),
        }
    }

    /// Total length of the literal text; longer means more specific.
    fn literal_len(&self) -> usize {
        self.parts
            .iter()
            .map(|p| match p {
                Part::Literal(s) => s.len(),
                Part::Placeholder(_) => 0,
            })
            .sum()
    }

    /// Match `uri`, returning percent-decoded placeholder values. Values are
    /// non-empty and never contain `/`.
    pub fn matches(&self, uri: &str) -> Option<HashMap<String, String>> {
        let mut raw = Vec::new();
        if !match_parts(&self.parts, uri, &mut raw) {
            return None;
        }
        raw.into_iter()
            .map(|(name, value)| {
                urlencoding::decode(value)
                    .ok()
                    .filter(|v| !v.is_empty() && !v.contains('/'))
                    .map(|v| (name, v.into_owned()))
            })
            .collect()
    }
}

fn parse_template(template: &str) -> Vec<Part> {
    let mut parts = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}').map(|c| open + c) else {
            break;
        };
        if open > 0 {
            parts.push(Part::Literal(rest[..open].to_string()));
        }
        parts.push(Part::Placeholder(rest[open + 1..close].to_string()));
        rest = &rest[close + 1..];
    }
    if !rest.is_empty() {
        parts.push(Part::Literal(rest.to_string()));
    }
    parts
}

fn match_parts<'a>(parts: &[Part], input: &'a str, out: &mut Vec<(String, &'a str)>) -> bool {
    match parts.split_first() {
        None => input.is_empty(),
        Some((Part::Literal(lit), rest)) => input
            .strip_prefix(lit.as_str())
            .is_some_and(|remaining| match_parts(rest, remaining, out)),
        Some((Part::Placeholder(name), rest)) => {
            // Try every split point; placeholders stop at the first '/'.
            let limit = input.find('/').unwrap_or(input.len());
            for end in (1..=limit).rev() {
                if !input.is_char_boundary(end) {
                    continue;
                }
                let mark = out.len();
                out.push((name.clone(), &input[..end]));
                if match_parts(rest, &input[end..], out) {
                    return true;
                }
                out.truncate(mark);
            }
            false
        }
    }
}

/// A template matched against a concrete URI.
#[derive(Debug, Clone)]
pub struct ResourceMatch {
    pub uri: String,
    pub kind: ResourceKind,
    pub mime_type: &'static str,
    pub params: HashMap<String, String>,
}

impl ResourceMatch {
    pub fn param(&self, name: &str) -> &str {
        self.params.get(name).map(String::as_str).unwrap_or_default()
    }
}

/// Ordered template table plus the upstream used to materialize matches.
pub struct ResourceRegistry {
    templates: Vec<ResourceTemplate>,
    api: Arc<dyn DealpathApi>,
}

impl ResourceRegistry {
    pub fn new(api: Arc<dyn DealpathApi>) -> Self {
        let mut templates = vec![
            ResourceTemplate::new(
                "dealpath://deal/{id}.json",
                "Deal (JSON)",
                "application/json",
                "A single deal record as returned by the API",
                ResourceKind::DealJson,
            ),
            ResourceTemplate::new(
                "dealpath://deal/{id}.md",
                "Deal (Markdown)",
                "text/markdown",
                "A single deal rendered as a Markdown summary",
                ResourceKind::DealMarkdown,
            ),
            ResourceTemplate::new(
                "dealpath://search/{query}.json",
                "Deal search",
                "application/json",
                "Deals whose name or address contains the query",
                ResourceKind::DealSearch,
            ),
        ];
        // Most specific first; stable for equal lengths.
        templates.sort_by_key(|t| std::cmp::Reverse(t.literal_len()));
        Self { templates, api }
    }

    pub fn templates(&self) -> &[ResourceTemplate] {
        &self.templates
    }

    pub fn list(&self) -> Vec<ResourceInfo> {
        self.templates
            .iter()
            .map(|t| ResourceInfo {
                uri: t.uri_template.to_string(),
                name: t.name.to_string(),
                mime_type: t.mime_type.to_string(),
                description: t.description.to_string(),
            })
            .collect()
    }

    pub fn list_templates(&self) -> Vec<ResourceTemplateInfo> {
        self.templates
            .iter()
            .map(|t| ResourceTemplateInfo {
                uri_template: t.uri_template.to_string(),
                name: t.name.to_string(),
                mime_type: t.mime_type.to_string(),
                description: t.description.to_string(),
            })
            .collect()
    }

    /// First matching template, in specificity order.
    pub fn resolve(&self, uri: &str) -> Option<ResourceMatch> {
        self.templates.iter().find_map(|t| {
            t.matches(uri).map(|params| ResourceMatch {
                uri: uri.to_string(),
                kind: t.kind,
                mime_type: t.mime_type,
                params,
            })
        })
    }

    /// Fetch and render a matched resource.
    pub async fn read(&self, matched: &ResourceMatch, credential: &Credential) -> GatewayResult<ResourceContents> {
        let text = match matched.kind {
            ResourceKind::DealJson | ResourceKind::DealMarkdown => {
                let id = matched.param("id");
                let payload = self.api.deal(credential, id).await?;
                let record = DealRecord::from_payload(id, payload);
                if matched.kind == ResourceKind::DealJson {
                    record.to_json_text()
                } else {
                    record.to_markdown()
                }
            }
            ResourceKind::DealSearch => {
                let deals = self.api.deals(credential, &[]).await?;
                DealFilter::new(matched.param("query")).apply(&deals).to_string()
            }
        };

        Ok(ResourceContents {
            uri: matched.uri.clone(),
            mime_type: matched.mime_type.to_string(),
            text,
        })
    }
}
