// MCP tool registry and argument validation

use crate::protocol::{CallToolResult, ToolSchema};
use dealgate_core::{Credential, GatewayError, GatewayResult};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-call inputs a tool may use. Tools never look anything else up.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub credential: Credential,
    /// Public base URL of this gateway, without a trailing slash.
    pub base_url: String,
}

/// Tool executor trait
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool schema for MCP
    fn schema(&self) -> ToolSchema;

    /// Execute the tool with already-validated arguments
    async fn execute(&self, ctx: &ToolContext, arguments: Value) -> GatewayResult<CallToolResult>;
}

struct RegisteredTool {
    schema: ToolSchema,
    tool: Arc<dyn Tool>,
}

/// Tool registry, built once at startup. Listing keeps registration order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Duplicate names and inconsistent schemas are rejected.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> GatewayResult<()> {
        let schema = tool.schema();
        if self.by_name.contains_key(&schema.name) {
            return Err(GatewayError::Config(format!("duplicate tool name '{}'", schema.name)));
        }
        check_schema(&schema)?;

        self.by_name.insert(schema.name.clone(), self.tools.len());
        self.tools.push(RegisteredTool { schema, tool });
        Ok(())
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<(&ToolSchema, Arc<dyn Tool>)> {
        self.by_name
            .get(name)
            .map(|&i| (&self.tools[i].schema, self.tools[i].tool.clone()))
    }

    /// List all tool schemas
    pub fn list_schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|t| t.schema.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

fn check_schema(schema: &ToolSchema) -> GatewayResult<()> {
    let input = &schema.input_schema;
    if input.get("type").and_then(Value::as_str) != Some("object") {
        return Err(GatewayError::Config(format!(
            "tool '{}': inputSchema must be an object schema",
            schema.name
        )));
    }
    let properties = input.get("properties").and_then(Value::as_object);
    for name in required_names(input) {
        if !properties.is_some_and(|p| p.contains_key(name)) {
            return Err(GatewayError::Config(format!(
                "tool '{}': required property '{}' is not declared",
                schema.name, name
            )));
        }
    }
    Ok(())
}

fn required_names(schema: &Value) -> impl Iterator<Item = &str> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

/// Check `arguments` against an object schema: required names, declared
/// types, and unknown names when `additionalProperties` is false.
/// `null` counts as absent.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> GatewayResult<()> {
    let args = arguments
        .as_object()
        .ok_or_else(|| GatewayError::InvalidArguments("arguments must be an object".to_string()))?;
    let empty = Map::new();
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    for name in required_names(schema) {
        if args.get(name).map_or(true, Value::is_null) {
            return Err(GatewayError::InvalidArguments(format!("missing required argument '{}'", name)));
        }
    }

    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));
    for (name, value) in args {
        match properties.get(name) {
            Some(_) if value.is_null() => {}
            Some(prop) => check_type(name, prop, value)?,
            None if closed => {
                return Err(GatewayError::InvalidArguments(format!("unknown argument '{}'", name)));
            }
            None => {}
        }
    }
    Ok(())
}

fn check_type(name: &str, prop: &Value, value: &Value) -> GatewayResult<()> {
    let Some(expected) = prop.get("type").and_then(Value::as_str) else {
        return Ok(());
    };
    let ok = match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => match value.as_array() {
            Some(items) => match prop.get("items") {
                Some(item_schema) => items
                    .iter()
                    .enumerate()
                    .try_for_each(|(i, item)| check_type(&format!("{}[{}]", name, i), item_schema, item))
                    .is_ok(),
                None => true,
            },
            None => false,
        },
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        Err(GatewayError::InvalidArguments(format!(
            "argument '{}' must be of type {}",
            name, expected
        )))
    }
}

// Helper functions for creating tool schemas

/// Closed object schema: undeclared arguments are rejected.
pub fn json_schema_object(properties: Value, required: Vec<&str>) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}

pub fn json_schema_string(description: &str) -> Value {
    json!({
        "type": "string",
        "description": description
    })
}

pub fn json_schema_integer(description: &str) -> Value {
    json!({
        "type": "integer",
        "description": description
    })
}

pub fn json_schema_array(items: Value, description: &str) -> Value {
    json!({
        "type": "array",
        "items": items,
        "description": description
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo(&'static str, Value);

    #[async_trait::async_trait]
    impl Tool for Echo {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: self.0.to_string(),
                title: None,
                description: "echo".to_string(),
                input_schema: self.1.clone(),
            }
        }

        async fn execute(&self, _ctx: &ToolContext, arguments: Value) -> GatewayResult<CallToolResult> {
            Ok(CallToolResult::json(&arguments))
        }
    }

    fn schema() -> Value {
        json_schema_object(
            json!({
                "deal_id": json_schema_integer("deal"),
                "ids": json_schema_array(json!({"type": "integer"}), "ids"),
                "q": json_schema_string("query")
            }),
            vec!["deal_id"],
        )
    }

    #[test]
    fn test_register_rejects_duplicates_and_bad_required() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo("a", schema()))).unwrap();
        assert!(registry.register(Arc::new(Echo("a", schema()))).is_err());

        let broken = json_schema_object(json!({}), vec!["missing"]);
        assert!(registry.register(Arc::new(Echo("b", broken))).is_err());
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("a"));
    }

    #[test]
    fn test_list_preserves_registration_order() {
        let mut registry = ToolRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.register(Arc::new(Echo(name, schema()))).unwrap();
        }
        let names: Vec<_> = registry.list_schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_validate_arguments() {
        let s = schema();
        assert!(validate_arguments(&s, &json!({"deal_id": 5})).is_ok());
        assert!(validate_arguments(&s, &json!({"deal_id": 5, "ids": [1, 2], "q": null})).is_ok());

        for bad in [
            json!({}),
            json!({"deal_id": null}),
            json!({"deal_id": "5"}),
            json!({"deal_id": 5, "ids": [1, "x"]}),
            json!({"deal_id": 5, "extra": true}),
            json!([1]),
        ] {
            assert!(
                matches!(validate_arguments(&s, &bad), Err(GatewayError::InvalidArguments(_))),
                "accepted {}",
                bad
            );
        }
    }

    #[test]
    fn test_open_schema_allows_unknown() {
        let open = json!({"type": "object", "properties": {}});
        assert!(validate_arguments(&open, &json!({"anything": 1})).is_ok());
    }
}
