//! Tool specifications and compact descriptors.
//!
//! A `ToolSpec` is the registered source of truth for one provider action.
//! Search returns `ToolDescriptor`s: compact projections whose output schema
//! is flattened to leaf paths, with deep or wide subtrees folded behind a
//! marker that tells the planner how to inspect them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Depth at which output subtrees fold by default
pub const FOLD_DEPTH: usize = 3;
/// Field count at which a single object folds
pub const FOLD_BREADTH: usize = 12;

/// One input parameter of a tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter name
    pub name: String,
    /// Type name (string, number, boolean, object, array)
    #[serde(rename = "type")]
    pub param_type: String,
    /// Whether the parameter is required
    pub required: bool,
    /// Default value for optional parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Human description
    #[serde(default)]
    pub description: String,
}

impl ParamSpec {
    /// Required parameter
    pub fn required(name: &str, param_type: &str) -> Self {
        ParamSpec {
            name: name.to_string(),
            param_type: param_type.to_string(),
            required: true,
            default: None,
            description: String::new(),
        }
    }

    /// Optional parameter
    pub fn optional(name: &str, param_type: &str) -> Self {
        ParamSpec {
            name: name.to_string(),
            param_type: param_type.to_string(),
            required: false,
            default: None,
            description: String::new(),
        }
    }
}

/// Registered source-of-truth entry for one provider action.
///
/// `output_schema` is a nested JSON value whose leaves are type-name strings,
/// e.g. `{"messages": [{"messageId": "string"}], "count": "number"}`.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    /// Provider owning the action
    pub provider: String,
    /// Action name, unique within the provider
    pub name: String,
    /// Underlying MCP tool name (e.g. `GMAIL_FETCH_EMAILS`)
    pub mcp_name: String,
    /// Human description
    pub description: String,
    /// Declared input parameters
    pub input_params: Vec<ParamSpec>,
    /// Nested output schema
    pub output_schema: Value,
}

impl ToolSpec {
    /// Globally unique id `provider.tool`
    pub fn tool_id(&self) -> String {
        format!("{}.{}", self.provider, self.name)
    }

    /// Call form showing only required arguments, type-stripped
    pub fn signature(&self) -> String {
        let args: Vec<&str> = self
            .input_params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        format!("{}({})", self.name, args.join(", "))
    }

    /// Build a compact descriptor with a relevance score
    pub fn descriptor(&self, score: f64) -> ToolDescriptor {
        let (output_fields, has_hidden_fields) =
            flatten_output_schema(&self.tool_id(), &self.output_schema, FOLD_DEPTH, FOLD_BREADTH);
        ToolDescriptor {
            tool_id: self.tool_id(),
            server: self.provider.clone(),
            tool: self.name.clone(),
            signature: self.signature(),
            description: self.description.clone(),
            input_params: self.input_params.clone(),
            output_fields,
            has_hidden_fields,
            score,
        }
    }

    /// Depth- and breadth-limited traversal of the output schema from `field_path`.
    pub fn inspect_output(&self, field_path: &str, max_depth: usize, max_fields: usize) -> Value {
        let subtree = match resolve_field_path(&self.output_schema, field_path) {
            Some(value) => value,
            None => {
                return json!({
                    "tool_id": self.tool_id(),
                    "field_path": field_path,
                    "error": format!("No output field at path '{}'", field_path),
                })
            }
        };
        let mut budget = max_fields;
        let rendered = render_limited(subtree, max_depth, &mut budget);
        json!({
            "tool_id": self.tool_id(),
            "field_path": if field_path.is_empty() { "(root)" } else { field_path },
            "schema": rendered,
        })
    }
}

/// Compact projection of a ToolSpec merged into planner state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Globally unique `provider.tool`
    pub tool_id: String,
    /// Provider/server name
    pub server: String,
    /// Action name (also the sandbox stub function name)
    pub tool: String,
    /// Call form with required args only
    pub signature: String,
    /// Human description
    pub description: String,
    /// Declared input parameters
    pub input_params: Vec<ParamSpec>,
    /// Flattened output leaf paths, possibly folded
    pub output_fields: Vec<String>,
    /// Whether any subtree was folded
    pub has_hidden_fields: bool,
    /// Highest seen relevance score
    pub score: f64,
}

impl ToolDescriptor {
    /// Render as a JSON value for planner state
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Flatten a nested output schema into leaf paths like
/// `messages[].messageId: string`, folding subtrees past the depth or breadth
/// limit into a marker naming the exact inspect call.
pub fn flatten_output_schema(
    tool_id: &str,
    schema: &Value,
    max_depth: usize,
    max_breadth: usize,
) -> (Vec<String>, bool) {
    let mut fields = Vec::new();
    let mut folded = false;
    walk_schema(
        tool_id,
        schema,
        String::new(),
        0,
        max_depth,
        max_breadth,
        &mut fields,
        &mut folded,
    );
    (fields, folded)
}

#[allow(clippy::too_many_arguments)]
fn walk_schema(
    tool_id: &str,
    value: &Value,
    path: String,
    depth: usize,
    max_depth: usize,
    max_breadth: usize,
    fields: &mut Vec<String>,
    folded: &mut bool,
) {
    match value {
        Value::Object(map) => {
            if depth >= max_depth || map.len() > max_breadth {
                *folded = true;
                fields.push(fold_marker(tool_id, &path, map.len()));
                return;
            }
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                walk_schema(
                    tool_id, child, child_path, depth + 1, max_depth, max_breadth, fields, folded,
                );
            }
        }
        Value::Array(items) => {
            let array_path = format!("{}[]", path);
            match items.first() {
                Some(element) => walk_schema(
                    tool_id, element, array_path, depth, max_depth, max_breadth, fields, folded,
                ),
                None => fields.push(format!("{}: array", array_path)),
            }
        }
        Value::String(type_name) => {
            fields.push(format!("{}: {}", path, type_name));
        }
        other => {
            fields.push(format!("{}: {}", path, type_of(other)));
        }
    }
}

fn fold_marker(tool_id: &str, path: &str, count: usize) -> String {
    format!(
        "{}: object (contains {} sub-fields; inspect_tool_output(\"{}\", field_path=\"{}\"))",
        path, count, tool_id, path
    )
}

/// Extract the fold path from a marker string, if the field is a marker.
pub fn fold_marker_path(field: &str) -> Option<&str> {
    let start = field.find("field_path=\"")? + "field_path=\"".len();
    let rest = &field[start..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Resolve a dotted path with `[]` array markers against a schema value.
fn resolve_field_path<'a>(schema: &'a Value, field_path: &str) -> Option<&'a Value> {
    if field_path.is_empty() {
        return Some(schema);
    }
    let mut current = schema;
    for raw_segment in field_path.split('.') {
        let (key, is_array) = match raw_segment.strip_suffix("[]") {
            Some(stripped) => (stripped, true),
            None => (raw_segment, false),
        };
        if !key.is_empty() {
            current = current.as_object()?.get(key)?;
        }
        if is_array {
            current = current.as_array()?.first()?;
        }
    }
    Some(current)
}

/// Render a schema subtree, stopping at depth/field budgets.
fn render_limited(value: &Value, max_depth: usize, budget: &mut usize) -> Value {
    if *budget == 0 {
        return json!("… (field budget reached)");
    }
    match value {
        Value::Object(map) => {
            if max_depth == 0 {
                return json!(format!("object ({} fields)", map.len()));
            }
            let mut out = Map::new();
            for (key, child) in map {
                if *budget == 0 {
                    out.insert("…".to_string(), json!("(field budget reached)"));
                    break;
                }
                *budget -= 1;
                out.insert(key.clone(), render_limited(child, max_depth - 1, budget));
            }
            Value::Object(out)
        }
        Value::Array(items) => match items.first() {
            Some(element) => json!([render_limited(element, max_depth, budget)]),
            None => json!([]),
        },
        leaf => leaf.clone(),
    }
}
