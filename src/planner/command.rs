//! Planner command parsing and validation.
//!
//! The planner LLM answers with one JSON object per iteration. Parsing turns
//! it into a tagged `PlannerCommand`, enforcing per-variant shape rules
//! before anything reaches the executor.

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Inspect depth clamp bounds
const INSPECT_DEPTH_RANGE: (u32, u32) = (1, 8);
/// Inspect field-count clamp bounds
const INSPECT_FIELDS_RANGE: (u32, u32) = (20, 300);

/// A validated planner command.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerCommand {
    /// Search the tool catalog
    Search {
        reasoning: String,
        query: String,
        provider: Option<String>,
        limit: Option<usize>,
    },
    /// Invoke one discovered tool
    Tool {
        reasoning: String,
        tool_id: String,
        server: String,
        args: Map<String, Value>,
    },
    /// Execute a sandbox plan body
    Sandbox {
        reasoning: String,
        code: String,
        label: String,
    },
    /// Expand a folded output subtree
    InspectToolOutput {
        reasoning: String,
        tool_id: String,
        field_path: String,
        max_depth: u32,
        max_fields: u32,
    },
    /// Terminal success
    Finish {
        reasoning: String,
        summary: String,
        data: Option<Map<String, Value>>,
    },
    /// Terminal failure
    Fail { reasoning: String, reason: String },
}

impl PlannerCommand {
    /// Step-type label used in history and trajectories
    pub fn kind(&self) -> &'static str {
        match self {
            PlannerCommand::Search { .. } => "search",
            PlannerCommand::Tool { .. } => "tool",
            PlannerCommand::Sandbox { .. } => "sandbox",
            PlannerCommand::InspectToolOutput { .. } => "inspect_tool_output",
            PlannerCommand::Finish { .. } => "finish",
            PlannerCommand::Fail { .. } => "fail",
        }
    }

    /// The reasoning the LLM attached to this command
    pub fn reasoning(&self) -> &str {
        match self {
            PlannerCommand::Search { reasoning, .. }
            | PlannerCommand::Tool { reasoning, .. }
            | PlannerCommand::Sandbox { reasoning, .. }
            | PlannerCommand::InspectToolOutput { reasoning, .. }
            | PlannerCommand::Finish { reasoning, .. }
            | PlannerCommand::Fail { reasoning, .. } => reasoning,
        }
    }

    /// Render back to the JSON shape recorded in history
    pub fn to_value(&self) -> Value {
        match self {
            PlannerCommand::Search {
                reasoning,
                query,
                provider,
                limit,
            } => {
                let mut map = Map::new();
                map.insert("type".into(), "search".into());
                map.insert("reasoning".into(), reasoning.clone().into());
                map.insert("query".into(), query.clone().into());
                if let Some(provider) = provider {
                    map.insert("provider".into(), provider.clone().into());
                }
                if let Some(limit) = limit {
                    map.insert("limit".into(), (*limit as u64).into());
                }
                Value::Object(map)
            }
            PlannerCommand::Tool {
                reasoning,
                tool_id,
                server,
                args,
            } => {
                let mut map = Map::new();
                map.insert("type".into(), "tool".into());
                map.insert("reasoning".into(), reasoning.clone().into());
                map.insert("tool_id".into(), tool_id.clone().into());
                map.insert("server".into(), server.clone().into());
                map.insert("args".into(), Value::Object(args.clone()));
                Value::Object(map)
            }
            PlannerCommand::Sandbox {
                reasoning,
                code,
                label,
            } => {
                let mut map = Map::new();
                map.insert("type".into(), "sandbox".into());
                map.insert("reasoning".into(), reasoning.clone().into());
                map.insert("code".into(), code.clone().into());
                map.insert("label".into(), label.clone().into());
                Value::Object(map)
            }
            PlannerCommand::InspectToolOutput {
                reasoning,
                tool_id,
                field_path,
                max_depth,
                max_fields,
            } => {
                let mut map = Map::new();
                map.insert("type".into(), "inspect_tool_output".into());
                map.insert("reasoning".into(), reasoning.clone().into());
                map.insert("tool_id".into(), tool_id.clone().into());
                map.insert("field_path".into(), field_path.clone().into());
                map.insert("max_depth".into(), (*max_depth as u64).into());
                map.insert("max_fields".into(), (*max_fields as u64).into());
                Value::Object(map)
            }
            PlannerCommand::Finish {
                reasoning,
                summary,
                data,
            } => {
                let mut map = Map::new();
                map.insert("type".into(), "finish".into());
                map.insert("reasoning".into(), reasoning.clone().into());
                map.insert("summary".into(), summary.clone().into());
                if let Some(data) = data {
                    map.insert("data".into(), Value::Object(data.clone()));
                }
                Value::Object(map)
            }
            PlannerCommand::Fail { reasoning, reason } => {
                let mut map = Map::new();
                map.insert("type".into(), "fail".into());
                map.insert("reasoning".into(), reasoning.clone().into());
                map.insert("reason".into(), reason.clone().into());
                Value::Object(map)
            }
        }
    }
}

/// Parse planner LLM output into a validated command.
pub fn parse_planner_command(text: &str) -> Result<PlannerCommand> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::InvalidInput("Planner response was empty.".into()));
    }
    let value: Value = serde_json::from_str(text)
        .map_err(|_| Error::InvalidInput("Planner response must be valid JSON.".into()))?;
    let object = value
        .as_object()
        .ok_or_else(|| Error::InvalidInput("Planner response must be a JSON object.".into()))?;

    let reasoning = object
        .get("reasoning")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::InvalidInput("Planner command must include non-empty 'reasoning' string.".into())
        })?
        .to_string();

    let cmd_type = object.get("type").and_then(Value::as_str).ok_or_else(|| {
        Error::InvalidInput("Planner response missing 'type' or unsupported command.".into())
    })?;

    match cmd_type {
        "search" => parse_search(object, reasoning),
        "tool" => parse_tool(object, reasoning),
        "sandbox" => parse_sandbox(object, reasoning),
        "inspect_tool_output" => parse_inspect(object, reasoning),
        "finish" => parse_finish(object, reasoning),
        "fail" => parse_fail(object, reasoning),
        _ => Err(Error::InvalidInput(
            "Planner response missing 'type' or unsupported command.".into(),
        )),
    }
}

fn parse_search(object: &Map<String, Value>, reasoning: String) -> Result<PlannerCommand> {
    let query = object
        .get("query")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidInput("Search command requires non-empty 'query'.".into()))?
        .to_string();

    let provider = object
        .get("provider")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let limit = match object.get("limit") {
        None | Some(Value::Null) => None,
        Some(value) => {
            let limit = value.as_u64().filter(|l| (1..=50u64).contains(l)).ok_or_else(|| {
                Error::InvalidInput(
                    "Search command 'limit' must be an integer between 1 and 50.".into(),
                )
            })?;
            Some(limit as usize)
        }
    };

    Ok(PlannerCommand::Search {
        reasoning,
        query,
        provider,
        limit,
    })
}

fn parse_tool(object: &Map<String, Value>, reasoning: String) -> Result<PlannerCommand> {
    let tool_id = object
        .get("tool_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidInput("Tool command requires non-empty 'tool_id'.".into()))?
        .to_string();
    let server = object
        .get("server")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidInput("Tool command requires non-empty 'server'.".into()))?
        .to_string();
    let args = match object.get("args") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return Err(Error::InvalidInput(
                "Tool command 'args' must be an object.".into(),
            ))
        }
    };
    Ok(PlannerCommand::Tool {
        reasoning,
        tool_id,
        server,
        args,
    })
}

fn parse_sandbox(object: &Map<String, Value>, reasoning: String) -> Result<PlannerCommand> {
    let code = object
        .get("code")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::InvalidInput("Sandbox command requires non-empty 'code'.".into()))?
        .to_string();
    let label = object
        .get("label")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("sandbox")
        .to_string();
    Ok(PlannerCommand::Sandbox {
        reasoning,
        code,
        label,
    })
}

fn parse_inspect(object: &Map<String, Value>, reasoning: String) -> Result<PlannerCommand> {
    let tool_id = object
        .get("tool_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::InvalidInput("inspect_tool_output command requires non-empty 'tool_id'.".into())
        })?
        .to_string();
    let field_path = object
        .get("field_path")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();

    let max_depth = clamp_int(object.get("max_depth"), 4, INSPECT_DEPTH_RANGE)
        .map_err(|_| {
            Error::InvalidInput("inspect_tool_output command 'max_depth' must be an integer.".into())
        })?;
    let max_fields = clamp_int(object.get("max_fields"), 120, INSPECT_FIELDS_RANGE)
        .map_err(|_| {
            Error::InvalidInput(
                "inspect_tool_output command 'max_fields' must be an integer.".into(),
            )
        })?;

    Ok(PlannerCommand::InspectToolOutput {
        reasoning,
        tool_id,
        field_path,
        max_depth,
        max_fields,
    })
}

fn clamp_int(
    value: Option<&Value>,
    default: u32,
    (min, max): (u32, u32),
) -> std::result::Result<u32, ()> {
    let raw = match value {
        None | Some(Value::Null) => default as i64,
        Some(value) => value.as_i64().ok_or(())?,
    };
    Ok((raw.clamp(min as i64, max as i64)) as u32)
}

fn parse_finish(object: &Map<String, Value>, reasoning: String) -> Result<PlannerCommand> {
    let summary = match object.get("summary") {
        None | Some(Value::Null) => "Task completed.".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(_) => {
            return Err(Error::InvalidInput(
                "Finish command 'summary' must be a string.".into(),
            ))
        }
    };
    let data = match object.get("data") {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map.clone()),
        Some(_) => {
            return Err(Error::InvalidInput(
                "Finish command 'data' must be an object.".into(),
            ))
        }
    };
    Ok(PlannerCommand::Finish {
        reasoning,
        summary,
        data,
    })
}

fn parse_fail(object: &Map<String, Value>, reasoning: String) -> Result<PlannerCommand> {
    let reason = object
        .get("reason")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidInput("Fail command requires non-empty 'reason'.".into()))?
        .to_string();
    Ok(PlannerCommand::Fail { reasoning, reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_search() {
        let text = json!({
            "type": "search",
            "reasoning": "need gmail tools",
            "query": "gmail recent emails",
            "limit": 5,
        })
        .to_string();
        let command = parse_planner_command(&text).unwrap();
        match command {
            PlannerCommand::Search { query, limit, .. } => {
                assert_eq!(query, "gmail recent emails");
                assert_eq!(limit, Some(5));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_search_rejects_bad_limit() {
        let text = json!({
            "type": "search",
            "reasoning": "r",
            "query": "q",
            "limit": 0,
        })
        .to_string();
        assert!(parse_planner_command(&text).is_err());

        let text = json!({
            "type": "search",
            "reasoning": "r",
            "query": "q",
            "limit": 51,
        })
        .to_string();
        assert!(parse_planner_command(&text).is_err());
    }

    #[test]
    fn test_parse_tool_defaults_empty_args() {
        let text = json!({
            "type": "tool",
            "reasoning": "call it",
            "tool_id": "gmail.gmail_search",
            "server": "gmail",
        })
        .to_string();
        let command = parse_planner_command(&text).unwrap();
        match command {
            PlannerCommand::Tool { tool_id, args, .. } => {
                assert_eq!(tool_id, "gmail.gmail_search");
                assert!(args.is_empty());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_requires_reasoning() {
        let text = json!({"type": "finish", "summary": "done"}).to_string();
        assert!(parse_planner_command(&text).is_err());

        let text = json!({"type": "finish", "reasoning": "  ", "summary": "done"}).to_string();
        assert!(parse_planner_command(&text).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let text = json!({"type": "dance", "reasoning": "r"}).to_string();
        assert!(parse_planner_command(&text).is_err());
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(parse_planner_command("not json at all").is_err());
        assert!(parse_planner_command("").is_err());
    }

    #[test]
    fn test_parse_inspect_clamps_limits() {
        let text = json!({
            "type": "inspect_tool_output",
            "reasoning": "look deeper",
            "tool_id": "shopify.get_product",
            "field_path": "variants[]",
            "max_depth": 99,
            "max_fields": 1,
        })
        .to_string();
        let command = parse_planner_command(&text).unwrap();
        match command {
            PlannerCommand::InspectToolOutput {
                max_depth,
                max_fields,
                field_path,
                ..
            } => {
                assert_eq!(max_depth, 8);
                assert_eq!(max_fields, 20);
                assert_eq!(field_path, "variants[]");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_fail_requires_reason() {
        let text = json!({"type": "fail", "reasoning": "r"}).to_string();
        assert!(parse_planner_command(&text).is_err());

        let text = json!({"type": "fail", "reasoning": "r", "reason": "no capability"}).to_string();
        let command = parse_planner_command(&text).unwrap();
        assert_eq!(command.kind(), "fail");
    }

    #[test]
    fn test_command_round_trip_to_value() {
        let text = json!({
            "type": "sandbox",
            "reasoning": "compute",
            "code": "return {}",
            "label": "calc",
        })
        .to_string();
        let command = parse_planner_command(&text).unwrap();
        let value = command.to_value();
        assert_eq!(value["type"], "sandbox");
        assert_eq!(value["label"], "calc");
    }
}
