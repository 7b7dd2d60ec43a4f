//! Parses a resolved tool-call fence's inner text into [`ToolCall`]s.
//!
//! Fence content looks like `name(arg=value, ...)`, one statement per line —
//! multiple lines are multiple parallel tool calls in the same fence.
//! Argument parsing also accepts the Python literals (`True`/`False`/`None`)
//! that chat templates commonly emit into prompts.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value as Json;

use crate::error::ConversationError;
use crate::types::{FunctionCall, ToolCall, ToolDeclaration};

fn call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z_]\w*)\s*\((.*)\)$").expect("valid call regex"))
}

fn arg_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(\w+)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^,\s]+))"#).expect("valid arg regex")
    })
}

/// Strips the fence start/end markers off a raw [`super::fence::FenceEvent::ToolBlock`].
pub fn strip_fence_markers(block: &str, start: &str, end: &str) -> String {
    let without_start = block.strip_prefix(start).unwrap_or(block);
    without_start.strip_suffix(end).unwrap_or(without_start).to_string()
}

/// Parses one or more `name(args)` statements, one per non-blank line.
pub fn parse_tool_calls(
    inner: &str,
    declared: &[ToolDeclaration],
) -> Result<Vec<ToolCall>, ConversationError> {
    let mut calls = Vec::new();
    for line in inner.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let caps = call_regex()
            .captures(line)
            .ok_or_else(|| ConversationError::ToolCallParseFailed(format!("{line:?} is not a call statement")))?;
        let name = caps[1].to_string();
        if !declared.is_empty() && !declared.iter().any(|t| t.name == name) {
            return Err(ConversationError::ToolCallParseFailed(format!(
                "model called undeclared tool {name:?}"
            )));
        }
        let arguments = parse_function_args(&caps[2]);
        calls.push(ToolCall {
            kind: "function".to_string(),
            function: FunctionCall { name, arguments },
        });
    }
    if calls.is_empty() {
        return Err(ConversationError::ToolCallParseFailed(
            "tool-call fence contained no parseable statements".to_string(),
        ));
    }
    Ok(calls)
}

fn parse_function_args(args_str: &str) -> Json {
    let mut map = serde_json::Map::new();
    if args_str.trim().is_empty() {
        return Json::Object(map);
    }
    for cap in arg_regex().captures_iter(args_str) {
        let key = cap[1].to_string();
        let raw = cap
            .get(2)
            .or_else(|| cap.get(3))
            .or_else(|| cap.get(4))
            .map(|m| m.as_str())
            .unwrap_or("");
        map.insert(key, parse_python_like_value(raw));
    }
    Json::Object(map)
}

fn parse_python_like_value(raw: &str) -> Json {
    match raw {
        "True" => Json::Bool(true),
        "False" => Json::Bool(false),
        "None" => Json::Null,
        _ => {
            if let Ok(n) = raw.parse::<i64>() {
                Json::Number(n.into())
            } else if let Ok(f) = raw.parse::<f64>() {
                serde_json::Number::from_f64(f)
                    .map(Json::Number)
                    .unwrap_or_else(|| Json::String(raw.to_string()))
            } else {
                Json::String(raw.to_string())
            }
        }
    }
}
