//! Python-literal re-serialization of tool call/response JSON values: chat
//! templates written against Python-style model output expect
//! `True`/`False`/`None` and single-quoted strings rather than JSON's
//! `true`/`false`/`null`/double quotes.

use serde_json::Value as Json;

use crate::types::{Content, ContentPart};

pub fn format_value_as_python(value: &Json) -> String {
    match value {
        Json::Null => "None".to_string(),
        Json::Bool(true) => "True".to_string(),
        Json::Bool(false) => "False".to_string(),
        Json::Number(n) => n.to_string(),
        Json::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        Json::Array(items) => {
            let parts: Vec<String> = items.iter().map(format_value_as_python).collect();
            format!("[{}]", parts.join(", "))
        }
        Json::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("'{k}': {}", format_value_as_python(v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
    }
}

/// Unwraps a `tool_response`/`response` wrapper key before formatting, if
/// present; otherwise formats the whole value.
pub fn format_tool_response(tool_response: &Json) -> String {
    if let Json::Object(map) = tool_response {
        if let Some(inner) = map.get("tool_response").or_else(|| map.get("response")) {
            return format_value_as_python(inner);
        }
    }
    format_value_as_python(tool_response)
}

/// Rewrites a tool message's content so each `ToolResponse` part becomes
/// plain text holding its Python-literal rendering; other roles' content
/// passes through unchanged.
pub fn format_tool_message_content(content: &Content) -> Content {
    match content {
        Content::Parts(parts) => Content::Parts(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::ToolResponse { tool_response } => ContentPart::Text {
                        text: format_tool_response(tool_response),
                    },
                    other => other.clone(),
                })
                .collect(),
        ),
        Content::Text(s) => Content::Text(s.clone()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn formats_primitives_the_python_way() {
        assert_eq!(format_value_as_python(&Json::Null), "None");
        assert_eq!(format_value_as_python(&json!(true)), "True");
        assert_eq!(format_value_as_python(&json!(false)), "False");
        assert_eq!(format_value_as_python(&json!(42)), "42");
        assert_eq!(format_value_as_python(&json!("it's")), "'it\\'s'");
    }

    #[test]
    fn formats_nested_containers() {
        let value = json!({"a": 1, "b": [true, null]});
        assert_eq!(format_value_as_python(&value), "{'a': 1, 'b': [True, None]}");
    }

    #[test]
    fn unwraps_tool_response_wrapper_key() {
        let wrapped = json!({"tool_response": {"temp": 72}});
        assert_eq!(format_tool_response(&wrapped), "{'temp': 72}");

        let unwrapped = json!({"temp": 72});
        assert_eq!(format_tool_response(&unwrapped), "{'temp': 72}");
    }
}
