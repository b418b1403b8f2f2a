use serde::{Deserialize, Deserializer};
use serde_json::Value;
use snafu::ResultExt;

use crate::error::{ChatError, ChatResult, DecodeEventSnafu};

pub const TURN_START_EVENT: &str = "on_chat_model_start";
pub const TOKEN_EVENT: &str = "on_chat_model_stream";
pub const TURN_END_EVENT: &str = "on_chat_model_end";

/// One piece of model output.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(default)]
        name: Option<String>,
        #[serde(default, deserialize_with = "deserialize_tool_input")]
        input: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_use(name: Option<&str>, input: Option<&str>) -> Self {
        Self::ToolUse {
            name: name.map(str::to_string),
            input: input.map(str::to_string),
        }
    }

    fn decode(value: &Value) -> Self {
        Self::deserialize(value).unwrap_or(Self::Unknown)
    }
}

/// Streamed agent event, decoded once at the stream boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// A model call begins; the next content opens a fresh item.
    TurnStart,
    /// Partial output fragments.
    Token { parts: Vec<ContentPart> },
    /// Authoritative output of the model call.
    TurnEnd { output: Vec<ContentPart> },
    /// Anything else the agent emits (chain and tool lifecycle events).
    Other { name: String },
}

impl AgentEvent {
    pub fn token(parts: Vec<ContentPart>) -> Self {
        Self::Token { parts }
    }

    pub fn turn_end(output: Vec<ContentPart>) -> Self {
        Self::TurnEnd { output }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::TurnStart => TURN_START_EVENT,
            Self::Token { .. } => TOKEN_EVENT,
            Self::TurnEnd { .. } => TURN_END_EVENT,
            Self::Other { name } => name,
        }
    }

    /// Decodes an `astream_events` (v2) style JSON event.
    ///
    /// Content given as a plain string carries no typed parts and decodes to an
    /// empty list, as do parts whose `type` is not recognised.
    pub fn from_json(value: &Value) -> ChatResult<Self> {
        let name = value
            .get("event")
            .and_then(Value::as_str)
            .ok_or(ChatError::MalformedEvent {
                stage: "decode-event-name",
                field: "event",
            })?;

        let event = match name {
            TURN_START_EVENT => Self::TurnStart,
            TOKEN_EVENT => Self::Token {
                parts: decode_content(value, "/data/chunk", "data.chunk")?,
            },
            TURN_END_EVENT => Self::TurnEnd {
                output: decode_content(value, "/data/output", "data.output")?,
            },
            other => Self::Other {
                name: other.to_string(),
            },
        };
        Ok(event)
    }

    pub fn from_json_str(raw: &str) -> ChatResult<Self> {
        let value = serde_json::from_str::<Value>(raw).context(DecodeEventSnafu {
            stage: "parse-event-json",
        })?;
        Self::from_json(&value)
    }
}

fn decode_content(
    event: &Value,
    pointer: &str,
    field: &'static str,
) -> ChatResult<Vec<ContentPart>> {
    let message = event.pointer(pointer).ok_or(ChatError::MalformedEvent {
        stage: "decode-event-content",
        field,
    })?;

    let parts = match message.get("content") {
        Some(Value::Array(parts)) => parts.iter().map(ContentPart::decode).collect(),
        _ => Vec::new(),
    };
    Ok(parts)
}

fn deserialize_tool_input<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(other) => {
            Some(serde_json::to_string_pretty(&other).map_err(serde::de::Error::custom)?)
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_stream_chunk_parts() {
        let event = AgentEvent::from_json(&json!({
            "event": "on_chat_model_stream",
            "data": {"chunk": {"content": [
                {"type": "text", "text": "Hi", "index": 0},
                {"type": "tool_use", "name": "search", "input": "{\"q\"", "index": 1},
                {"type": "thinking", "thinking": "hmm"},
                {"no_type": true}
            ]}}
        }))
        .expect("event decodes");

        assert_eq!(
            event,
            AgentEvent::token(vec![
                ContentPart::text("Hi"),
                ContentPart::tool_use(Some("search"), Some("{\"q\"")),
                ContentPart::Unknown,
                ContentPart::Unknown,
            ])
        );
    }

    #[test]
    fn structured_tool_input_is_pretty_printed() {
        let event = AgentEvent::from_json(&json!({
            "event": "on_chat_model_end",
            "data": {"output": {"content": [
                {"type": "tool_use", "name": "search", "input": {"q": "rust"}}
            ]}}
        }))
        .expect("event decodes");

        assert_eq!(
            event,
            AgentEvent::turn_end(vec![ContentPart::tool_use(
                Some("search"),
                Some("{\n  \"q\": \"rust\"\n}")
            )])
        );
    }

    #[test]
    fn plain_string_content_has_no_parts() {
        let event = AgentEvent::from_json_str(
            r#"{"event": "on_chat_model_end", "data": {"output": {"content": "hello"}}}"#,
        )
        .expect("event decodes");
        assert_eq!(event, AgentEvent::turn_end(Vec::new()));
    }

    #[test]
    fn start_and_unrelated_events() {
        let start = AgentEvent::from_json(&json!({"event": "on_chat_model_start", "data": {}}))
            .expect("event decodes");
        assert_eq!(start, AgentEvent::TurnStart);

        let other = AgentEvent::from_json(&json!({"event": "on_tool_start"}))
            .expect("event decodes");
        assert_eq!(other.name(), "on_tool_start");
    }

    #[test]
    fn malformed_events_are_reported() {
        let missing_name = AgentEvent::from_json(&json!({"data": {}}));
        assert!(matches!(
            missing_name,
            Err(ChatError::MalformedEvent { field: "event", .. })
        ));

        let missing_chunk = AgentEvent::from_json(&json!({"event": "on_chat_model_stream"}));
        assert!(matches!(
            missing_chunk,
            Err(ChatError::MalformedEvent { field: "data.chunk", .. })
        ));

        assert!(matches!(
            AgentEvent::from_json_str("{not json"),
            Err(ChatError::DecodeEvent { .. })
        ));
    }
}
