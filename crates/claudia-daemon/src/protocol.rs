//! Tool protocol types.
//!
//! One JSON object per line in each direction. A request is
//! `{ id, tool, args }`; the response echoes the id with either
//! `{ ok: true, result }` or `{ ok: false, error: { kind, message } }`.
//! Handlers never panic the process; trapped failures come back as
//! internal storage errors.

use claudia_core::MemoryError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One tool invocation
#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    /// Caller-chosen correlation id, echoed verbatim
    pub id: Value,
    /// Tool name
    pub tool: String,
    /// Tool arguments; defaults to an empty object
    #[serde(default = "empty_args")]
    pub args: Value,
}

fn empty_args() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Machine-readable error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// Response to one tool invocation
#[derive(Debug, Clone, Serialize)]
pub struct ToolResponse {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ToolResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, kind: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(ErrorBody {
                kind: kind.to_string(),
                message: message.into(),
            }),
        }
    }

    pub fn from_error(id: Value, error: &MemoryError) -> Self {
        Self::failure(id, error.kind(), error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_args_to_object() {
        let request: ToolRequest =
            serde_json::from_str(r#"{"id": 1, "tool": "system_health"}"#).unwrap();
        assert_eq!(request.tool, "system_health");
        assert!(request.args.is_object());
    }

    #[test]
    fn success_omits_error_field() {
        let response = ToolResponse::success(Value::from(7), serde_json::json!({"x": 1}));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["id"], 7);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn failure_carries_kind_and_message() {
        let response = ToolResponse::from_error(
            Value::from("abc"),
            &MemoryError::NotFound("memory 9".into()),
        );
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["kind"], "NotFound");
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("memory 9"));
    }
}
