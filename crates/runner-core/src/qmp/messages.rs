use serde::Serialize;
use serde_json::Value;

/// One line written to the QMP socket: `{"execute": ..., "arguments": ...}`.
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    pub execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl Command {
    pub fn new(execute: impl Into<String>) -> Self {
        Self {
            execute: execute.into(),
            arguments: None,
        }
    }

    pub fn with_arguments(execute: impl Into<String>, arguments: Value) -> Self {
        Self {
            execute: execute.into(),
            arguments: Some(arguments),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QmpErrorBody {
    pub class: String,
    pub desc: String,
}

#[derive(Debug, Clone)]
pub struct AsyncEvent {
    pub event: String,
    pub data: Value,
}

/// One decoded line read from the QMP socket. Classified by inspecting the
/// parsed JSON object's keys rather than relying on serde's `untagged`
/// matching, which is ambiguous here because a bare `{}` would structurally
/// satisfy more than one shape: three message shapes appear on
/// the wire — greeting, response, event.
#[derive(Debug, Clone)]
pub enum Line {
    Greeting,
    Response {
        result: Option<Value>,
        error: Option<QmpErrorBody>,
    },
    Event(AsyncEvent),
}

pub fn classify(value: &Value) -> Option<Line> {
    let obj = value.as_object()?;

    if obj.contains_key("QMP") {
        return Some(Line::Greeting);
    }
    if let Some(event) = obj.get("event").and_then(Value::as_str) {
        return Some(Line::Event(AsyncEvent {
            event: event.to_string(),
            data: obj.get("data").cloned().unwrap_or(Value::Null),
        }));
    }
    if obj.contains_key("return") || obj.contains_key("error") {
        let error = obj.get("error").and_then(|e| {
            Some(QmpErrorBody {
                class: e.get("class")?.as_str()?.to_string(),
                desc: e.get("desc")?.as_str()?.to_string(),
            })
        });
        return Some(Line::Response {
            result: obj.get("return").cloned(),
            error,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_greeting() {
        let value = json!({ "QMP": { "version": {}, "capabilities": [] } });
        assert!(matches!(classify(&value), Some(Line::Greeting)));
    }

    #[test]
    fn classifies_successful_response() {
        let value = json!({ "return": { "foo": "bar" } });
        match classify(&value) {
            Some(Line::Response { result, error }) => {
                assert_eq!(result, Some(json!({ "foo": "bar" })));
                assert!(error.is_none());
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn classifies_error_response() {
        let value = json!({ "error": { "class": "CommandNotFound", "desc": "no such command" } });
        match classify(&value) {
            Some(Line::Response { result, error }) => {
                assert!(result.is_none());
                let error = error.unwrap();
                assert_eq!(error.class, "CommandNotFound");
                assert_eq!(error.desc, "no such command");
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn classifies_async_event_and_is_not_confused_with_response() {
        let value = json!({ "event": "POWERDOWN", "data": {}, "timestamp": { "seconds": 1, "microseconds": 0 } });
        match classify(&value) {
            Some(Line::Event(event)) => assert_eq!(event.event, "POWERDOWN"),
            other => panic!("expected Event, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_shape_classifies_to_none() {
        let value = json!({ "unrelated": true });
        assert!(classify(&value).is_none());
    }

    #[test]
    fn command_without_arguments_omits_the_field() {
        let command = Command::new("query-status");
        let serialized = serde_json::to_value(&command).unwrap();
        assert_eq!(serialized, json!({ "execute": "query-status" }));
    }

    #[test]
    fn command_with_arguments_includes_them() {
        let command = Command::with_arguments("device_del", json!({ "id": "cpu-3" }));
        let serialized = serde_json::to_value(&command).unwrap();
        assert_eq!(
            serialized,
            json!({ "execute": "device_del", "arguments": { "id": "cpu-3" } })
        );
    }
}
