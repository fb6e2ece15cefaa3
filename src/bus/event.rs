//! Decoded channel event.

use serde_json::Value;

/// One inbound channel message after decoding.
///
/// `payload` is whatever the remote side sent: usually a JSON object with an
/// `eventType` discriminant, sometimes a bare string (process output lines).
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    event_type: Option<String>,
    payload: Value,
}

impl Event {
    pub fn new(payload: Value) -> Self {
        let event_type = payload
            .get("eventType")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self { event_type, payload }
    }

    /// Build an event from an Everrest message body.
    ///
    /// The body is normally a string holding JSON; anything that does not
    /// parse is kept verbatim as a string payload.
    pub fn from_body(body: Option<Value>) -> Self {
        match body {
            Some(Value::String(text)) => match serde_json::from_str::<Value>(&text) {
                Ok(parsed) => Self::new(parsed),
                Err(_) => Self::new(Value::String(text)),
            },
            Some(other) => Self::new(other),
            None => Self::new(Value::Null),
        }
    }

    pub fn event_type(&self) -> Option<&str> {
        self.event_type.as_deref()
    }

    /// `true` if the `eventType` discriminant equals `kind`.
    pub fn is(&self, kind: &str) -> bool {
        self.event_type() == Some(kind)
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Diagnostic rendering used for rejection messages.
    ///
    /// Structured payloads render as compact JSON, bare strings as themselves.
    pub fn render(&self) -> String {
        match &self.payload {
            Value::String(text) => text.clone(),
            other => serde_json::to_string(other).unwrap_or_else(|_| format!("{other:?}")),
        }
    }
}

impl From<Value> for Event {
    fn from(payload: Value) -> Self {
        Self::new(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_is_extracted() {
        let e = Event::new(json!({"eventType": "RUNNING", "workspaceId": "w1"}));
        assert_eq!(e.event_type(), Some("RUNNING"));
        assert!(e.is("RUNNING"));
        assert!(!e.is("ERROR"));
        assert_eq!(e.payload()["workspaceId"], "w1");
    }

    #[test]
    fn string_body_holding_json_is_parsed() {
        let e = Event::from_body(Some(json!(r#"{"eventType":"STOPPED"}"#)));
        assert!(e.is("STOPPED"));
    }

    #[test]
    fn unparsable_body_kept_as_string() {
        let e = Event::from_body(Some(json!("[STDOUT] building...")));
        assert_eq!(e.event_type(), None);
        assert_eq!(e.render(), "[STDOUT] building...");
    }

    #[test]
    fn object_body_used_directly() {
        let e = Event::from_body(Some(json!({"eventType": "ERROR", "error": "no space"})));
        assert!(e.is("ERROR"));
        assert!(e.render().contains("no space"));
    }

    #[test]
    fn missing_body_is_null() {
        let e = Event::from_body(None);
        assert_eq!(e.payload(), &Value::Null);
        assert_eq!(e.render(), "null");
    }

    #[test]
    fn non_string_event_type_ignored() {
        let e = Event::new(json!({"eventType": 3}));
        assert_eq!(e.event_type(), None);
    }
}
