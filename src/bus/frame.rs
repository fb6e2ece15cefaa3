//! Everrest WebSocket message envelope.
//!
//! Client → server control frames:
//!
//! ```text
//! {"uuid":"…","method":"POST","path":null,
//!  "headers":[{"name":"x-everrest-websocket-message-type","value":"subscribe-channel"}],
//!  "body":"{\"channel\":\"workspace:w1\"}"}
//! ```
//!
//! Server → client channel messages carry the topic in a header and the
//! event as a JSON string body:
//!
//! ```text
//! {"responseCode":0,
//!  "headers":[{"name":"x-everrest-websocket-channel","value":"workspace:w1"}],
//!  "body":"{\"eventType\":\"RUNNING\"}"}
//! ```
//!
//! A top-level `"channel"` field is accepted in place of the header.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::bus::event::Event;

const MESSAGE_TYPE_HEADER: &str = "x-everrest-websocket-message-type";
const CHANNEL_HEADER: &str = "x-everrest-websocket-channel";

/// "Accepted, still processing" replies carry no event.
const ACCEPTED: u16 = 202;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct Outbound<'a> {
    uuid: String,
    method: &'a str,
    path: Option<&'a str>,
    headers: Vec<Header>,
    body: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Inbound {
    response_code: Option<u16>,
    headers: Vec<Header>,
    channel: Option<String>,
    body: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChannelBody {
    channel: String,
}

/// Control frame kinds a client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Subscribe(String),
    Unsubscribe(String),
    Ping,
}

// ── Client → server ───────────────────────────────────────────────────────────

pub fn subscribe(topic: &str) -> String {
    control_frame("subscribe-channel", channel_body(topic))
}

pub fn unsubscribe(topic: &str) -> String {
    control_frame("unsubscribe-channel", channel_body(topic))
}

pub fn ping() -> String {
    control_frame("ping", String::new())
}

fn channel_body(topic: &str) -> String {
    serde_json::json!({ "channel": topic }).to_string()
}

fn control_frame(kind: &str, body: String) -> String {
    let msg = Outbound {
        uuid: Uuid::new_v4().to_string(),
        method: "POST",
        path: None,
        headers: vec![Header {
            name: MESSAGE_TYPE_HEADER.to_string(),
            value: kind.to_string(),
        }],
        body,
    };
    // Plain strings and a Vec of plain structs always serialise.
    serde_json::to_string(&msg).unwrap_or_default()
}

/// Classify a client frame. `None` for anything that is not a control frame.
pub fn control(text: &str) -> Option<Control> {
    let msg: Inbound = serde_json::from_str(text).ok()?;
    let kind = header(&msg.headers, MESSAGE_TYPE_HEADER)?;
    let topic = || {
        msg.body
            .as_ref()
            .and_then(Value::as_str)
            .and_then(|b| serde_json::from_str::<ChannelBody>(b).ok())
            .map(|b| b.channel)
    };
    match kind {
        "subscribe-channel" => topic().map(Control::Subscribe),
        "unsubscribe-channel" => topic().map(Control::Unsubscribe),
        "ping" => Some(Control::Ping),
        _ => None,
    }
}

/// Topic named by a `subscribe-channel` frame, if `text` is one.
pub fn subscribed_channel(text: &str) -> Option<String> {
    match control(text)? {
        Control::Subscribe(topic) => Some(topic),
        _ => None,
    }
}

// ── Server → client ───────────────────────────────────────────────────────────

/// Encode `body` as a channel message on `topic`.
pub fn channel_message(topic: &str, body: &Value) -> String {
    serde_json::json!({
        "responseCode": 0,
        "headers": [{ "name": CHANNEL_HEADER, "value": topic }],
        "body": body.to_string(),
    })
    .to_string()
}

/// Decode an inbound frame into `(topic, event)`.
///
/// `Ok(None)` for frames that are not channel messages: request replies,
/// `202 Accepted` acknowledgements and frames with no topic.
pub fn decode(text: &str) -> Result<Option<(String, Event)>, serde_json::Error> {
    let msg: Inbound = serde_json::from_str(text)?;
    if msg.response_code == Some(ACCEPTED) {
        return Ok(None);
    }
    let topic = header(&msg.headers, CHANNEL_HEADER)
        .map(str::to_string)
        .or(msg.channel);
    Ok(topic.map(|t| (t, Event::from_body(msg.body))))
}

fn header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscribe_frame_names_channel() {
        let f = subscribe("workspace:w1");
        assert_eq!(control(&f), Some(Control::Subscribe("workspace:w1".into())));
        assert_eq!(subscribed_channel(&f).as_deref(), Some("workspace:w1"));
    }

    #[test]
    fn unsubscribe_and_ping_classified() {
        assert_eq!(
            control(&unsubscribe("process:output:abc")),
            Some(Control::Unsubscribe("process:output:abc".into()))
        );
        assert_eq!(control(&ping()), Some(Control::Ping));
        assert_eq!(subscribed_channel(&ping()), None);
    }

    #[test]
    fn control_frames_have_unique_ids() {
        let a: Value = serde_json::from_str(&ping()).unwrap();
        let b: Value = serde_json::from_str(&ping()).unwrap();
        assert_ne!(a["uuid"], b["uuid"]);
        assert_eq!(a["method"], "POST");
    }

    #[test]
    fn channel_message_decodes_to_topic_and_event() {
        let raw = channel_message("workspace:w1", &json!({"eventType": "RUNNING"}));
        let (topic, event) = decode(&raw).unwrap().unwrap();
        assert_eq!(topic, "workspace:w1");
        assert!(event.is("RUNNING"));
    }

    #[test]
    fn top_level_channel_field_accepted() {
        let raw = r#"{"channel":"machine:status:w1:default","body":{"eventType":"ERROR"}}"#;
        let (topic, event) = decode(raw).unwrap().unwrap();
        assert_eq!(topic, "machine:status:w1:default");
        assert!(event.is("ERROR"));
    }

    #[test]
    fn accepted_and_reply_frames_dropped() {
        let accepted = r#"{"responseCode":202,"headers":[{"name":"x-everrest-websocket-channel","value":"t"}]}"#;
        assert!(decode(accepted).unwrap().is_none());

        let reply = r#"{"uuid":"1","responseCode":200,"headers":[],"body":"{}"}"#;
        assert!(decode(reply).unwrap().is_none());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decode("not json").is_err());
        assert!(control("not json").is_none());
    }
}
