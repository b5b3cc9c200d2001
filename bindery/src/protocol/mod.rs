//! Wire message model for inter-agent communication.
//!
//! Every message exchanged over the bus is a [`Message`]: a typed payload
//! plus routing envelope fields. On the wire this serializes as
//! `{type, data, source, target, timestamp, message_id}`, with `timestamp`
//! and `message_id` assigned by the bus when a client omits them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// The routing target of a message.
///
/// `"all"` on the wire denotes a broadcast; any other string names an agent
/// or a client id. Resolution of a name to a connection happens in the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Recipient {
    /// Deliver to every connected channel except the sender.
    Broadcast,
    /// Deliver to a single agent name or client id.
    Named(String),
}

impl Recipient {
    /// Creates a named recipient.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    /// Returns the wire representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Broadcast => "all",
            Self::Named(name) => name,
        }
    }
}

impl From<String> for Recipient {
    fn from(value: String) -> Self {
        if value == "all" {
            Self::Broadcast
        } else {
            Self::Named(value)
        }
    }
}

impl From<Recipient> for String {
    fn from(value: Recipient) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload of a `register` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    /// The agent name to bind this connection to.
    pub agent_name: String,
}

/// Payload of a `subscribe` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribePayload {
    /// Event names the client is interested in.
    #[serde(default)]
    pub events: Vec<String>,
}

/// Payload of an `event` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    /// The event name (e.g., "connected", "agent_connected").
    pub event: String,
    /// Event-specific fields.
    #[serde(flatten)]
    pub fields: HashMap<String, serde_json::Value>,
}

/// Payload of a `status` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    /// The reported status value (e.g., "running", "completed").
    pub status: String,
    /// The pipeline stage the status refers to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Additional status fields.
    #[serde(flatten)]
    pub fields: HashMap<String, serde_json::Value>,
}

/// Payload of a `command` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    /// The command name.
    pub command: String,
    /// Command arguments.
    #[serde(flatten)]
    pub args: HashMap<String, serde_json::Value>,
}

/// Payload of a `response` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// The response status (e.g., "registered", "subscribed").
    pub status: String,
    /// Additional response fields.
    #[serde(flatten)]
    pub fields: HashMap<String, serde_json::Value>,
}

/// Payload of an `error` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable error description.
    pub message: String,
}

/// The tagged payload union.
///
/// Malformed routing is caught at deserialization time: a message whose
/// `type` is unknown or whose `data` does not match the declared type fails
/// to parse instead of flowing through the bus untyped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// Bind the sending connection to an agent name.
    Register(RegisterPayload),
    /// Declare interest in a set of event names.
    Subscribe(SubscribePayload),
    /// A named event with arbitrary fields.
    Event(EventPayload),
    /// A pipeline status report.
    Status(StatusPayload),
    /// A command addressed to an agent.
    Command(CommandPayload),
    /// A direct reply to a prior message.
    Response(ResponsePayload),
    /// An error reply.
    Error(ErrorPayload),
}

impl Payload {
    /// Returns the wire tag for this payload.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::Subscribe(_) => "subscribe",
            Self::Event(_) => "event",
            Self::Status(_) => "status",
            Self::Command(_) => "command",
            Self::Response(_) => "response",
            Self::Error(_) => "error",
        }
    }
}

/// A routed message: typed payload plus envelope fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// The typed payload, serialized as `type` + `data`.
    #[serde(flatten)]
    pub payload: Payload,

    /// Who sent the message (agent name or client id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Where the message should be delivered.
    #[serde(default = "default_target")]
    pub target: Recipient,

    /// When the message was created (ISO 8601). Assigned by the bus if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// Unique message id. Assigned by the bus if absent.
    #[serde(rename = "message_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
}

fn default_target() -> Recipient {
    Recipient::Broadcast
}

impl Message {
    /// Creates a message from a payload, targeted at everyone.
    #[must_use]
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            source: None,
            target: Recipient::Broadcast,
            timestamp: None,
            id: None,
        }
    }

    /// Creates an event message.
    #[must_use]
    pub fn event(name: impl Into<String>, fields: HashMap<String, serde_json::Value>) -> Self {
        Self::new(Payload::Event(EventPayload {
            event: name.into(),
            fields,
        }))
    }

    /// Creates a status message.
    #[must_use]
    pub fn status(
        status: impl Into<String>,
        stage: Option<String>,
        fields: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self::new(Payload::Status(StatusPayload {
            status: status.into(),
            stage,
            fields,
        }))
    }

    /// Creates a register message.
    #[must_use]
    pub fn register(agent_name: impl Into<String>) -> Self {
        Self::new(Payload::Register(RegisterPayload {
            agent_name: agent_name.into(),
        }))
    }

    /// Creates a response message.
    #[must_use]
    pub fn response(status: impl Into<String>, fields: HashMap<String, serde_json::Value>) -> Self {
        Self::new(Payload::Response(ResponsePayload {
            status: status.into(),
            fields,
        }))
    }

    /// Creates an error reply.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Payload::Error(ErrorPayload {
            message: message.into(),
        }))
    }

    /// Sets the source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the target.
    #[must_use]
    pub fn with_target(mut self, target: Recipient) -> Self {
        self.target = target;
        self
    }

    /// Sets the target to a named recipient.
    #[must_use]
    pub fn to(mut self, name: impl Into<String>) -> Self {
        self.target = Recipient::Named(name.into());
        self
    }

    /// Fills in server-assigned fields if the sender omitted them.
    pub fn assign_server_fields(&mut self) {
        if self.id.is_none() {
            self.id = Some(Uuid::new_v4());
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(crate::utils::iso_timestamp());
        }
    }

    /// Returns the event name if this is an event message.
    #[must_use]
    pub fn event_name(&self) -> Option<&str> {
        match &self.payload {
            Payload::Event(e) => Some(&e.event),
            _ => None,
        }
    }

    /// Parses a message from wire JSON.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Serializes the message to wire JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_recipient_wire_format() {
        assert_eq!(Recipient::Broadcast.as_str(), "all");
        assert_eq!(Recipient::named("formatter").as_str(), "formatter");
        assert_eq!(Recipient::from("all".to_string()), Recipient::Broadcast);
        assert_eq!(
            Recipient::from("client_a1b2".to_string()),
            Recipient::named("client_a1b2")
        );
    }

    #[test]
    fn test_message_wire_shape() {
        let mut fields = HashMap::new();
        fields.insert("client_id".to_string(), serde_json::json!("client_a1b2"));

        let mut msg = Message::event("connected", fields).with_source("bus");
        msg.assign_server_fields();

        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["data"]["event"], "connected");
        assert_eq!(value["data"]["client_id"], "client_a1b2");
        assert_eq!(value["source"], "bus");
        assert_eq!(value["target"], "all");
        assert!(value["message_id"].is_string());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_register_round_trip() {
        let raw = r#"{"type":"register","data":{"agent_name":"content"},"target":"all"}"#;
        let msg = Message::from_json(raw).unwrap();

        match &msg.payload {
            Payload::Register(p) => assert_eq!(p.agent_name, "content"),
            other => panic!("unexpected payload: {other:?}"),
        }
        assert!(msg.id.is_none());
        assert!(msg.timestamp.is_none());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let raw = r#"{"type":"telemetry","data":{},"target":"all"}"#;
        assert!(Message::from_json(raw).is_err());
    }

    #[test]
    fn test_malformed_data_rejected() {
        // `register` without an agent_name must not parse.
        let raw = r#"{"type":"register","data":{},"target":"all"}"#;
        assert!(Message::from_json(raw).is_err());
    }

    #[test]
    fn test_default_target_is_broadcast() {
        let raw = r#"{"type":"event","data":{"event":"ping"}}"#;
        let msg = Message::from_json(raw).unwrap();
        assert_eq!(msg.target, Recipient::Broadcast);
    }

    #[test]
    fn test_assign_server_fields_is_idempotent() {
        let mut msg = Message::event("ping", HashMap::new());
        msg.assign_server_fields();
        let id = msg.id;
        let ts = msg.timestamp.clone();

        msg.assign_server_fields();
        assert_eq!(msg.id, id);
        assert_eq!(msg.timestamp, ts);
    }

    #[test]
    fn test_status_payload_flattens_fields() {
        let mut fields = HashMap::new();
        fields.insert("chapters".to_string(), serde_json::json!(5));

        let msg = Message::status("completed", Some("content".to_string()), fields);
        let value = serde_json::to_value(&msg).unwrap();

        assert_eq!(value["data"]["status"], "completed");
        assert_eq!(value["data"]["stage"], "content");
        assert_eq!(value["data"]["chapters"], 5);
    }
}
