use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::content::MessageContent;
use crate::message::Envelope;

/// Messaging protocol version written into every header we mint.
pub const PROTOCOL_VERSION: &str = "5.3";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub session: String,
    pub username: String,
    pub date: DateTime<Utc>,
    pub msg_type: String,
    pub version: String,
}

/// Serialize an absent parent header as `{}`.
pub(crate) fn serialize_parent_header<S>(
    parent: &Option<Header>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match parent {
        Some(header) => header.serialize(serializer),
        None => Map::new().serialize(serializer),
    }
}

/// Deserialize a parent header, mapping `{}`, `null`, and a missing field to `None`.
pub(crate) fn deserialize_parent_header<'de, D>(deserializer: D) -> Result<Option<Header>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<Value> = Option::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) if map.is_empty() => Ok(None),
        Some(other) => serde_json::from_value(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Mints headers and envelopes on behalf of one kernel session.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    username: String,
}

impl Session {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            username: username.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn header(&self, msg_type: &str) -> Header {
        Header {
            msg_id: Uuid::new_v4().to_string(),
            session: self.id.clone(),
            username: self.username.clone(),
            date: Utc::now(),
            msg_type: msg_type.to_string(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Build a message, optionally bound to the request it answers.
    pub fn message(&self, content: MessageContent, parent: Option<&Header>) -> Envelope {
        Envelope {
            header: self.header(content.msg_type()),
            parent_header: parent.cloned(),
            metadata: Map::new(),
            content,
            buffers: Vec::new(),
        }
    }

    pub fn reply(&self, request: &Envelope, content: MessageContent) -> Envelope {
        self.message(content, Some(&request.header))
    }
}
