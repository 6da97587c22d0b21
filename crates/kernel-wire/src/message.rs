//! The message envelope and its JSON form.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::base64::inline_buffers;
use crate::channel::ChannelName;
use crate::content::{ErrorReply, MessageContent};
use crate::error::{DecodeError, EncodeError, RegistryError};
use crate::header::{deserialize_parent_header, serialize_parent_header, Header};
use crate::registry::ContentRegistry;

/// One kernel message: header, optional parent, metadata, tagged content and
/// its ordered binary attachments.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub header: Header,
    pub parent_header: Option<Header>,
    pub metadata: Map<String, Value>,
    pub content: MessageContent,
    pub buffers: Vec<Bytes>,
}

impl Envelope {
    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// `msg_id` of the request this message answers, if any.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }
}

/// Outbound JSON shape. `buffers` is only written for text frames.
#[derive(Serialize)]
struct OutboundMessage<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<ChannelName>,
    header: &'a Header,
    #[serde(serialize_with = "serialize_parent_header")]
    parent_header: Option<Header>,
    metadata: &'a Map<String, Value>,
    content: Value,
    #[serde(skip_serializing_if = "Vec::is_empty", with = "inline_buffers")]
    buffers: Vec<Bytes>,
}

/// Inbound JSON shape, with `header` and `content` left raw so that a bad
/// header and an unknown `msg_type` can be told apart.
#[derive(Deserialize)]
struct InboundMessage {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    header: Option<Value>,
    #[serde(default, deserialize_with = "deserialize_parent_header")]
    parent_header: Option<Header>,
    #[serde(default, deserialize_with = "deserialize_metadata")]
    metadata: Map<String, Value>,
    #[serde(default)]
    content: Value,
    #[serde(default, with = "inline_buffers")]
    buffers: Vec<Bytes>,
}

fn deserialize_metadata<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let metadata: Option<Map<String, Value>> = Option::deserialize(deserializer)?;
    Ok(metadata.unwrap_or_default())
}

/// Envelope <-> JSON using a validated [`ContentRegistry`].
#[derive(Debug, Clone)]
pub struct JsonCodec {
    registry: Arc<ContentRegistry>,
}

impl JsonCodec {
    pub fn new(registry: ContentRegistry) -> Result<Self, RegistryError> {
        registry.validate()?;
        Ok(Self {
            registry: Arc::new(registry),
        })
    }

    pub fn builtin() -> Self {
        Self {
            registry: Arc::new(ContentRegistry::builtin()),
        }
    }

    pub fn registry(&self) -> &ContentRegistry {
        &self.registry
    }

    /// Serialize only the content, checking it agrees with the header's tag.
    ///
    /// An [`ErrorReply`] is accepted under any `*_reply` tag, registered or not.
    pub fn encode_content(&self, envelope: &Envelope) -> Result<Value, EncodeError> {
        let msg_type = envelope.header.msg_type.as_str();
        if envelope.content.msg_type() != msg_type {
            return Err(EncodeError::ContentMismatch {
                msg_type: msg_type.to_string(),
                content_type: envelope.content.msg_type().to_string(),
            });
        }
        if let MessageContent::ErrorReply(reply) = &envelope.content {
            if !ErrorReply::is_reply_type(msg_type) {
                return Err(EncodeError::UnknownMessageType(msg_type.to_string()));
            }
            return Ok(serde_json::to_value(reply)?);
        }
        match self.registry.serialize(msg_type, &envelope.content) {
            Some(result) => Ok(result?),
            None => Err(EncodeError::UnknownMessageType(msg_type.to_string())),
        }
    }

    /// Encode to JSON bytes. Attachments are inlined as base64 when
    /// `inline_buffers` is set and dropped otherwise (the caller frames them).
    pub fn encode_with(
        &self,
        envelope: &Envelope,
        channel: Option<ChannelName>,
        inline_buffers: bool,
    ) -> Result<Vec<u8>, EncodeError> {
        let outbound = OutboundMessage {
            channel,
            header: &envelope.header,
            parent_header: envelope.parent_header.clone(),
            metadata: &envelope.metadata,
            content: self.encode_content(envelope)?,
            buffers: if inline_buffers {
                envelope.buffers.clone()
            } else {
                Vec::new()
            },
        };
        Ok(serde_json::to_vec(&outbound)?)
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
        self.encode_with(envelope, None, true)
    }

    /// Decode JSON bytes, returning the channel discriminator if present.
    pub fn decode_with_channel(
        &self,
        bytes: &[u8],
    ) -> Result<(Option<ChannelName>, Envelope), DecodeError> {
        let inbound: InboundMessage =
            serde_json::from_slice(bytes).map_err(DecodeError::MalformedJson)?;

        let header: Header = inbound
            .header
            .and_then(|h| serde_json::from_value(h).ok())
            .ok_or(DecodeError::MissingHeader)?;

        let channel = match inbound.channel {
            Some(name) => Some(
                name.parse::<ChannelName>()
                    .map_err(DecodeError::UnknownChannel)?,
            ),
            None => None,
        };

        let (header, content) = self.decode_content(header, inbound.content)?;

        Ok((
            channel,
            Envelope {
                header,
                parent_header: inbound.parent_header,
                metadata: inbound.metadata,
                content,
                buffers: inbound.buffers,
            },
        ))
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Envelope, DecodeError> {
        self.decode_with_channel(bytes).map(|(_, envelope)| envelope)
    }

    /// Deserialize raw content under `header`'s tag. The header is handed
    /// back so callers keep ownership on success.
    ///
    /// A `*_reply` with an error status that its registered type cannot
    /// hold, or whose tag is unregistered, decodes as an [`ErrorReply`].
    pub(crate) fn decode_content(
        &self,
        header: Header,
        content: Value,
    ) -> Result<(Header, MessageContent), DecodeError> {
        if ErrorReply::is_reply_type(&header.msg_type) && content["status"] == "error" {
            if let Some(Ok(typed)) = self.registry.deserialize(&header.msg_type, content.clone()) {
                return Ok((header, typed));
            }
            return match serde_json::from_value::<ErrorReply>(content) {
                Ok(mut reply) => {
                    reply.reply_type = header.msg_type.clone();
                    Ok((header, MessageContent::ErrorReply(reply)))
                }
                Err(source) => Err(DecodeError::InvalidContent {
                    header: Box::new(header),
                    source,
                }),
            };
        }
        match self.registry.deserialize(&header.msg_type, content) {
            None => Err(DecodeError::UnknownMessageType {
                header: Box::new(header),
            }),
            Some(Err(source)) => Err(DecodeError::InvalidContent {
                header: Box::new(header),
                source,
            }),
            Some(Ok(content)) => Ok((header, content)),
        }
    }
}
