//! Frames for the shared-connection binding.
//!
//! Every frame starts with a one byte kind:
//!
//! ```text
//! [0x00] [JSON text, attachments inline as base64 `buffers`]
//! [0x01] [offset-table frame: JSON, attachment, attachment, ...]
//! ```
//!
//! In both forms the JSON carries a `channel` field naming the virtual channel.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;

use crate::channel::ChannelName;
use crate::error::{DecodeError, EncodeError, FrameError};
use crate::frame;
use crate::message::{Envelope, JsonCodec};
use crate::EnvelopeCodec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SharedFrameKind {
    Text = 0x00,
    Binary = 0x01,
}

impl TryFrom<u8> for SharedFrameKind {
    type Error = FrameError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x00 => Ok(SharedFrameKind::Text),
            0x01 => Ok(SharedFrameKind::Binary),
            k => Err(FrameError::UnknownKind(k)),
        }
    }
}

#[derive(Deserialize)]
struct ChannelPeek {
    #[serde(default)]
    channel: Option<String>,
}

/// Codec for frames on the shared connection.
///
/// Binary frames carry the offset table of [`frame`] after the kind byte, so
/// every offset in that table counts from the first byte of the body, not from
/// the start of the frame. A frame whose table lists `[16, 40]` has its JSON at
/// frame bytes `17..41`.
#[derive(Debug, Clone)]
pub struct SharedFrameCodec {
    json: JsonCodec,
}

impl SharedFrameCodec {
    pub fn new(json: JsonCodec) -> Self {
        Self { json }
    }

    /// Text frames unless the message has attachments.
    pub fn encode_frame(
        &self,
        channel: ChannelName,
        envelope: &Envelope,
    ) -> Result<Bytes, EncodeError> {
        if envelope.buffers.is_empty() {
            let json = self.json.encode_with(envelope, Some(channel), true)?;
            let mut out = BytesMut::with_capacity(1 + json.len());
            out.put_u8(SharedFrameKind::Text as u8);
            out.put_slice(&json);
            Ok(out.freeze())
        } else {
            let json = self.json.encode_with(envelope, Some(channel), false)?;
            let body = frame::encode_with_attachments(&json, &envelope.buffers)?;
            let mut out = BytesMut::with_capacity(1 + body.len());
            out.put_u8(SharedFrameKind::Binary as u8);
            out.put_slice(&body);
            Ok(out.freeze())
        }
    }

    /// Split a frame into its JSON part and out-of-band attachments.
    pub fn split(frame: &Bytes) -> Result<(SharedFrameKind, Bytes, Vec<Bytes>), FrameError> {
        let kind_byte = *frame.first().ok_or(FrameError::Empty)?;
        let kind = SharedFrameKind::try_from(kind_byte)?;
        let body = frame.slice(1..);
        match kind {
            SharedFrameKind::Text => Ok((kind, body, Vec::new())),
            SharedFrameKind::Binary => {
                let (json, attachments) = frame::decode_with_attachments(&body)?;
                Ok((kind, json, attachments))
            }
        }
    }

    /// Read only the channel discriminator, for routing.
    pub fn peek_channel(frame: &Bytes) -> Result<ChannelName, DecodeError> {
        let (_, json, _) = Self::split(frame)?;
        let peek: ChannelPeek =
            serde_json::from_slice(&json).map_err(DecodeError::MalformedJson)?;
        peek
            .channel
            .unwrap_or_default()
            .parse::<ChannelName>()
            .map_err(DecodeError::UnknownChannel)
    }

    pub fn decode_frame(&self, frame: &Bytes) -> Result<(ChannelName, Envelope), DecodeError> {
        let (_, json, attachments) = Self::split(frame)?;
        let (channel, mut envelope) = self.json.decode_with_channel(&json)?;
        let channel = channel.ok_or_else(|| DecodeError::UnknownChannel(String::new()))?;
        envelope.buffers.extend(attachments);
        Ok((channel, envelope))
    }
}

impl EnvelopeCodec for SharedFrameCodec {
    fn encode(&self, channel: ChannelName, envelope: &Envelope) -> Result<Bytes, EncodeError> {
        self.encode_frame(channel, envelope)
    }

    fn decode(&self, _channel: ChannelName, frame: &Bytes) -> Result<Envelope, DecodeError> {
        self.decode_frame(frame).map(|(_, envelope)| envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{CommMsg, ExecutionState, MessageContent};
    use crate::header::Session;
    use serde_json::{json, Map};

    fn codec() -> SharedFrameCodec {
        SharedFrameCodec::new(JsonCodec::builtin())
    }

    #[test]
    fn test_text_frame_roundtrip() {
        let session = Session::new("kernel");
        let msg = session.message(MessageContent::status(ExecutionState::Busy), None);
        let frame = codec().encode_frame(ChannelName::Iopub, &msg).unwrap();
        assert_eq!(frame[0], SharedFrameKind::Text as u8);
        assert_eq!(SharedFrameCodec::peek_channel(&frame).unwrap(), ChannelName::Iopub);
        let (channel, back) = codec().decode_frame(&frame).unwrap();
        assert_eq!(channel, ChannelName::Iopub);
        assert_eq!(back, msg);
    }

    #[test]
    fn test_binary_frame_carries_attachments_out_of_band() {
        let session = Session::new("kernel");
        let mut data = Map::new();
        data.insert("method".into(), json!("update"));
        let mut msg = session.message(
            MessageContent::CommMsg(CommMsg {
                comm_id: "c1".into(),
                data,
            }),
            None,
        );
        msg.buffers = vec![Bytes::from_static(&[1, 2, 3]), Bytes::from_static(&[4])];

        let frame = codec().encode_frame(ChannelName::Shell, &msg).unwrap();
        assert_eq!(frame[0], SharedFrameKind::Binary as u8);

        let (_, json_part, attachments) = SharedFrameCodec::split(&frame).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json_part).unwrap();
        assert!(value.get("buffers").is_none());
        assert_eq!(value["channel"], "shell");
        assert_eq!(attachments.len(), 2);

        let (channel, back) = codec().decode_frame(&frame).unwrap();
        assert_eq!(channel, ChannelName::Shell);
        assert_eq!(back, msg);
    }

    #[test]
    fn test_binary_offsets_count_from_the_body() {
        let session = Session::new("kernel");
        let mut msg = session.message(MessageContent::status(ExecutionState::Idle), None);
        msg.buffers = vec![Bytes::from_static(b"xyz")];
        let frame = codec().encode_frame(ChannelName::Iopub, &msg).unwrap();

        // two parts, so the table is 12 bytes and the JSON starts at body offset 12
        assert_eq!(&frame[1..5], &[0, 0, 0, 2]);
        assert_eq!(&frame[5..9], &[0, 0, 0, 12]);
        let attachment_at = u32::from_be_bytes([frame[9], frame[10], frame[11], frame[12]]);
        let attachment_at = 1 + attachment_at as usize;
        assert_eq!(&frame[attachment_at..], b"xyz");
    }

    #[test]
    fn test_unknown_or_missing_channel() {
        let mut frame = vec![0x00];
        frame.extend_from_slice(br#"{"channel": "debug", "header": {}}"#);
        let frame = Bytes::from(frame);
        assert!(matches!(
            SharedFrameCodec::peek_channel(&frame),
            Err(DecodeError::UnknownChannel(name)) if name == "debug"
        ));

        let mut frame = vec![0x00];
        frame.extend_from_slice(br#"{"header": {}}"#);
        assert!(matches!(
            SharedFrameCodec::peek_channel(&Bytes::from(frame)),
            Err(DecodeError::UnknownChannel(_))
        ));
    }

    #[test]
    fn test_unknown_kind() {
        let frame = Bytes::from_static(&[0x07, b'{', b'}']);
        assert!(matches!(
            SharedFrameCodec::peek_channel(&frame),
            Err(DecodeError::MalformedFrame(FrameError::UnknownKind(0x07)))
        ));
    }

    #[test]
    fn test_heartbeat_frame_needs_only_a_channel() {
        let mut frame = vec![0x00];
        frame.extend_from_slice(br#"{"channel": "hb", "ping": 1}"#);
        assert_eq!(
            SharedFrameCodec::peek_channel(&Bytes::from(frame)).unwrap(),
            ChannelName::Heartbeat
        );
    }
}
