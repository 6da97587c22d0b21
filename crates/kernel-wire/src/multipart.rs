//! Signed multipart frames for the physical (one socket per channel) binding.
//!
//! The frame is an offset-table frame whose parts are
//! `[signature, header, parent_header, metadata, content, buffers...]`,
//! the same part order a Jupyter kernel puts on its sockets.

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::channel::ChannelName;
use crate::error::{DecodeError, EncodeError, FrameError};
use crate::frame;
use crate::header::Header;
use crate::message::{Envelope, JsonCodec};
use crate::signing::Signer;
use crate::EnvelopeCodec;

const JSON_PARTS: usize = 4;

#[derive(Debug, Clone)]
pub struct MultipartCodec {
    json: JsonCodec,
    signer: Signer,
}

impl MultipartCodec {
    pub fn new(json: JsonCodec, signer: Signer) -> Self {
        Self { json, signer }
    }

    pub fn encode_frame(&self, envelope: &Envelope) -> Result<Bytes, EncodeError> {
        let header = serde_json::to_vec(&envelope.header)?;
        let parent = match &envelope.parent_header {
            Some(parent) => serde_json::to_vec(parent)?,
            None => b"{}".to_vec(),
        };
        let metadata = serde_json::to_vec(&envelope.metadata)?;
        let content = serde_json::to_vec(&self.json.encode_content(envelope)?)?;

        let signature = self.signer.sign(&[
            header.as_slice(),
            parent.as_slice(),
            metadata.as_slice(),
            content.as_slice(),
        ]);

        let mut parts: Vec<&[u8]> = vec![
            signature.as_bytes(),
            header.as_slice(),
            parent.as_slice(),
            metadata.as_slice(),
            content.as_slice(),
        ];
        parts.extend(envelope.buffers.iter().map(|b| b.as_ref()));
        frame::encode_parts(&parts)
    }

    pub fn decode_frame(&self, frame: &Bytes) -> Result<Envelope, DecodeError> {
        let parts = frame::decode_parts(frame)?;
        if parts.len() < 1 + JSON_PARTS {
            return Err(FrameError::MissingParts {
                expected: 1 + JSON_PARTS,
                actual: parts.len(),
            }
            .into());
        }
        let (signature, header, parent, metadata, content) =
            (&parts[0], &parts[1], &parts[2], &parts[3], &parts[4]);

        if !self
            .signer
            .verify(signature, &[&header[..], &parent[..], &metadata[..], &content[..]])
        {
            return Err(DecodeError::InvalidSignature);
        }

        let header: Header =
            serde_json::from_slice(header).map_err(|_| DecodeError::MissingHeader)?;
        let parent_header = parse_parent(parent)?;
        let metadata: Option<Map<String, Value>> =
            serde_json::from_slice(metadata).map_err(DecodeError::MalformedJson)?;
        let content: Value = serde_json::from_slice(content).map_err(DecodeError::MalformedJson)?;

        let (header, content) = self.json.decode_content(header, content)?;
        Ok(Envelope {
            header,
            parent_header,
            metadata: metadata.unwrap_or_default(),
            content,
            buffers: parts[1 + JSON_PARTS..].to_vec(),
        })
    }
}

fn parse_parent(bytes: &[u8]) -> Result<Option<Header>, DecodeError> {
    let value: Value = serde_json::from_slice(bytes).map_err(DecodeError::MalformedJson)?;
    match value {
        Value::Null => Ok(None),
        Value::Object(ref map) if map.is_empty() => Ok(None),
        other => serde_json::from_value(other)
            .map(Some)
            .map_err(DecodeError::MalformedJson),
    }
}

impl EnvelopeCodec for MultipartCodec {
    fn encode(&self, _channel: ChannelName, envelope: &Envelope) -> Result<Bytes, EncodeError> {
        self.encode_frame(envelope)
    }

    fn decode(&self, _channel: ChannelName, frame: &Bytes) -> Result<Envelope, DecodeError> {
        self.decode_frame(frame)
    }
}
