use crate::header::Header;

/// Failure to turn inbound bytes into an [`Envelope`](crate::Envelope).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),

    #[error("message has no valid header")]
    MissingHeader,

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("unregistered message type: {}", .header.msg_type)]
    UnknownMessageType { header: Box<Header> },

    #[error("invalid {} content: {source}", .header.msg_type)]
    InvalidContent {
        header: Box<Header>,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    #[error("signature mismatch")]
    InvalidSignature,
}

impl DecodeError {
    /// The header, when decoding got far enough to read one.
    pub fn salvaged_header(&self) -> Option<&Header> {
        match self {
            DecodeError::UnknownMessageType { header }
            | DecodeError::InvalidContent { header, .. } => Some(header.as_ref()),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("header says {msg_type} but content is {content_type}")]
    ContentMismatch {
        msg_type: String,
        content_type: String,
    },

    #[error("no serializer registered for {0}")]
    UnknownMessageType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Errors in the offset-table framing itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame is empty")]
    Empty,

    #[error("frame declares no parts")]
    NoParts,

    #[error("offset table needs {needed} bytes but frame has {len}")]
    Truncated { needed: usize, len: usize },

    #[error("offset {offset} of part {index} is out of order or out of range")]
    BadOffset { index: usize, offset: usize },

    #[error("expected at least {expected} parts, got {actual}")]
    MissingParts { expected: usize, actual: usize },

    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("message type {0} is registered twice")]
    Duplicate(String),

    #[error("message types without a codec: {}", .0.join(", "))]
    Incomplete(Vec<String>),
}

/// A signing key the MAC refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid signing key: {0}")]
pub struct KeyError(pub(crate) String);
