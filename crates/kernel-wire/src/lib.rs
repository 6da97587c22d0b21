//! Wire-level message types and codecs for the kerneld kernel transport.
//!
//! This crate knows how a Jupyter message looks on the wire and nothing about
//! sockets or threads:
//!
//! - [`ChannelName`]: the five canonical channels
//! - [`Header`], [`Envelope`] and the [`Session`] that mints them
//! - [`MessageContent`]: the tagged union of content payloads, backed by a
//!   [`ContentRegistry`] that is validated before any codec is built
//! - [`JsonCodec`]: envelope <-> JSON, with the optional `channel` discriminator
//! - [`frame`]: the offset-table binary attachment framing
//! - [`SharedFrameCodec`]: kind-tagged frames for the shared-connection binding
//! - [`MultipartCodec`]: signed multipart frames for the physical binding

mod base64;
mod channel;
mod content;
mod error;
pub mod frame;
mod header;
mod message;
mod multipart;
mod registry;
mod shared;
mod signing;

use bytes::Bytes;

pub use channel::{ChannelName, ChannelRole};
pub use content::*;
pub use error::{DecodeError, EncodeError, FrameError, KeyError, RegistryError};
pub use header::{Header, Session, PROTOCOL_VERSION};
pub use message::{Envelope, JsonCodec};
pub use multipart::MultipartCodec;
pub use registry::{ContentCodec, ContentRegistry};
pub use shared::{SharedFrameCodec, SharedFrameKind};
pub use signing::Signer;

/// Encodes and decodes envelopes for one transport binding.
///
/// The channel is passed explicitly because a physical binding implies it by
/// socket while a shared binding writes it into the frame.
pub trait EnvelopeCodec: Send + Sync {
    fn encode(&self, channel: ChannelName, envelope: &Envelope) -> Result<Bytes, EncodeError>;

    fn decode(&self, channel: ChannelName, frame: &Bytes) -> Result<Envelope, DecodeError>;
}
