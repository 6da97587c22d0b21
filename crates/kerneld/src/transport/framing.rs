//! How frames are delimited on a peer connection.
//!
//! Framed connections carry
//!
//! ```text
//! [4 bytes: payload length (big-endian u32)] [payload bytes]
//! ```
//!
//! and raw connections (the physical heartbeat) pass bytes through as they
//! arrive. The size limit applies in both directions on a framed connection.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default maximum frame size: 100 MiB.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

const RAW_READ_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireMode {
    /// Length-prefixed frames of at most `max` bytes.
    Framed { max: usize },
    /// Unframed bytes, passed through as they arrive.
    Raw,
}

impl WireMode {
    pub fn framed() -> Self {
        WireMode::Framed {
            max: MAX_FRAME_SIZE,
        }
    }
}

/// The length prefix for a `len` byte payload, if `max` allows one that large.
fn length_prefix(len: usize, max: usize) -> io::Result<u32> {
    match u32::try_from(len) {
        Ok(prefix) if len <= max => Ok(prefix),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes (max {max})"),
        )),
    }
}

/// Write one frame and flush. An oversized frame is refused before anything
/// reaches the connection.
pub async fn write_frame<W>(writer: &mut W, mode: WireMode, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match mode {
        WireMode::Framed { max } => {
            let prefix = length_prefix(frame.len(), max)?.to_be_bytes();
            let mut out = Buf::chain(&prefix[..], frame);
            writer.write_all_buf(&mut out).await?;
        }
        WireMode::Raw => writer.write_all(frame).await?,
    }
    writer.flush().await
}

/// Read the next frame. `None` means the peer disconnected between frames.
pub async fn read_frame<R>(reader: &mut R, mode: WireMode) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    match mode {
        WireMode::Framed { max } => {
            let len = match reader.read_u32().await {
                Ok(len) => len as usize,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e),
            };
            length_prefix(len, max)?;
            let mut buf = BytesMut::zeroed(len);
            reader.read_exact(&mut buf).await?;
            Ok(Some(buf.freeze()))
        }
        WireMode::Raw => {
            let mut buf = BytesMut::zeroed(RAW_READ_SIZE);
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            buf.truncate(n);
            Ok(Some(buf.freeze()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_framed_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, WireMode::framed(), b"hello world").await.unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 11]);
        assert_eq!(&buf[4..], b"hello world");

        let mut cursor = Cursor::new(buf);
        let frame = read_frame(&mut cursor, WireMode::framed()).await.unwrap();
        assert_eq!(frame.as_deref(), Some(&b"hello world"[..]));
        assert!(read_frame(&mut cursor, WireMode::framed()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_limit_applies_to_both_directions() {
        let mode = WireMode::Framed { max: 4 };

        let mut out = Vec::new();
        let err = write_frame(&mut out, mode, b"too long").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(out.is_empty());

        let mut cursor = Cursor::new(5u32.to_be_bytes().to_vec());
        let err = read_frame(&mut cursor, mode).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_payload_is_an_error() {
        let mut buf = 10u32.to_be_bytes().to_vec();
        buf.extend_from_slice(b"short");
        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor, WireMode::framed()).await.is_err());
    }

    #[tokio::test]
    async fn test_raw_mode_passes_bytes_through() {
        let mut out = Vec::new();
        write_frame(&mut out, WireMode::Raw, b"ping\x00").await.unwrap();
        assert_eq!(out, b"ping\x00");

        let mut cursor = Cursor::new(out);
        let frame = read_frame(&mut cursor, WireMode::Raw).await.unwrap();
        assert_eq!(frame.as_deref(), Some(&b"ping\x00"[..]));
        assert!(read_frame(&mut cursor, WireMode::Raw).await.unwrap().is_none());
    }
}
