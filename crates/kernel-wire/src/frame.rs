//! Offset-table binary framing.
//!
//! ```text
//! [4 bytes: n (big-endian u32)]
//! [n x 4 bytes: start offset of each part, from frame start]
//! [part 0][part 1] ... [part n-1]
//! ```
//!
//! Part `i` spans `offsets[i]..offsets[i + 1]`, the last part ends at the
//! frame length. Part 0 is the JSON message, the rest are attachments.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{EncodeError, FrameError};

const WORD: usize = 4;

/// Lay out `parts` behind an offset table.
pub fn encode_parts<P: AsRef<[u8]>>(parts: &[P]) -> Result<Bytes, EncodeError> {
    let table_len = WORD + WORD * parts.len();
    let total = table_len + parts.iter().map(|p| p.as_ref().len()).sum::<usize>();
    if total > u32::MAX as usize {
        return Err(EncodeError::FrameTooLarge(total));
    }

    let mut frame = BytesMut::with_capacity(total);
    frame.put_u32(parts.len() as u32);
    let mut offset = table_len;
    for part in parts {
        frame.put_u32(offset as u32);
        offset += part.as_ref().len();
    }
    for part in parts {
        frame.put_slice(part.as_ref());
    }
    Ok(frame.freeze())
}

/// Split a frame back into its parts without copying.
pub fn decode_parts(frame: &Bytes) -> Result<Vec<Bytes>, FrameError> {
    if frame.is_empty() {
        return Err(FrameError::Empty);
    }
    let n = read_u32(frame, 0)? as usize;
    if n == 0 {
        return Err(FrameError::NoParts);
    }
    let table_len = n
        .checked_mul(WORD)
        .and_then(|t| t.checked_add(WORD))
        .ok_or(FrameError::Truncated {
            needed: usize::MAX,
            len: frame.len(),
        })?;
    if table_len > frame.len() {
        return Err(FrameError::Truncated {
            needed: table_len,
            len: frame.len(),
        });
    }

    let mut offsets = Vec::with_capacity(n + 1);
    for index in 0..n {
        let offset = read_u32(frame, WORD + index * WORD)? as usize;
        let floor = offsets.last().copied().unwrap_or(table_len);
        if offset < floor || offset > frame.len() {
            return Err(FrameError::BadOffset { index, offset });
        }
        offsets.push(offset);
    }
    offsets.push(frame.len());

    Ok(offsets
        .windows(2)
        .map(|w| frame.slice(w[0]..w[1]))
        .collect())
}

/// Frame a JSON message followed by its attachments.
pub fn encode_with_attachments(
    content: &[u8],
    attachments: &[Bytes],
) -> Result<Bytes, EncodeError> {
    let mut parts: Vec<&[u8]> = Vec::with_capacity(1 + attachments.len());
    parts.push(content);
    parts.extend(attachments.iter().map(|a| a.as_ref()));
    encode_parts(&parts)
}

/// Inverse of [`encode_with_attachments`].
pub fn decode_with_attachments(frame: &Bytes) -> Result<(Bytes, Vec<Bytes>), FrameError> {
    let mut parts = decode_parts(frame)?.into_iter();
    // decode_parts never returns an empty list
    let content = parts.next().ok_or(FrameError::NoParts)?;
    Ok((content, parts.collect()))
}

fn read_u32(frame: &[u8], at: usize) -> Result<u32, FrameError> {
    frame
        .get(at..at + WORD)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(FrameError::Truncated {
            needed: at + WORD,
            len: frame.len(),
        })
}
