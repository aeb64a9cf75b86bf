//! # Packet Codec
//!
//! Encodes and decodes the bus's framed packet format into and out of pooled
//! buffers.
//!
//! ## Wire Format
//!
//! A byte-stream frame is laid out as:
//!
//! ```text
//! [u32 frame length (LE)] [u32 message count (LE)] [payload blobs...] [type tags...]
//! ```
//!
//! The length prefix covers everything after itself, not the 4 prefix bytes.
//! The payload vector fully precedes the tag vector, and both have exactly
//! `message count` entries. Every payload blob is self-delimiting: a 7-bit
//! varint byte length followed by the externally-encoded payload bytes. The
//! frame codec never interprets payload content - that belongs to the
//! payload schema ([`BusMessage`](crate::BusMessage)).
//!
//! Datagram frames use the identical inner structure with no outer length
//! prefix; the datagram boundary is authoritative there.
//!
//! All multi-byte integers are little-endian, fixed for the whole system.
//!
//! ## Decode Discipline
//!
//! Decoding reads exactly 4 bytes to learn the frame length, then exactly
//! that many more, retrying partial reads in a loop. Stream end while at
//! least one more byte is expected is [`BusError::TransportClosed`], never a
//! corrupt-frame error - a peer exiting mid-frame is a transport condition,
//! not schema drift. Frames larger than the receiving buffer grow the buffer
//! in place before the read continues.

use crate::pool::{BufferHandle, StaleHandleError};
use crate::{BusError, BusMessage};
use std::io::Read;

/// Size of the outer frame length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Bytes reserved at the front of an outgoing buffer: the length prefix plus
/// the message count.
pub const FRAME_HEADER_BYTES: usize = 8;

/// Upper bound on a single frame. Anything larger is schema drift or a
/// corrupted prefix, not legitimate control traffic.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Resets a buffer and reserves the frame header so payload blobs can be
/// appended directly behind it.
pub fn begin_frame(buf: &mut Vec<u8>) {
    buf.clear();
    buf.resize(FRAME_HEADER_BYTES, 0);
}

/// Appends one payload blob (varint length + bytes) to an open frame.
pub fn append_blob(buf: &mut Vec<u8>, payload: &[u8]) {
    write_varint(buf, payload.len());
    buf.extend_from_slice(payload);
}

/// Finalizes an open frame: appends the tag vector and patches the message
/// count and outer length prefix.
///
/// After sealing, the buffer holds one complete wire frame ready to be
/// written verbatim by a stream writer (datagram senders skip the first
/// [`LENGTH_PREFIX_BYTES`]).
pub fn seal_frame(buf: &mut Vec<u8>, tags: &[u8]) {
    buf.extend_from_slice(tags);
    let count = tags.len() as u32;
    buf[LENGTH_PREFIX_BYTES..FRAME_HEADER_BYTES].copy_from_slice(&count.to_le_bytes());
    let frame_len = (buf.len() - LENGTH_PREFIX_BYTES) as u32;
    buf[..LENGTH_PREFIX_BYTES].copy_from_slice(&frame_len.to_le_bytes());
}

/// Writes a 7-bit varint (LEB128-style), the payload schema's own length
/// delimiting.
pub fn write_varint(buf: &mut Vec<u8>, mut value: usize) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Reads a 7-bit varint starting at `*pos`, advancing `*pos` past it.
pub fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<usize, BusError> {
    let mut value: usize = 0;
    let mut shift = 0u32;
    loop {
        let byte = *bytes
            .get(*pos)
            .ok_or_else(|| BusError::CorruptFrame("varint truncated".to_string()))?;
        *pos += 1;
        if shift >= 35 {
            return Err(BusError::CorruptFrame("varint too long".to_string()));
        }
        value |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Reads exactly `buf.len()` bytes, looping over partial reads.
///
/// Stream end (a zero-byte read) while bytes are still expected surfaces as
/// [`BusError::TransportClosed`].
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), BusError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(BusError::TransportClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(BusError::Io(e)),
        }
    }
    Ok(())
}

/// Reads one length-prefixed frame from a byte stream into the checked-out
/// buffer behind `handle`.
///
/// On success the buffer holds the frame's inner content (message count,
/// blobs, tags) starting at byte 0, ready for [`split_frame`]. The buffer
/// grows in place when the declared frame length exceeds its current
/// capacity; no prior content is preserved since decode always starts from
/// byte 0.
pub fn read_frame<R: Read>(reader: &mut R, handle: &BufferHandle) -> Result<(), BusError> {
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    read_full(reader, &mut prefix)?;
    let frame_len = u32::from_le_bytes(prefix) as usize;

    if frame_len < 4 {
        return Err(BusError::CorruptFrame(format!(
            "frame length {frame_len} cannot hold a message count"
        )));
    }
    if frame_len > MAX_FRAME_BYTES {
        return Err(BusError::CorruptFrame(format!(
            "frame length {frame_len} exceeds the {MAX_FRAME_BYTES} byte limit"
        )));
    }

    let mut content = handle.try_bytes()?;
    content.clear();
    content.resize(frame_len, 0);
    read_full(reader, &mut content)?;
    Ok(())
}

/// Splits a decoded frame into per-message tokens.
///
/// Expects the buffer to hold the inner frame content starting at byte 0
/// (what [`read_frame`] produces for streams, or a raw datagram body). Each
/// token clones the buffer handle, keeping the backing bytes alive for as
/// long as the token survives.
pub fn split_frame(handle: &BufferHandle) -> Result<Vec<MessageToken>, BusError> {
    let mut ranges = Vec::new();
    let mut tags = Vec::new();
    {
        let content = handle.try_bytes()?;
        let bytes = &content[..];
        if bytes.len() < 4 {
            return Err(BusError::CorruptFrame(
                "frame too short for a message count".to_string(),
            ));
        }
        let count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        // Each sub-message needs at least one varint byte and one tag byte,
        // so a count beyond the remaining length is a forged header.
        if count > bytes.len().saturating_sub(4) {
            return Err(BusError::CorruptFrame(format!(
                "message count {count} exceeds frame capacity"
            )));
        }

        let mut pos = 4;
        ranges.reserve(count);
        for index in 0..count {
            let len = read_varint(bytes, &mut pos)?;
            if pos + len > bytes.len() {
                return Err(BusError::CorruptFrame(format!(
                    "payload {index} of {count} overruns the frame"
                )));
            }
            ranges.push((pos, len));
            pos += len;
        }

        if pos + count != bytes.len() {
            return Err(BusError::CorruptFrame(format!(
                "expected {count} type tags after the payload vector, found {} trailing bytes",
                bytes.len() - pos
            )));
        }
        tags.extend_from_slice(&bytes[pos..]);
    }

    let mut tokens = Vec::with_capacity(tags.len());
    for ((offset, len), tag) in ranges.into_iter().zip(tags) {
        tokens.push(MessageToken {
            handle: handle.clone(),
            tag,
            offset,
            len,
        });
    }
    Ok(tokens)
}

/// A read-only, ref-counted view of one sub-message inside a decoded frame.
///
/// The token holds a clone of the backing buffer's checkout handle, so the
/// payload bytes stay valid for exactly as long as the token (or any clone
/// of it) lives. Once every token and the reader's own handle are dropped,
/// the buffer returns to the pool and the bytes are gone - a token kept past
/// that point cannot exist, and a [`WeakBufferHandle`](crate::pool::WeakBufferHandle)
/// derived from one fails validation instead.
#[derive(Debug, Clone)]
pub struct MessageToken {
    handle: BufferHandle,
    tag: u8,
    offset: usize,
    len: usize,
}

impl MessageToken {
    /// The sub-message's declared type tag.
    pub fn tag(&self) -> u8 {
        self.tag
    }

    /// Length of the encoded payload in bytes.
    pub fn payload_len(&self) -> usize {
        self.len
    }

    /// Copies the encoded payload bytes out of the backing buffer.
    pub fn payload(&self) -> Result<Vec<u8>, StaleHandleError> {
        let content = self.handle.try_bytes()?;
        Ok(content[self.offset..self.offset + self.len].to_vec())
    }

    /// Decodes the payload as a typed message.
    pub fn decode<T: BusMessage>(&self) -> Result<T, BusError> {
        let content = self.handle.try_bytes()?;
        T::decode(&content[self.offset..self.offset + self.len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use std::io::Cursor;

    fn build_frame(pool: &BufferPool, messages: &[(u8, &[u8])]) -> BufferHandle {
        let handle = pool.checkout();
        let mut tags = Vec::new();
        {
            let mut buf = handle.bytes();
            begin_frame(&mut buf);
            for (tag, payload) in messages {
                append_blob(&mut buf, payload);
                tags.push(*tag);
            }
            seal_frame(&mut buf, &tags);
        }
        handle
    }

    fn decode_frame(pool: &BufferPool, wire: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let handle = pool.checkout();
        let mut cursor = Cursor::new(wire.to_vec());
        read_frame(&mut cursor, &handle).expect("read_frame failed");
        split_frame(&handle)
            .expect("split_frame failed")
            .iter()
            .map(|token| (token.tag(), token.payload().expect("payload read failed")))
            .collect()
    }

    #[test]
    fn test_varint_round_trip() {
        for value in [0usize, 1, 127, 128, 300, 16383, 16384, 1 << 20, MAX_FRAME_BYTES] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut pos = 0;
            assert_eq!(read_varint(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_varint_truncated_is_corrupt() {
        // Continuation bit set with nothing following.
        let err = read_varint(&[0x80], &mut 0).unwrap_err();
        assert!(matches!(err, BusError::CorruptFrame(_)));
    }

    #[test]
    fn test_varint_overlong_is_corrupt() {
        let err = read_varint(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x01], &mut 0).unwrap_err();
        assert!(matches!(err, BusError::CorruptFrame(_)));
    }

    #[test]
    fn test_round_trip_framing_preserves_order_and_content() {
        let pool = BufferPool::new(64);
        let payload_big = vec![0xabu8; 2048];
        let messages: Vec<(u8, &[u8])> = vec![
            (1, b"first".as_slice()),
            (2, b"".as_slice()),
            (9, payload_big.as_slice()),
            (1, b"again".as_slice()),
        ];
        let frame = build_frame(&pool, &messages);
        let wire = frame.bytes().clone();

        let decoded = decode_frame(&pool, &wire);
        assert_eq!(decoded.len(), messages.len());
        for ((tag, payload), (decoded_tag, decoded_payload)) in
            messages.iter().zip(decoded.iter())
        {
            assert_eq!(tag, decoded_tag);
            assert_eq!(*payload, decoded_payload.as_slice());
        }
    }

    #[test]
    fn test_empty_batch_round_trips() {
        let pool = BufferPool::new(64);
        let frame = build_frame(&pool, &[]);
        let wire = frame.bytes().clone();
        assert!(decode_frame(&pool, &wire).is_empty());
    }

    #[test]
    fn test_single_message_frame() {
        // One sub-message, payload [0x01, 0x02], type tag 7.
        let pool = BufferPool::new(64);
        let frame = build_frame(&pool, &[(7, &[0x01, 0x02])]);
        let wire = frame.bytes().clone();

        let decoded = decode_frame(&pool, &wire);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].0, 7);
        assert_eq!(decoded[0].1, vec![0x01, 0x02]);
    }

    #[test]
    fn test_decode_grows_undersized_buffer() {
        let big_payload = vec![0x5au8; 4096];
        let frame_pool = BufferPool::new(64);
        let frame = build_frame(&frame_pool, &[(3, big_payload.as_slice())]);
        let wire = frame.bytes().clone();

        // A pool whose buffers start far smaller than the frame must still
        // decode it identically to an amply sized pool.
        let small_pool = BufferPool::new(8);
        let large_pool = BufferPool::new(64 * 1024);
        assert_eq!(decode_frame(&small_pool, &wire), decode_frame(&large_pool, &wire));
    }

    #[test]
    fn test_stream_end_while_expecting_prefix_is_transport_closed() {
        let pool = BufferPool::new(64);
        let handle = pool.checkout();
        let mut empty = Cursor::new(Vec::new());
        assert!(matches!(
            read_frame(&mut empty, &handle),
            Err(BusError::TransportClosed)
        ));
    }

    #[test]
    fn test_stream_end_mid_prefix_is_transport_closed() {
        let pool = BufferPool::new(64);
        let handle = pool.checkout();
        let mut short = Cursor::new(vec![0x10, 0x00]);
        assert!(matches!(
            read_frame(&mut short, &handle),
            Err(BusError::TransportClosed)
        ));
    }

    #[test]
    fn test_stream_end_mid_payload_is_transport_closed() {
        let pool = BufferPool::new(64);
        let handle = pool.checkout();
        // Prefix promises 16 bytes, stream holds 3.
        let mut wire = 16u32.to_le_bytes().to_vec();
        wire.extend_from_slice(&[0, 0, 0]);
        let mut cursor = Cursor::new(wire);
        assert!(matches!(
            read_frame(&mut cursor, &handle),
            Err(BusError::TransportClosed)
        ));
    }

    #[test]
    fn test_oversized_frame_is_corrupt() {
        let pool = BufferPool::new(64);
        let handle = pool.checkout();
        let mut wire = ((MAX_FRAME_BYTES + 1) as u32).to_le_bytes().to_vec();
        wire.extend_from_slice(&[0u8; 16]);
        let mut cursor = Cursor::new(wire);
        assert!(matches!(
            read_frame(&mut cursor, &handle),
            Err(BusError::CorruptFrame(_))
        ));
    }

    #[test]
    fn test_missing_tag_vector_is_corrupt() {
        let pool = BufferPool::new(64);
        let handle = pool.checkout();
        {
            // count = 1, one 2-byte blob, but no tag byte afterwards.
            let mut buf = handle.bytes();
            buf.extend_from_slice(&1u32.to_le_bytes());
            write_varint(&mut buf, 2);
            buf.extend_from_slice(&[0xde, 0xad]);
        }
        assert!(matches!(split_frame(&handle), Err(BusError::CorruptFrame(_))));
    }

    #[test]
    fn test_payload_overrun_is_corrupt() {
        let pool = BufferPool::new(64);
        let handle = pool.checkout();
        {
            // count = 1, blob claims 200 bytes but the frame ends early.
            let mut buf = handle.bytes();
            buf.extend_from_slice(&1u32.to_le_bytes());
            write_varint(&mut buf, 200);
            buf.extend_from_slice(&[0u8; 4]);
        }
        assert!(matches!(split_frame(&handle), Err(BusError::CorruptFrame(_))));
    }

    #[test]
    fn test_tokens_keep_frame_bytes_alive() {
        let pool = BufferPool::new(64);
        let frame = build_frame(&pool, &[(4, b"payload")]);
        let wire = frame.bytes().clone();
        drop(frame);

        let handle = pool.checkout();
        let mut cursor = Cursor::new(wire);
        read_frame(&mut cursor, &handle).unwrap();
        let tokens = split_frame(&handle).unwrap();
        drop(handle);

        // The reader's own handle is gone, but the token still pins the
        // buffer and reads its payload.
        assert_eq!(tokens[0].payload().unwrap(), b"payload");
    }
}
