//! The ingest wire format: length-framed message pairs on a TCP stream.
//!
//! Message 1 is UTF-8 JSON metadata, message 2 the raw pixel payload of
//! exactly `rows * cols * 2` bytes (little-endian `u16`). Each message is
//! preceded by a little-endian `u32` byte length.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use tc_types::RawPixel;

/// Refuse messages larger than this (a 16 MPixel raw frame plus slack).
pub const MAX_MESSAGE_SIZE: usize = (16 * 2 + 1) * 1024 * 1024;

/// The per-frame metadata message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FrameMeta {
    pub frame: u64,
    /// `[rows, cols]`.
    pub shape: [usize; 2],
    pub image_attributes: ImageAttributes,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageAttributes {
    pub scan_index: i64,
}

/// Reads one length-framed message.
///
/// Returns `Ok(None)` when the stream idles past its read timeout before
/// the first header byte, or when `keep_going` turns false mid-message;
/// framing stays intact in the former case because nothing was consumed.
pub fn read_message(
    stream: &mut impl Read,
    keep_going: &dyn Fn() -> bool,
) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0_u8; 4];
    if !read_exact_retrying(stream, &mut header, keep_going)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("refusing {len} byte message"),
        ));
    }
    let mut payload = vec![0_u8; len];
    if !read_exact_retrying(stream, &mut payload, keep_going)? {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Like `read_exact`, but resumes after read-timeout errors so a socket
/// timeout never tears a message apart. Gives up and returns `Ok(false)`
/// if the stream idles before the first byte, or if `keep_going` turns
/// false.
fn read_exact_retrying(
    stream: &mut impl Read,
    buf: &mut [u8],
    keep_going: &dyn Fn() -> bool,
) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "data stream closed",
                ));
            }
            Ok(n) => filled += n,
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                if filled == 0 || !keep_going() {
                    return Ok(filled == buf.len());
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

pub fn write_message(stream: &mut impl Write, payload: &[u8]) -> io::Result<()> {
    stream.write_all(&u32::to_le_bytes(payload.len() as u32))?;
    stream.write_all(payload)
}

/// Writes a full metadata + pixel-data message pair.
pub fn write_frame(stream: &mut impl Write, meta: &FrameMeta, pixels: &[RawPixel]) -> io::Result<()> {
    let meta_json = serde_json::to_vec(meta).map_err(io::Error::other)?;
    write_message(stream, &meta_json)?;
    write_message(stream, bytemuck::cast_slice(pixels))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let mut wire = Vec::new();
        write_message(&mut wire, b"hello").unwrap();
        write_message(&mut wire, b"").unwrap();

        let mut reader = wire.as_slice();
        let keep_going = || true;
        assert_eq!(
            read_message(&mut reader, &keep_going).unwrap().unwrap(),
            b"hello"
        );
        assert_eq!(
            read_message(&mut reader, &keep_going).unwrap().unwrap(),
            b""
        );
    }

    #[test]
    fn test_frame_roundtrip() {
        let meta = FrameMeta {
            frame: 7,
            shape: [2, 3],
            image_attributes: ImageAttributes { scan_index: 2 },
        };
        let pixels: Vec<u16> = vec![1, 2, 3, 4, 5, 6];

        let mut wire = Vec::new();
        write_frame(&mut wire, &meta, &pixels).unwrap();

        let mut reader = wire.as_slice();
        let keep_going = || true;
        let meta_bytes = read_message(&mut reader, &keep_going).unwrap().unwrap();
        let parsed: FrameMeta = serde_json::from_slice(&meta_bytes).unwrap();
        assert_eq!(parsed.frame, 7);
        assert_eq!(parsed.shape, [2, 3]);
        assert_eq!(parsed.image_attributes.scan_index, 2);

        let payload = read_message(&mut reader, &keep_going).unwrap().unwrap();
        assert_eq!(payload.len(), 2 * 3 * 2);
        let decoded: Vec<u16> = payload
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(decoded, pixels);
    }

    #[test]
    fn test_oversized_message_is_refused() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&u32::to_le_bytes(u32::MAX));
        let keep_going = || true;
        assert!(read_message(&mut wire.as_slice(), &keep_going).is_err());
    }

    #[test]
    fn test_truncated_stream_is_an_error() {
        let mut wire = Vec::new();
        write_message(&mut wire, b"hello").unwrap();
        wire.truncate(wire.len() - 2);
        let keep_going = || true;
        assert!(read_message(&mut wire.as_slice(), &keep_going).is_err());
    }
}
