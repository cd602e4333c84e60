//! Line framing — cuts the TCP byte stream into JSON frames.
//!
//! Frames are terminated by `\r\n` (bare `\n` is tolerated on input) and
//! capped at [`MAX_FRAME`] bytes including the terminator. The decoder only
//! segments; JSON parsing and validation happen in [`super::message`].
//! An oversized frame is discarded and surfaces as [`RawFrame::Oversize`] so
//! the session can answer with a schema error and keep reading.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::Frame;

/// Maximum frame size including the terminator.
pub const MAX_FRAME: usize = 1024;

/// Maximum line content before the `\r\n`.
const MAX_LINE: usize = MAX_FRAME - 2;

/// Codec error: an unencodable outbound frame or an I/O failure.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame exceeds maximum length ({MAX_FRAME} bytes)")]
    FrameTooLong,
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One decoded unit: a raw line to hand to the JSON parser, or the marker
/// for a frame that blew the size cap and was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Line(Vec<u8>),
    Oversize,
}

/// Frames inbound bytes on `\r?\n` boundaries and encodes outbound frames
/// as compact JSON plus `\r\n`.
#[derive(Debug, Default)]
pub struct LineCodec {
    // Set after an unterminated over-limit read; input is dropped until the
    // next terminator so the stream re-synchronizes.
    discarding: bool,
}

impl Decoder for LineCodec {
    type Item = RawFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, CodecError> {
        loop {
            if self.discarding {
                match src.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        src.advance(pos + 1);
                        self.discarding = false;
                    }
                    None => {
                        src.clear();
                        return Ok(None);
                    }
                }
                continue;
            }

            let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                // A complete frame may still hold MAX_LINE bytes plus `\r`.
                if src.len() > MAX_LINE + 1 {
                    src.clear();
                    self.discarding = true;
                    return Ok(Some(RawFrame::Oversize));
                }
                return Ok(None);
            };

            let mut line = src.split_to(pos);
            src.advance(1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.is_empty() {
                // Empty frames (`\r\n\r\n`) are dropped silently.
                continue;
            }
            if line.len() > MAX_LINE {
                return Ok(Some(RawFrame::Oversize));
            }
            return Ok(Some(RawFrame::Line(line.to_vec())));
        }
    }
}

impl Encoder<Frame> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let wire = item.to_json()?;
        if wire.len() + 2 > MAX_FRAME {
            return Err(CodecError::FrameTooLong);
        }
        dst.reserve(wire.len() + 2);
        dst.put_slice(wire.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
