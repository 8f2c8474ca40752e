//! Job attach frame protocol.
//!
//! An attached job's output arrives as a sequence of frames:
//!
//! ```text
//! +--------+----------------+-------------------+
//! | type:1 | length:4 (BE)  | payload:length    |
//! +--------+----------------+-------------------+
//! ```
//!
//! | type | payload                          |
//! |------|----------------------------------|
//! | 1    | stdout bytes                     |
//! | 2    | stderr bytes                     |
//! | 3    | exit status, 4 bytes big-endian  |
//! | 4    | error message, UTF-8             |

use crate::error::ClientError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const FRAME_STDOUT: u8 = 1;
const FRAME_STDERR: u8 = 2;
const FRAME_EXIT: u8 = 3;
const FRAME_ERROR: u8 = 4;

/// Type byte plus length prefix
pub const FRAME_HEADER_LEN: usize = 5;

/// Largest payload accepted in a single frame (16MB)
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachFrame {
    Stdout(Bytes),
    Stderr(Bytes),
    Exit(i32),
    Error(String),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AttachCodec;

impl Decoder for AttachCodec {
    type Item = AttachFrame;
    type Error = ClientError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let kind = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ClientError::Protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                len, MAX_FRAME_LEN
            )));
        }

        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(len).freeze();

        let frame = match kind {
            FRAME_STDOUT => AttachFrame::Stdout(payload),
            FRAME_STDERR => AttachFrame::Stderr(payload),
            FRAME_EXIT => {
                let status: [u8; 4] = payload.as_ref().try_into().map_err(|_| {
                    ClientError::Protocol(format!("exit frame with {} byte payload", payload.len()))
                })?;
                AttachFrame::Exit(i32::from_be_bytes(status))
            }
            FRAME_ERROR => AttachFrame::Error(String::from_utf8_lossy(&payload).into_owned()),
            other => {
                return Err(ClientError::Protocol(format!("unknown frame type {}", other)));
            }
        };

        Ok(Some(frame))
    }
}

impl Encoder<AttachFrame> for AttachCodec {
    type Error = ClientError;

    fn encode(&mut self, frame: AttachFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (kind, payload) = match frame {
            AttachFrame::Stdout(data) => (FRAME_STDOUT, data),
            AttachFrame::Stderr(data) => (FRAME_STDERR, data),
            AttachFrame::Exit(status) => (FRAME_EXIT, Bytes::copy_from_slice(&status.to_be_bytes())),
            AttachFrame::Error(msg) => (FRAME_ERROR, Bytes::from(msg)),
        };

        if payload.len() > MAX_FRAME_LEN {
            return Err(ClientError::Protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                payload.len(),
                MAX_FRAME_LEN
            )));
        }

        dst.reserve(FRAME_HEADER_LEN + payload.len());
        dst.put_u8(kind);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

/// Encode a sequence of frames into one buffer.
pub fn encode_frames<I>(frames: I) -> Result<Bytes, ClientError>
where
    I: IntoIterator<Item = AttachFrame>,
{
    let mut codec = AttachCodec;
    let mut buf = BytesMut::new();
    for frame in frames {
        codec.encode(frame, &mut buf)?;
    }
    Ok(buf.freeze())
}
