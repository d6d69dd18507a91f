//! Length-prefixed command framing.
//!
//! Wire format, all multi-byte fields big-endian:
//!
//! ```text
//! +--------------+------------------+------------+---------------+
//! | frame len L  | command          | request id | content       |
//! |   4 bytes    | 32 bytes, ASCII, |  4 bytes   | L - 36 bytes  |
//! |              | NUL-padded       |  signed    |               |
//! +--------------+------------------+------------+---------------+
//! ```
//!
//! `L` counts everything after the length field, so a full frame occupies
//! `L + 4` bytes on the wire. The decoder peeks the length prefix without
//! consuming it, so a short read never desynchronizes the cursor: frame
//! boundaries survive TCP's partial and coalesced delivery.

use crate::buffer::{ByteBuf, ByteOrder};
use crate::pipeline::{HandlerContext, InboundHandler, Message, RawBytes};
use thiserror::Error;
use tracing::warn;

/// Width of the frame length prefix.
const LENGTH_FIELD_LEN: usize = 4;
/// Width of the fixed command field.
const COMMAND_FIELD_LEN: usize = 32;
/// Command field plus request id; the part of `L` that is not content.
const FRAME_HEADER_LEN: usize = COMMAND_FIELD_LEN + 4;

/// Initial capacity of the lazily allocated accumulation buffer.
const ACCUM_INITIAL_CAPACITY: usize = 64;

/// Default ceiling for the frame length field.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Framing errors. Any of these means the stream can no longer be trusted
/// and the connection should close.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The length field is smaller than the 36-byte frame header.
    #[error("frame length {0} is shorter than the {FRAME_HEADER_LEN}-byte frame header")]
    LengthTooShort(u32),
    /// The length field exceeds the configured maximum.
    #[error("frame length {len} exceeds maximum {max}")]
    FrameTooLarge { len: u32, max: u32 },
    /// The command field is not valid text.
    #[error("command field is not valid UTF-8 text")]
    InvalidCommand,
    /// A command longer than the fixed command field was given to the encoder.
    #[error("command is {len} bytes, longer than the {COMMAND_FIELD_LEN}-byte command field")]
    CommandTooLong { len: usize },
    /// Content too large for the 32-bit length field.
    #[error("content of {0} bytes does not fit the 32-bit length field")]
    ContentTooLarge(usize),
}

/// One decoded frame: a command, a request id, and opaque content. Carries
/// no identity beyond a single delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub command: String,
    pub request_id: i32,
    pub content: Vec<u8>,
}

/// A framing scheme: called with the accumulated inbound bytes, it appends
/// any complete messages to `out` and leaves partial frames unconsumed.
///
/// Implementations may decode at most one message per call; the hosting
/// [`ByteToMessage`] handler re-invokes until no further progress is made.
pub trait Decoder: 'static {
    fn decode(
        &mut self,
        ctx: &mut HandlerContext<'_>,
        input: &mut ByteBuf,
        out: &mut Vec<Message>,
    ) -> Result<(), CodecError>;
}

/// Decoder for the command frame wire format above.
pub struct CommandDecoder {
    max_frame_len: u32,
}

impl CommandDecoder {
    pub fn new(max_frame_len: u32) -> Self {
        Self { max_frame_len }
    }
}

impl Default for CommandDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for CommandDecoder {
    fn decode(
        &mut self,
        _ctx: &mut HandlerContext<'_>,
        input: &mut ByteBuf,
        out: &mut Vec<Message>,
    ) -> Result<(), CodecError> {
        if input.readable_bytes() < LENGTH_FIELD_LEN {
            return Ok(());
        }

        // Peek the length prefix; it stays unconsumed until the whole frame
        // is present.
        let frame_len = input.get_u32();
        if (frame_len as usize) < FRAME_HEADER_LEN {
            return Err(CodecError::LengthTooShort(frame_len));
        }
        if frame_len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len: frame_len,
                max: self.max_frame_len,
            });
        }
        if input.readable_bytes() < frame_len as usize + LENGTH_FIELD_LEN {
            return Ok(());
        }

        input.skip_bytes(LENGTH_FIELD_LEN);
        let raw_command = input.read_bytes(COMMAND_FIELD_LEN);
        let command = std::str::from_utf8(&raw_command)
            .map_err(|_| CodecError::InvalidCommand)?
            .trim_matches('\0')
            .to_string();
        let request_id = input.read_i32();
        let content = input.read_bytes(frame_len as usize - FRAME_HEADER_LEN);

        out.push(Box::new(CommandFrame {
            command,
            request_id,
            content,
        }));
        Ok(())
    }
}

/// Encode one frame in the command frame wire format.
pub fn encode_command(
    command: &str,
    request_id: i32,
    content: &[u8],
) -> Result<Vec<u8>, CodecError> {
    if command.len() > COMMAND_FIELD_LEN {
        return Err(CodecError::CommandTooLong {
            len: command.len(),
        });
    }
    let frame_len = FRAME_HEADER_LEN + content.len();
    if frame_len > u32::MAX as usize {
        return Err(CodecError::ContentTooLarge(content.len()));
    }

    let mut buf = ByteBuf::new(
        LENGTH_FIELD_LEN + frame_len,
        ByteOrder::BigEndian,
    );
    buf.write_i32(frame_len as i32);
    let mut padded = [0u8; COMMAND_FIELD_LEN];
    padded[..command.len()].copy_from_slice(command.as_bytes());
    buf.write_bytes(&padded);
    buf.write_i32(request_id);
    buf.write_bytes(content);

    let readable = buf.readable_bytes();
    Ok(buf.read_bytes(readable))
}

/// Inbound handler that accumulates raw byte deliveries and replaces them
/// with decoded messages for the rest of the chain.
///
/// The accumulation buffer is big-endian and allocated lazily on the first
/// delivery. The output list is drained, not reallocated, after each batch,
/// so downstream handlers must fully consume a batch before the next one.
/// A decode error closes the connection; messages decoded before the error
/// are still delivered.
pub struct ByteToMessage {
    decoder: Box<dyn Decoder>,
    buf: Option<ByteBuf>,
    out: Vec<Message>,
}

impl ByteToMessage {
    pub fn new(decoder: Box<dyn Decoder>) -> Self {
        Self {
            decoder,
            buf: None,
            out: Vec::new(),
        }
    }

    /// Cursor positions of the accumulation buffer, if it exists yet.
    pub fn accumulation_cursors(&self) -> Option<(usize, usize)> {
        self.buf
            .as_ref()
            .map(|b| (b.reader_index(), b.writer_index()))
    }
}

impl InboundHandler for ByteToMessage {
    fn on_read(&mut self, ctx: &mut HandlerContext<'_>, msg: Message) {
        let raw = match msg.downcast::<RawBytes>() {
            Ok(raw) => *raw,
            Err(other) => {
                ctx.fire_read(other);
                return;
            }
        };

        let buf = self
            .buf
            .get_or_insert_with(|| ByteBuf::new(ACCUM_INITIAL_CAPACITY, ByteOrder::BigEndian));
        buf.write_bytes(&raw.0);

        loop {
            let readable_before = buf.readable_bytes();
            let produced_before = self.out.len();
            if let Err(e) = self.decoder.decode(ctx, buf, &mut self.out) {
                warn!(
                    peer = %ctx.conn().peer_addr(),
                    error = %e,
                    "frame decode failed, closing connection"
                );
                ctx.conn().close();
                break;
            }
            let stalled =
                buf.readable_bytes() == readable_before && self.out.len() == produced_before;
            if stalled || buf.readable_bytes() == 0 {
                break;
            }
        }

        for decoded in self.out.drain(..) {
            ctx.fire_read(decoded);
        }

        if let Some(buf) = &mut self.buf {
            if buf.readable_bytes() == 0 {
                buf.reset();
            }
        }
    }
}
