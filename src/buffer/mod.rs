//! Byte buffer and byte-order primitives.
//!
//! The buffer is the unit of accumulation for the framing codec: the decoder
//! appends raw network deliveries at the write cursor and consumes whole
//! frames at the read cursor, peeking length prefixes before committing.

mod byte_buf;
mod byte_order;

pub use byte_buf::ByteBuf;
pub use byte_order::ByteOrder;
