//! Growable byte buffer with independent read and write cursors.
//!
//! A [`ByteBuf`] owns a byte region and two cursors with the invariant
//! `reader_index <= writer_index <= capacity` under disciplined use. Write
//! operations grow the storage on demand (capacity never shrinks); read
//! operations advance the read cursor while `get_*` peeks the same value
//! without advancing. The peek/consume split is what lets a framing decoder
//! look at a length prefix before committing to consume the frame.
//!
//! Accessing bytes beyond the physical storage is a bounds fault and panics;
//! callers are expected to check [`ByteBuf::readable_bytes`] against the
//! needed length before every composite read.

use super::ByteOrder;

/// Minimum granted capacity when growing.
const MIN_GROWTH: usize = 64;

/// Capacity ceiling, matching a 32-bit signed length field.
const MAX_CAPACITY: usize = i32::MAX as usize;

/// Growable byte storage with explicit read/write cursors, parameterized by
/// a byte-order strategy fixed at construction.
#[derive(Debug)]
pub struct ByteBuf {
    data: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
    order: ByteOrder,
}

impl ByteBuf {
    /// Create a buffer with a zeroed region of `capacity` bytes and both
    /// cursors at zero.
    pub fn new(capacity: usize, order: ByteOrder) -> Self {
        Self {
            data: vec![0u8; capacity],
            reader_index: 0,
            writer_index: 0,
            order,
        }
    }

    /// Current physical capacity.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Byte order fixed at construction.
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// Read cursor position.
    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    /// Write cursor position.
    pub fn writer_index(&self) -> usize {
        self.writer_index
    }

    /// Bytes written but not yet read.
    pub fn readable_bytes(&self) -> usize {
        self.writer_index.saturating_sub(self.reader_index)
    }

    /// Bytes writable before the storage must grow.
    pub fn writable_bytes(&self) -> usize {
        self.capacity() - self.writer_index
    }

    /// Write a signed 32-bit integer in the buffer's byte order.
    pub fn write_i32(&mut self, value: i32) {
        self.ensure_writable(4);
        self.order.put_u32(&mut self.data, self.writer_index, value as u32);
        self.writer_index += 4;
    }

    /// Write a signed 64-bit integer in the buffer's byte order.
    pub fn write_i64(&mut self, value: i64) {
        self.ensure_writable(8);
        self.order.put_u64(&mut self.data, self.writer_index, value as u64);
        self.writer_index += 8;
    }

    /// Write an IEEE-754 single-precision float.
    pub fn write_f32(&mut self, value: f32) {
        self.ensure_writable(4);
        self.order
            .put_u32(&mut self.data, self.writer_index, value.to_bits());
        self.writer_index += 4;
    }

    /// Write an IEEE-754 double-precision float.
    pub fn write_f64(&mut self, value: f64) {
        self.ensure_writable(8);
        self.order
            .put_u64(&mut self.data, self.writer_index, value.to_bits());
        self.writer_index += 8;
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.ensure_writable(1);
        self.data[self.writer_index] = value;
        self.writer_index += 1;
    }

    /// Write a bool as a single byte (1 = true, 0 = false).
    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(u8::from(value));
    }

    /// Append a byte slice.
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.ensure_writable(value.len());
        self.data[self.writer_index..self.writer_index + value.len()].copy_from_slice(value);
        self.writer_index += value.len();
    }

    /// Append another buffer's readable region without consuming it.
    pub fn write_buf(&mut self, other: &ByteBuf) {
        self.write_bytes(other.peek_readable());
    }

    /// Read a signed 32-bit integer, advancing the read cursor.
    ///
    /// # Panics
    /// Panics if fewer than 4 bytes of storage remain at the read cursor.
    pub fn read_i32(&mut self) -> i32 {
        let value = self.get_i32();
        self.reader_index += 4;
        value
    }

    /// Read an unsigned 32-bit integer, advancing the read cursor.
    ///
    /// # Panics
    /// Panics if fewer than 4 bytes of storage remain at the read cursor.
    pub fn read_u32(&mut self) -> u32 {
        let value = self.get_u32();
        self.reader_index += 4;
        value
    }

    /// Read a signed 64-bit integer, advancing the read cursor.
    ///
    /// # Panics
    /// Panics if fewer than 8 bytes of storage remain at the read cursor.
    pub fn read_i64(&mut self) -> i64 {
        let value = self.get_i64();
        self.reader_index += 8;
        value
    }

    /// Read an unsigned 64-bit integer, advancing the read cursor.
    ///
    /// # Panics
    /// Panics if fewer than 8 bytes of storage remain at the read cursor.
    pub fn read_u64(&mut self) -> u64 {
        let value = self.get_u64();
        self.reader_index += 8;
        value
    }

    /// Read a single-precision float, advancing the read cursor.
    ///
    /// # Panics
    /// Panics if fewer than 4 bytes of storage remain at the read cursor.
    pub fn read_f32(&mut self) -> f32 {
        f32::from_bits(self.read_u32())
    }

    /// Read a double-precision float, advancing the read cursor.
    ///
    /// # Panics
    /// Panics if fewer than 8 bytes of storage remain at the read cursor.
    pub fn read_f64(&mut self) -> f64 {
        f64::from_bits(self.read_u64())
    }

    /// Read a single byte, advancing the read cursor.
    ///
    /// # Panics
    /// Panics if the read cursor is at or past the end of storage.
    pub fn read_u8(&mut self) -> u8 {
        let value = self.get_u8();
        self.reader_index += 1;
        value
    }

    /// Read a bool, advancing the read cursor.
    ///
    /// # Panics
    /// Panics if the read cursor is at or past the end of storage.
    pub fn read_bool(&mut self) -> bool {
        self.read_u8() == 1
    }

    /// Read `len` bytes into an owned vector, advancing the read cursor.
    ///
    /// # Panics
    /// Panics if fewer than `len` bytes of storage remain at the read cursor.
    pub fn read_bytes(&mut self, len: usize) -> Vec<u8> {
        let value = self.data[self.reader_index..self.reader_index + len].to_vec();
        self.reader_index += len;
        value
    }

    /// Peek a single byte at the read cursor without advancing.
    ///
    /// # Panics
    /// Panics if the read cursor is at or past the end of storage.
    pub fn get_u8(&self) -> u8 {
        self.data[self.reader_index]
    }

    /// Peek a signed 32-bit integer at the read cursor without advancing.
    ///
    /// # Panics
    /// Panics if fewer than 4 bytes of storage remain at the read cursor.
    pub fn get_i32(&self) -> i32 {
        self.get_u32() as i32
    }

    /// Peek an unsigned 32-bit integer at the read cursor without advancing.
    ///
    /// # Panics
    /// Panics if fewer than 4 bytes of storage remain at the read cursor.
    pub fn get_u32(&self) -> u32 {
        self.order.get_u32(&self.data, self.reader_index)
    }

    /// Peek a signed 64-bit integer at the read cursor without advancing.
    ///
    /// # Panics
    /// Panics if fewer than 8 bytes of storage remain at the read cursor.
    pub fn get_i64(&self) -> i64 {
        self.get_u64() as i64
    }

    /// Peek an unsigned 64-bit integer at the read cursor without advancing.
    ///
    /// # Panics
    /// Panics if fewer than 8 bytes of storage remain at the read cursor.
    pub fn get_u64(&self) -> u64 {
        self.order.get_u64(&self.data, self.reader_index)
    }

    /// The readable region as a slice, without consuming it.
    pub fn peek_readable(&self) -> &[u8] {
        &self.data[self.reader_index..self.writer_index]
    }

    /// Advance the read cursor by `len`, clamped to the capacity. Overrunning
    /// the readable region is tolerated rather than rejected.
    pub fn skip_bytes(&mut self, len: usize) {
        self.reader_index = (self.reader_index + len).min(self.capacity());
    }

    /// Zero both cursors. Any unread data is silently discarded.
    pub fn reset(&mut self) {
        self.reader_index = 0;
        self.writer_index = 0;
    }

    /// Grow storage so at least `min_writable` bytes can be written.
    ///
    /// New capacity is the smallest power of two >= 64 that covers
    /// `writer_index + min_writable`, clamped to `i32::MAX`. Previously
    /// written bytes are preserved.
    fn ensure_writable(&mut self, min_writable: usize) {
        if min_writable <= self.writable_bytes() {
            return;
        }
        let required = self.writer_index + min_writable;
        let mut new_capacity = MIN_GROWTH;
        while new_capacity < required && new_capacity < MAX_CAPACITY {
            new_capacity <<= 1;
        }
        self.data.resize(new_capacity.min(MAX_CAPACITY), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip_both_orders() {
        for order in [ByteOrder::BigEndian, ByteOrder::LittleEndian] {
            let mut buf = ByteBuf::new(16, order);

            buf.write_i32(-123_456);
            buf.write_i64(0x0123_4567_89AB_CDEF_i64);
            buf.write_f32(3.5);
            buf.write_f64(-2.25);
            buf.write_bool(true);
            buf.write_bool(false);
            buf.write_u8(0xA5);
            buf.write_bytes(b"abc");

            assert_eq!(buf.read_i32(), -123_456);
            assert_eq!(buf.read_i64(), 0x0123_4567_89AB_CDEF_i64);
            assert_eq!(buf.read_f32(), 3.5);
            assert_eq!(buf.read_f64(), -2.25);
            assert!(buf.read_bool());
            assert!(!buf.read_bool());
            assert_eq!(buf.read_u8(), 0xA5);
            assert_eq!(buf.read_bytes(3), b"abc");
            assert_eq!(buf.readable_bytes(), 0);
        }
    }

    #[test]
    fn test_get_peeks_without_advancing() {
        let mut buf = ByteBuf::new(16, ByteOrder::BigEndian);
        buf.write_i32(42);

        assert_eq!(buf.get_i32(), 42);
        assert_eq!(buf.get_u32(), 42);
        assert_eq!(buf.reader_index(), 0);
        assert_eq!(buf.read_i32(), 42);
        assert_eq!(buf.reader_index(), 4);
    }

    #[test]
    fn test_growth_is_power_of_two_and_preserves_data() {
        let mut buf = ByteBuf::new(4, ByteOrder::BigEndian);
        let payload: Vec<u8> = (0..100u8).collect();

        buf.write_bytes(&payload);
        // Smallest power of two >= 64 covering 100 bytes.
        assert_eq!(buf.capacity(), 128);
        assert_eq!(buf.read_bytes(100), payload);

        buf.write_bytes(&[0u8; 200]);
        assert_eq!(buf.capacity(), 512);
    }

    #[test]
    fn test_growth_floor_is_64() {
        let mut buf = ByteBuf::new(2, ByteOrder::LittleEndian);
        buf.write_i32(7);
        assert_eq!(buf.capacity(), 64);
        assert_eq!(buf.read_i32(), 7);
    }

    #[test]
    fn test_skip_bytes_clamps_to_capacity() {
        let mut buf = ByteBuf::new(64, ByteOrder::BigEndian);
        buf.write_bytes(b"hello");

        buf.skip_bytes(1_000);
        assert_eq!(buf.reader_index(), 64);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_reset_zeroes_cursors() {
        let mut buf = ByteBuf::new(16, ByteOrder::BigEndian);
        buf.write_i32(1);
        buf.read_u8();

        buf.reset();
        assert_eq!(buf.reader_index(), 0);
        assert_eq!(buf.writer_index(), 0);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn test_write_buf_copies_readable_region() {
        let mut src = ByteBuf::new(16, ByteOrder::BigEndian);
        src.write_bytes(b"xyz");
        src.read_u8(); // leave "yz" readable

        let mut dst = ByteBuf::new(16, ByteOrder::BigEndian);
        dst.write_buf(&src);

        assert_eq!(dst.read_bytes(2), b"yz");
        // Source cursors untouched.
        assert_eq!(src.readable_bytes(), 2);
    }
}
