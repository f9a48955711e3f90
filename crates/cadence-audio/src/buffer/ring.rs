//! Byte ring buffer for audio streaming.
//!
//! The buffer sits between a producer (`AudioStream::add_data`) and a single
//! consumer (the output pull loop). It does no locking of its own: every
//! method that moves a cursor takes `&mut self`, so the only way to share one
//! is behind the owning stream's mutex.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

/// Fixed-capacity circular byte store.
///
/// Invariant: `write_size() + read_size() == capacity()`.
pub struct RingBuffer {
    /// The underlying buffer storage.
    buffer: Box<[u8]>,
    /// Index of the next byte to read.
    read_pos: usize,
    /// Index of the next byte to write.
    write_pos: usize,
    /// Bytes currently stored.
    len: usize,
}

impl RingBuffer {
    /// Create a new ring buffer holding exactly `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
            len: 0,
        }
    }

    /// Get the buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes available for reading.
    pub const fn read_size(&self) -> usize {
        self.len
    }

    /// Bytes that can be written without overwriting unread data.
    pub fn write_size(&self) -> usize {
        self.capacity() - self.len
    }

    /// Check if the buffer is empty.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check if the buffer is full.
    pub fn is_full(&self) -> bool {
        self.write_size() == 0
    }

    /// Write bytes to the buffer.
    ///
    /// Returns the number of bytes actually written, which is less than
    /// `data.len()` only when the buffer fills up.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let to_write = data.len().min(self.write_size());
        if to_write == 0 {
            return 0;
        }

        let capacity = self.capacity();
        let first_chunk = to_write.min(capacity - self.write_pos);
        self.buffer[self.write_pos..self.write_pos + first_chunk]
            .copy_from_slice(&data[..first_chunk]);

        // Wrap-around write
        let rest = to_write - first_chunk;
        if rest > 0 {
            self.buffer[..rest].copy_from_slice(&data[first_chunk..to_write]);
        }

        self.write_pos = (self.write_pos + to_write) % capacity;
        self.len += to_write;
        to_write
    }

    /// Read bytes from the buffer.
    ///
    /// Returns the number of bytes actually read.
    pub fn read(&mut self, output: &mut [u8]) -> usize {
        let read = self.peek(output);
        self.advance_read(read);
        read
    }

    /// Read bytes without advancing the read position.
    pub fn peek(&self, output: &mut [u8]) -> usize {
        let to_read = output.len().min(self.len);
        if to_read == 0 {
            return 0;
        }

        let first_chunk = to_read.min(self.capacity() - self.read_pos);
        output[..first_chunk]
            .copy_from_slice(&self.buffer[self.read_pos..self.read_pos + first_chunk]);

        let rest = to_read - first_chunk;
        if rest > 0 {
            output[first_chunk..to_read].copy_from_slice(&self.buffer[..rest]);
        }

        to_read
    }

    /// Skip bytes without reading them.
    pub fn skip(&mut self, count: usize) -> usize {
        let to_skip = count.min(self.len);
        self.advance_read(to_skip);
        to_skip
    }

    /// Drop all buffered data and rewind both cursors.
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.len = 0;
    }

    fn advance_read(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        self.read_pos = (self.read_pos + count) % self.capacity();
        self.len -= count;
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("read_size", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_basic_write_read() {
        let mut buffer = RingBuffer::new(1024);

        let data = [1u8, 2, 3, 4, 5];
        assert_eq!(buffer.write(&data), 5);
        assert_eq!(buffer.read_size(), 5);

        let mut output = [0u8; 5];
        assert_eq!(buffer.read(&mut output), 5);
        assert_eq!(output, data);
        assert_eq!(buffer.read_size(), 0);
    }

    #[test]
    fn test_capacity_is_exact() {
        let buffer = RingBuffer::new(8 * 44100);
        assert_eq!(buffer.capacity(), 352_800);
        assert_eq!(buffer.write_size(), 352_800);
    }

    #[test]
    fn test_wraparound() {
        let mut buffer = RingBuffer::new(10);

        assert_eq!(buffer.write(&[1u8; 6]), 6);

        let mut output = [0u8; 4];
        assert_eq!(buffer.read(&mut output), 4);

        // Should wrap around
        assert_eq!(buffer.write(&[2u8; 7]), 7);
        assert!(buffer.is_full());

        let mut final_output = [0u8; 9];
        assert_eq!(buffer.read(&mut final_output), 9);
        assert_eq!(&final_output[0..2], &[1, 1]);
        assert_eq!(&final_output[2..9], &[2; 7]);
    }

    #[test]
    fn test_full_buffer() {
        let mut buffer = RingBuffer::new(4);

        assert_eq!(buffer.write(&[1u8; 4]), 4);
        assert!(buffer.is_full());
        assert_eq!(buffer.write(&[2]), 0);

        let mut output = [0u8; 1];
        buffer.read(&mut output);
        assert_eq!(buffer.write(&[2]), 1);
    }

    #[test]
    fn test_peek() {
        let mut buffer = RingBuffer::new(16);

        let data = [1u8, 2, 3];
        buffer.write(&data);

        let mut peeked = [0u8; 3];
        assert_eq!(buffer.peek(&mut peeked), 3);
        assert_eq!(peeked, data);
        assert_eq!(buffer.read_size(), 3);

        let mut output = [0u8; 3];
        assert_eq!(buffer.read(&mut output), 3);
        assert_eq!(output, data);
    }

    #[test]
    fn test_skip() {
        let mut buffer = RingBuffer::new(16);
        buffer.write(&[1u8, 2, 3, 4, 5]);

        assert_eq!(buffer.skip(2), 2);
        assert_eq!(buffer.read_size(), 3);

        let mut output = [0u8; 3];
        buffer.read(&mut output);
        assert_eq!(output, [3, 4, 5]);
    }

    #[test]
    fn test_reset() {
        let mut buffer = RingBuffer::new(16);
        buffer.write(&[1u8; 10]);
        assert_eq!(buffer.read_size(), 10);

        buffer.reset();
        assert!(buffer.is_empty());
        assert_eq!(buffer.write_size(), 16);
    }

    #[test]
    fn test_zero_capacity() {
        let mut buffer = RingBuffer::new(0);
        assert_eq!(buffer.write(&[1, 2]), 0);
        let mut output = [0u8; 2];
        assert_eq!(buffer.read(&mut output), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(usize),
        Read(usize),
        Skip(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..64).prop_map(Op::Write),
            (0usize..64).prop_map(Op::Read),
            (0usize..16).prop_map(Op::Skip),
        ]
    }

    proptest! {
        #[test]
        fn prop_sizes_always_sum_to_capacity(capacity in 1usize..200, ops in prop::collection::vec(op(), 0..64)) {
            let mut buffer = RingBuffer::new(capacity);
            let mut expected = std::collections::VecDeque::new();
            let mut next = 0u8;

            for op in ops {
                match op {
                    Op::Write(n) => {
                        let data: Vec<u8> = (0..n).map(|_| { next = next.wrapping_add(1); next }).collect();
                        let written = buffer.write(&data);
                        expected.extend(&data[..written]);
                    }
                    Op::Read(n) => {
                        let mut out = vec![0u8; n];
                        let read = buffer.read(&mut out);
                        let want: Vec<u8> = expected.drain(..read).collect();
                        prop_assert_eq!(&out[..read], &want[..]);
                    }
                    Op::Skip(n) => {
                        let skipped = buffer.skip(n);
                        expected.drain(..skipped);
                    }
                }
                prop_assert_eq!(buffer.read_size() + buffer.write_size(), capacity);
                prop_assert_eq!(buffer.read_size(), expected.len());
            }
        }
    }
}
