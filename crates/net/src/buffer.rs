//! Growable byte queue used on both sides of a connection.
//!
//! Bytes are appended at the tail and consumed from the head. Consumed
//! prefixes are dropped in one go by [`WireBuffer::compact`] rather than by
//! shifting on every read.

use std::io::{self, Read, Write};

const READ_CHUNK: usize = 4096;

/// Result of pulling bytes from a reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ingress {
    /// Bytes appended by this call.
    pub received: usize,
    /// The reader reported end of stream.
    pub closed: bool,
    /// The reader has nothing more right now.
    pub drained: bool,
}

/// FIFO byte queue with a read cursor.
#[derive(Debug, Default, Clone)]
pub struct WireBuffer {
    data: Vec<u8>,
    head: usize,
}

impl WireBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    /// Whether every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unconsumed bytes.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Append bytes at the tail.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Tail of the buffer for encoders that append in place.
    pub(crate) fn tail(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Mark `count` bytes at the head as consumed.
    ///
    /// # Panics
    ///
    /// Panics when `count` exceeds [`WireBuffer::len`].
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.len(), "consumed past the end of the buffer");
        self.head += count;
        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        }
    }

    /// Drop the consumed prefix.
    pub fn compact(&mut self) {
        if self.head > 0 {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Read from `reader` until it would block, reports end of stream, or the
    /// buffer holds `limit` unconsumed bytes.
    pub fn ingress<R: Read>(&mut self, mut reader: R, limit: usize) -> io::Result<Ingress> {
        let mut outcome = Ingress::default();
        let mut chunk = [0u8; READ_CHUNK];

        while self.len() < limit {
            let want = READ_CHUNK.min(limit - self.len());
            match reader.read(&mut chunk[..want]) {
                Ok(0) => {
                    outcome.closed = true;
                    break;
                }
                Ok(count) => {
                    self.data.extend_from_slice(&chunk[..count]);
                    outcome.received += count;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    outcome.drained = true;
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(outcome)
    }

    /// Write unconsumed bytes to `writer` until done or it would block.
    /// Returns the number of bytes written; sent bytes are consumed.
    pub fn egress<W: Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut written = 0;

        while !self.is_empty() {
            match writer.write(self.unread()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.consume(count);
                    written += count;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        self.compact();
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader handing out scripted results one call at a time.
    struct Script(Vec<io::Result<Vec<u8>>>);

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let mut bytes = self.0.remove(0)?;
            if bytes.len() > buf.len() {
                let rest = bytes.split_off(buf.len());
                self.0.insert(0, Ok(rest));
            }
            buf[..bytes.len()].copy_from_slice(&bytes);
            Ok(bytes.len())
        }
    }

    /// Writer accepting at most `budget` bytes before blocking.
    struct Throttled {
        sink: Vec<u8>,
        budget: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let count = buf.len().min(self.budget).min(3);
            self.sink.extend_from_slice(&buf[..count]);
            self.budget -= count;
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn consume_then_compact_keeps_tail() {
        let mut buffer = WireBuffer::new();
        buffer.extend_from_slice(b"abcdef");
        buffer.consume(2);
        assert_eq!(buffer.unread(), b"cdef");
        buffer.compact();
        assert_eq!(buffer.unread(), b"cdef");
        buffer.consume(4);
        assert!(buffer.is_empty());
    }

    #[test]
    #[should_panic(expected = "consumed past the end")]
    fn over_consumption_panics() {
        let mut buffer = WireBuffer::new();
        buffer.extend_from_slice(b"ab");
        buffer.consume(3);
    }

    #[test]
    fn ingress_stops_when_reader_would_block() {
        let mut buffer = WireBuffer::new();
        let reader = Script(vec![Ok(b"ab".to_vec()), Ok(b"cd".to_vec())]);
        let outcome = buffer.ingress(reader, 1024).unwrap();
        assert_eq!(
            outcome,
            Ingress {
                received: 4,
                closed: false,
                drained: true
            }
        );
        assert_eq!(buffer.unread(), b"abcd");
    }

    #[test]
    fn ingress_reports_end_of_stream() {
        let mut buffer = WireBuffer::new();
        let reader = Script(vec![Ok(b"x".to_vec()), Ok(Vec::new())]);
        let outcome = buffer.ingress(reader, 1024).unwrap();
        assert!(outcome.closed);
        assert_eq!(outcome.received, 1);
    }

    #[test]
    fn ingress_respects_limit() {
        let mut buffer = WireBuffer::new();
        let reader = Script(vec![Ok(vec![1; 8]), Ok(vec![2; 8])]);
        let outcome = buffer.ingress(reader, 10).unwrap();
        assert_eq!(buffer.len(), 10);
        assert!(!outcome.drained);
        assert!(!outcome.closed);
    }

    #[test]
    fn egress_keeps_unsent_suffix() {
        let mut buffer = WireBuffer::new();
        buffer.extend_from_slice(b"0123456789");
        let mut writer = Throttled {
            sink: Vec::new(),
            budget: 7,
        };
        assert_eq!(buffer.egress(&mut writer).unwrap(), 7);
        assert_eq!(writer.sink, b"0123456");
        assert_eq!(buffer.unread(), b"789");
    }
}
