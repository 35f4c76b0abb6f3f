//! Reply accumulation buffer.
//!
//! Subprocess stdout is collected here chunk by chunk until EOF. Storage
//! doubles when full and always keeps one spare byte holding a NUL
//! terminator, so the buffer can be handed to text scanning at any moment.

use std::borrow::Cow;

const INITIAL_CAPACITY: usize = 4096;

/// Growable byte buffer for the pending reply.
#[derive(Debug)]
pub struct ReplyBuffer {
    storage: Vec<u8>,
    len: usize,
    high_water: usize,
}

impl Default for ReplyBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyBuffer {
    /// Creates an empty buffer with the initial allocation.
    #[must_use]
    pub fn new() -> Self {
        Self {
            storage: vec![0; INITIAL_CAPACITY],
            len: 0,
            high_water: 0,
        }
    }

    /// Appends one chunk, doubling the allocation as often as needed.
    pub fn append(&mut self, chunk: &[u8]) {
        // One byte stays reserved for the trailing terminator.
        while self.len + chunk.len() + 1 > self.storage.len() {
            self.storage.resize(self.storage.len() * 2, 0);
        }
        self.storage[self.len..self.len + chunk.len()].copy_from_slice(chunk);
        self.len += chunk.len();
        self.storage[self.len] = 0;
        self.high_water = self.high_water.max(self.len);
    }

    /// Appends a formatted `ERROR` line, the shape used to fold post-launch
    /// failures into the reply.
    pub fn append_error_line(&mut self, message: &str) {
        self.append(format!("ERROR {message}\n").as_bytes());
    }

    /// Number of collected bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Largest fill level the buffer has reached.
    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.high_water
    }

    /// The collected bytes, without the terminator.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.storage[..self.len]
    }

    /// The collected text; invalid UTF-8 is replaced rather than dropped so
    /// a confused subprocess still produces a visible reply.
    #[must_use]
    pub fn as_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn appends_concatenate_losslessly() {
        let mut buffer = ReplyBuffer::new();
        buffer.append(b"CONNECT DATA 4");
        buffer.append(b"");
        buffer.append(b" MESG 5\n");
        assert_eq!(buffer.as_bytes(), b"CONNECT DATA 4 MESG 5\n");
        assert_eq!(buffer.len(), 22);
    }

    #[test]
    fn growth_doubles_and_keeps_the_terminator() {
        let mut buffer = ReplyBuffer::new();
        let chunk = vec![b'x'; INITIAL_CAPACITY];
        buffer.append(&chunk);
        assert_eq!(buffer.len(), INITIAL_CAPACITY);
        assert!(buffer.storage.len() >= INITIAL_CAPACITY * 2);
        assert_eq!(buffer.storage[buffer.len()], 0);
    }

    #[test]
    fn error_lines_fold_into_the_text() {
        let mut buffer = ReplyBuffer::new();
        buffer.append(b"partial output\n");
        buffer.append_error_line("reply pipe closed early");
        assert_eq!(
            buffer.as_text(),
            "partial output\nERROR reply pipe closed early\n"
        );
    }

    proptest! {
        #[test]
        fn arbitrary_chunk_sequences_round_trip(
            chunks in prop::collection::vec(
                prop::collection::vec(any::<u8>(), 0..600),
                0..30,
            ),
        ) {
            let mut buffer = ReplyBuffer::new();
            let mut expected = Vec::new();
            let mut last_high_water = 0;
            for chunk in &chunks {
                buffer.append(chunk);
                expected.extend_from_slice(chunk);
                prop_assert!(buffer.high_water_mark() >= last_high_water);
                last_high_water = buffer.high_water_mark();
            }
            prop_assert_eq!(buffer.as_bytes(), expected.as_slice());
            prop_assert_eq!(buffer.high_water_mark(), expected.len());
        }
    }
}
