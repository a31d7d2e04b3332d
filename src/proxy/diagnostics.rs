use std::sync::{Mutex, PoisonError};

use bytes::{Bytes, BytesMut};

/// Accumulates bytes from the serial link that were not part of a frame - typically log output
///  of the device - until they are drained by whoever reports them
#[derive(Default)]
pub struct DiagnosticBuffer {
    buf: Mutex<BytesMut>,
}

impl DiagnosticBuffer {
    pub fn append(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.buf.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
    }

    /// Returns everything accumulated so far, clearing the buffer
    pub fn drain(&self) -> Bytes {
        self.buf.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .split()
            .freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_clears() {
        let buffer = DiagnosticBuffer::default();
        buffer.append(b"abc");
        buffer.append(b"");
        buffer.append(b"def\n");

        assert_eq!(buffer.drain().as_ref(), b"abcdef\n");
        assert!(buffer.drain().is_empty());

        buffer.append(b"x");
        assert_eq!(buffer.drain().as_ref(), b"x");
    }
}
