//! Packet buffer with reserved headroom and tailroom.
//!
//! The engine encrypts in place: it prepends the protocol header and
//! appends padding/tags around the plaintext it receives from the
//! adapter. Storage is allocated once with margins on both sides so
//! that neither operation has to move or reallocate the payload.

use bytes::Bytes;
use thiserror::Error;

/// Bytes reserved in front of each outbound packet.
pub const HEADROOM: usize = 256;

/// Bytes reserved behind each outbound packet.
pub const TAILROOM: usize = 128;

/// Errors from in-place buffer edits.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    #[error("not enough headroom: need {needed}, have {available}")]
    NoHeadroom { needed: usize, available: usize },

    #[error("not enough tailroom: need {needed}, have {available}")]
    NoTailroom { needed: usize, available: usize },

    #[error("cannot consume {needed} bytes from a {available} byte payload")]
    Underflow { needed: usize, available: usize },
}

/// A single packet with fixed-size storage and a movable payload window.
#[derive(Clone)]
pub struct PacketBuffer {
    storage: Box<[u8]>,
    start: usize,
    end: usize,
}

impl PacketBuffer {
    /// Copy `payload` into a new buffer with the default margins.
    pub fn from_payload(payload: &[u8]) -> Self {
        Self::with_margins(payload, HEADROOM, TAILROOM)
    }

    /// Copy `payload` into a new buffer with explicit margins.
    pub fn with_margins(payload: &[u8], headroom: usize, tailroom: usize) -> Self {
        let mut storage = vec![0u8; headroom + payload.len() + tailroom].into_boxed_slice();
        storage[headroom..headroom + payload.len()].copy_from_slice(payload);
        Self {
            storage,
            start: headroom,
            end: headroom + payload.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Free bytes in front of the payload.
    pub fn headroom(&self) -> usize {
        self.start
    }

    /// Free bytes behind the payload.
    pub fn tailroom(&self) -> usize {
        self.storage.len() - self.end
    }

    /// Total storage size. Never changes after construction.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.end]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.end]
    }

    /// Write `header` directly in front of the payload.
    pub fn prepend(&mut self, header: &[u8]) -> Result<(), BufferError> {
        let dst = self.prepend_alloc(header.len())?;
        dst.copy_from_slice(header);
        Ok(())
    }

    /// Grow the payload window by `n` bytes at the front and return them.
    pub fn prepend_alloc(&mut self, n: usize) -> Result<&mut [u8], BufferError> {
        if n > self.start {
            return Err(BufferError::NoHeadroom {
                needed: n,
                available: self.start,
            });
        }
        self.start -= n;
        Ok(&mut self.storage[self.start..self.start + n])
    }

    /// Write `trailer` directly behind the payload.
    pub fn append(&mut self, trailer: &[u8]) -> Result<(), BufferError> {
        let available = self.tailroom();
        if trailer.len() > available {
            return Err(BufferError::NoTailroom {
                needed: trailer.len(),
                available,
            });
        }
        self.storage[self.end..self.end + trailer.len()].copy_from_slice(trailer);
        self.end += trailer.len();
        Ok(())
    }

    /// Drop `n` bytes from the front of the payload (header strip).
    pub fn advance(&mut self, n: usize) -> Result<(), BufferError> {
        if n > self.len() {
            return Err(BufferError::Underflow {
                needed: n,
                available: self.len(),
            });
        }
        self.start += n;
        Ok(())
    }

    /// Shorten the payload to `len` bytes. No-op if already shorter.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len() {
            self.end = self.start + len;
        }
    }

    /// Copy the current payload out as an immutable `Bytes`.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_slice())
    }
}

impl std::fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("len", &self.len())
            .field("headroom", &self.headroom())
            .field("tailroom", &self.tailroom())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENCRYPT_HEADER: usize = 25;
    const MAX_OVERHEAD: usize = 100;

    fn prepend_without_realloc(payload_len: usize) {
        let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
        let mut buf = PacketBuffer::from_payload(&payload);
        let capacity = buf.capacity();
        let base = buf.storage.as_ptr();

        buf.prepend(&[0xAB; MAX_OVERHEAD]).unwrap();

        assert_eq!(buf.capacity(), capacity);
        assert_eq!(buf.storage.as_ptr(), base);
        assert_eq!(buf.len(), payload_len + MAX_OVERHEAD);
        assert_eq!(buf.headroom(), HEADROOM - MAX_OVERHEAD);
        assert_eq!(&buf.as_slice()[..MAX_OVERHEAD], &[0xAB; MAX_OVERHEAD][..]);
        assert_eq!(&buf.as_slice()[MAX_OVERHEAD..], &payload[..]);
    }

    #[test]
    fn test_prepend_100_on_small_packet() {
        prepend_without_realloc(100);
    }

    #[test]
    fn test_prepend_100_on_mtu_packet() {
        prepend_without_realloc(1500);
    }

    #[test]
    fn test_header_then_trailer() {
        let mut buf = PacketBuffer::from_payload(&[1, 2, 3]);
        buf.prepend(&[0u8; ENCRYPT_HEADER]).unwrap();
        buf.append(&[9u8; 16]).unwrap();
        assert_eq!(buf.len(), ENCRYPT_HEADER + 3 + 16);
        assert_eq!(buf.tailroom(), TAILROOM - 16);

        buf.advance(ENCRYPT_HEADER).unwrap();
        buf.truncate(3);
        assert_eq!(buf.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_headroom_exhausted() {
        let mut buf = PacketBuffer::with_margins(&[1], 4, 0);
        assert_eq!(
            buf.prepend(&[0; 5]),
            Err(BufferError::NoHeadroom {
                needed: 5,
                available: 4
            })
        );
        assert!(buf.append(&[0]).is_err());
        assert!(buf.advance(2).is_err());
        assert_eq!(buf.as_slice(), &[1]);
    }
}
