//! Output buffer with reserve/commit transactions.
//!
//! Single messages are appended with [`OutBuf::push`]. Responses that must
//! reach the client together are built in a [`Reservation`]: a scratch region
//! sized up front, committed to the buffer in one piece or dropped without a
//! trace.

use std::io::{ErrorKind, Write};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, WireError};
use crate::header::{align_size, Header};

/// Default capacity of the output buffer.
pub const DEFAULT_CAPACITY: usize = 16 * 1024 + 1024;

/// Capacity limit for an [`OutBuf`].
#[derive(Debug, Clone)]
pub struct OutBufConfig {
    pub capacity: usize,
}

impl Default for OutBufConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Bytes needed on the wire for a message with a `payload_len` byte payload.
pub fn message_len(header: &Header, payload_len: usize) -> usize {
    let aligned = align_size(payload_len);
    let sized = Header {
        payload_size: u32::try_from(aligned).unwrap_or(u32::MAX),
        ..*header
    };
    sized.encoded_len() + aligned
}

fn encode_message(header: &Header, payload: &[u8], dst: &mut BytesMut) {
    let aligned = align_size(payload.len());
    let sized = Header {
        payload_size: aligned as u32,
        ..*header
    };
    sized.encode(dst);
    dst.put_slice(payload);
    dst.put_bytes(0, aligned - payload.len());
}

/// Pending outbound bytes for one circuit.
#[derive(Debug)]
pub struct OutBuf {
    buf: BytesMut,
    capacity: usize,
}

impl OutBuf {
    pub fn new(config: OutBufConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(config.capacity),
            capacity: config.capacity,
        }
    }

    pub fn bytes_present(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes not yet flushed.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Append one message. The payload is padded to the message alignment and
    /// the header's size field is set to the padded length.
    pub fn push(&mut self, header: Header, payload: &[u8]) -> Result<()> {
        let need = message_len(&header, payload.len());
        self.check_room(need)?;
        encode_message(&header, payload, &mut self.buf);
        Ok(())
    }

    /// Open a transaction of at most `len` bytes.
    ///
    /// Fails without side effects if the space is not available now.
    pub fn reserve(&self, len: usize) -> Result<Reservation> {
        self.check_room(len)?;
        Ok(Reservation {
            scratch: BytesMut::with_capacity(len),
            limit: len,
        })
    }

    /// Append everything written into `reservation`. Returns the byte count.
    pub fn commit(&mut self, reservation: Reservation) -> Result<usize> {
        let len = reservation.scratch.len();
        self.check_room(len)?;
        self.buf.extend_from_slice(&reservation.scratch);
        Ok(len)
    }

    /// Write as much as possible to `dst`, removing what was written.
    ///
    /// Stops early (without error) if the writer would block.
    pub fn flush_to<W: Write>(&mut self, dst: &mut W) -> Result<usize> {
        let mut written = 0;
        while !self.buf.is_empty() {
            match dst.write(&self.buf) {
                Ok(0) => return Err(WireError::ConnectionClosed),
                Ok(n) => {
                    self.buf.advance(n);
                    written += n;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => return Err(WireError::Io(err)),
            }
        }
        dst.flush()?;
        Ok(written)
    }

    /// Take all pending bytes, leaving the buffer empty.
    pub fn take(&mut self) -> BytesMut {
        self.buf.split()
    }

    fn check_room(&self, need: usize) -> Result<()> {
        if need > self.capacity {
            return Err(WireError::HugeRequest {
                size: need,
                max: self.capacity,
            });
        }
        if self.buf.len() + need > self.capacity {
            return Err(WireError::SendBlocked {
                pending: self.buf.len(),
                need,
            });
        }
        Ok(())
    }
}

impl Default for OutBuf {
    fn default() -> Self {
        Self::new(OutBufConfig::default())
    }
}

/// Scratch region for messages that are committed together.
///
/// Dropping a reservation without committing it discards its contents.
#[derive(Debug)]
pub struct Reservation {
    scratch: BytesMut,
    limit: usize,
}

impl Reservation {
    /// Append one message inside the reserved space.
    pub fn push(&mut self, header: Header, payload: &[u8]) -> Result<()> {
        let need = message_len(&header, payload.len());
        let left = self.remaining();
        if need > left {
            return Err(WireError::ReservationOverrun { need, left });
        }
        encode_message(&header, payload, &mut self.scratch);
        Ok(())
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.scratch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scratch.is_empty()
    }

    /// Reserved bytes not yet used.
    pub fn remaining(&self) -> usize {
        self.limit - self.scratch.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{COMPACT_HEADER_SIZE, EXTENDED_HEADER_SIZE};

    fn outbuf(capacity: usize) -> OutBuf {
        OutBuf::new(OutBufConfig { capacity })
    }

    #[test]
    fn test_push_pads_payload() {
        let mut out = OutBuf::default();
        out.push(Header::new(23), b"abc").unwrap();

        let bytes = out.as_slice();
        assert_eq!(bytes.len(), COMPACT_HEADER_SIZE + 8);
        assert_eq!(&bytes[2..4], &8u16.to_be_bytes());
        assert_eq!(&bytes[16..19], b"abc");
        assert!(bytes[19..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_push_large_uses_extended_header() {
        let mut out = outbuf(1 << 20);
        let payload = vec![1u8; 0x1_0000];
        out.push(Header::new(1).with_type(4, 0x1_0000), &payload)
            .unwrap();
        assert_eq!(out.bytes_present(), EXTENDED_HEADER_SIZE + payload.len());
    }

    #[test]
    fn test_huge_vs_blocked() {
        let mut out = outbuf(40);
        let err = out.push(Header::new(1), &[0u8; 32]).unwrap_err();
        assert!(matches!(err, WireError::HugeRequest { size: 48, max: 40 }));

        out.push(Header::new(1), &[0u8; 8]).unwrap();
        let err = out.push(Header::new(1), &[0u8; 8]).unwrap_err();
        assert!(matches!(err, WireError::SendBlocked { pending: 24, need: 24 }));
    }

    #[test]
    fn test_reservation_commit_is_atomic() {
        let mut out = OutBuf::default();
        let mut r = out.reserve(2 * COMPACT_HEADER_SIZE).unwrap();
        r.push(Header::new(22), &[]).unwrap();
        r.push(Header::new(18), &[]).unwrap();
        assert_eq!(r.remaining(), 0);
        assert!(out.is_empty());

        assert_eq!(out.commit(r).unwrap(), 2 * COMPACT_HEADER_SIZE);
        assert_eq!(out.bytes_present(), 2 * COMPACT_HEADER_SIZE);
    }

    #[test]
    fn test_reservation_drop_discards() {
        let mut out = OutBuf::default();
        {
            let mut r = out.reserve(64).unwrap();
            r.push(Header::new(22), &[]).unwrap();
        }
        assert!(out.is_empty());
        out.push(Header::new(1), &[]).unwrap();
        assert_eq!(out.bytes_present(), COMPACT_HEADER_SIZE);
    }

    #[test]
    fn test_reservation_overrun() {
        let out = OutBuf::default();
        let mut r = out.reserve(COMPACT_HEADER_SIZE).unwrap();
        let err = r.push(Header::new(1), b"x").unwrap_err();
        assert!(matches!(err, WireError::ReservationOverrun { .. }));
        assert!(r.is_empty());
    }

    #[test]
    fn test_reserve_blocked_when_full() {
        let mut out = outbuf(32);
        out.push(Header::new(1), &[]).unwrap();
        assert!(matches!(
            out.reserve(24),
            Err(WireError::SendBlocked { .. })
        ));
    }

    #[test]
    fn test_flush_to_writer() {
        let mut out = OutBuf::default();
        out.push(Header::new(23), &[]).unwrap();
        let mut sink = Vec::new();
        assert_eq!(out.flush_to(&mut sink).unwrap(), COMPACT_HEADER_SIZE);
        assert!(out.is_empty());
        assert_eq!(sink.len(), COMPACT_HEADER_SIZE);
    }
}
