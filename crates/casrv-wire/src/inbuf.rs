//! Input buffer and message framer.
//!
//! Bytes read from the circuit accumulate here until a whole message is
//! present. The buffer never holds more than its capacity; callers keep what
//! [`InBuf::extend`] did not accept and offer it again later. A message that
//! cannot fit even after the buffer has been grown to its large size is
//! reported once and then drained: exactly the rest of its bytes are
//! discarded as they arrive, so framing resumes on the next header.

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::header::Header;

/// Default initial capacity (small buffer).
pub const DEFAULT_INITIAL_CAPACITY: usize = 16 * 1024;

/// Default capacity after the one-time expansion.
pub const DEFAULT_MAX_CAPACITY: usize = 16 * 1024 + 1024;

/// Capacity limits for an [`InBuf`].
#[derive(Debug, Clone)]
pub struct InBufConfig {
    /// Capacity before any oversized message has been seen.
    pub initial_capacity: usize,
    /// Capacity after the buffer has been expanded once.
    pub max_capacity: usize,
}

impl Default for InBufConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            max_capacity: DEFAULT_MAX_CAPACITY,
        }
    }
}

/// Result of asking the framer for the next message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framed {
    /// Not enough bytes buffered yet.
    NeedMore,
    /// A whole message is at the front of the buffer.
    Message { header: Header, header_len: usize },
    /// The message at the front can never be buffered whole; the caller must
    /// report it and then call [`InBuf::start_drain`].
    TooLarge { header: Header, total: usize },
}

/// Accumulates circuit bytes and frames messages out of them.
#[derive(Debug)]
pub struct InBuf {
    buf: BytesMut,
    capacity: usize,
    config: InBufConfig,
    to_drain: usize,
}

impl InBuf {
    pub fn new(config: InBufConfig) -> Self {
        let capacity = config.initial_capacity.min(config.max_capacity);
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
            config,
            to_drain: 0,
        }
    }

    /// Bytes currently buffered.
    pub fn bytes_present(&self) -> usize {
        self.buf.len()
    }

    /// Current capacity limit.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes of an oversized message still to be discarded.
    pub fn bytes_to_drain(&self) -> usize {
        self.to_drain
    }

    /// Free space left before the capacity limit.
    pub fn room(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    /// Take bytes received from the circuit, up to the free space.
    ///
    /// Bytes of a message being drained are discarded here without using any
    /// space. Returns how many bytes of `bytes` were taken.
    pub fn extend(&mut self, mut bytes: &[u8]) -> usize {
        let mut taken = 0;
        if self.to_drain > 0 && self.buf.is_empty() {
            let skip = self.to_drain.min(bytes.len());
            self.to_drain -= skip;
            bytes = &bytes[skip..];
            taken = skip;
        }
        let accepted = self.room().min(bytes.len());
        self.buf.extend_from_slice(&bytes[..accepted]);
        taken + accepted
    }

    /// Frame the next message.
    ///
    /// Pending drain is applied first; while bytes remain to be drained the
    /// result is always [`Framed::NeedMore`]. Nothing is consumed on success:
    /// call [`InBuf::consume`] once the message has been handled.
    pub fn next_message(&mut self) -> Framed {
        if self.to_drain > 0 {
            let present = self.buf.len();
            if present < self.to_drain {
                self.buf.clear();
                self.to_drain -= present;
                trace!(remaining = self.to_drain, "draining oversized message");
                return Framed::NeedMore;
            }
            self.buf.advance(self.to_drain);
            self.to_drain = 0;
            trace!("oversized message drained");
        }

        let Some((header, header_len)) = Header::peek(&self.buf) else {
            return Framed::NeedMore;
        };

        let total = header_len + header.payload_size as usize;
        if total > self.capacity {
            self.expand();
            if total > self.capacity {
                return Framed::TooLarge { header, total };
            }
        }

        if self.buf.len() >= total {
            Framed::Message { header, header_len }
        } else {
            Framed::NeedMore
        }
    }

    /// Payload of the message at the front of the buffer.
    pub fn payload(&self, header: &Header, header_len: usize) -> &[u8] {
        let end = (header_len + header.payload_size as usize).min(self.buf.len());
        &self.buf[header_len.min(end)..end]
    }

    /// Remove a handled message from the front of the buffer.
    pub fn consume(&mut self, len: usize) {
        let len = len.min(self.buf.len());
        self.buf.advance(len);
    }

    /// Discard the buffered part of an oversized message of `total` bytes and
    /// arrange for the remainder to be dropped as it arrives.
    /// Bytes already buffered past the message are kept.
    pub fn start_drain(&mut self, total: usize) {
        let present = self.buf.len();
        if present >= total {
            self.buf.advance(total);
            self.to_drain = 0;
        } else {
            self.buf.clear();
            self.to_drain = total - present;
        }
    }

    /// Grow to the large capacity (only the first call has an effect).
    fn expand(&mut self) {
        if self.capacity < self.config.max_capacity {
            self.capacity = self.config.max_capacity;
            self.buf.reserve(self.capacity - self.buf.len().min(self.capacity));
        }
    }
}

impl Default for InBuf {
    fn default() -> Self {
        Self::new(InBufConfig::default())
    }
}
