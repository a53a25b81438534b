use bytes::{BufMut, BytesMut};

/// Compact header: cmd (2) + postsize (2) + type (2) + count (2) + cid (4) + available (4).
pub const COMPACT_HEADER_SIZE: usize = 16;

/// Large-array extension: payload size (4) + element count (4).
pub const EXTENSION_SIZE: usize = 8;

/// Compact header followed by the extension words.
pub const EXTENDED_HEADER_SIZE: usize = COMPACT_HEADER_SIZE + EXTENSION_SIZE;

/// Value of a 16-bit size or count field that announces the extension.
pub const EXTENDED_SENTINEL: u16 = 0xFFFF;

/// Every outbound payload is padded to a multiple of this.
pub const MESSAGE_ALIGN: usize = 8;

/// Round `size` up to the message alignment.
pub fn align_size(size: usize) -> usize {
    (size + MESSAGE_ALIGN - 1) & !(MESSAGE_ALIGN - 1)
}

/// A decoded message header with sizes resolved to 32 bits.
///
/// Wire format:
/// ```text
/// ┌─────────┬──────────┬──────────┬─────────┬─────────┬───────────┐
/// │ cmd     │ postsize │ dataType │ count   │ cid     │ available │
/// │ (2B BE) │ (2B BE)  │ (2B BE)  │ (2B BE) │ (4B BE) │ (4B BE)   │
/// └─────────┴──────────┴──────────┴─────────┴─────────┴───────────┘
/// [ payload size (4B BE) │ element count (4B BE) ]   extended form only
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub command: u16,
    pub payload_size: u32,
    pub data_type: u16,
    pub count: u32,
    /// Resource id, status code or zero depending on the command.
    pub cid: u32,
    /// Correlation tag, subscription id or protocol version depending on the command.
    pub available: u32,
}

impl Header {
    /// A header for `command` with every other field zeroed.
    pub fn new(command: u16) -> Self {
        Self {
            command,
            ..Self::default()
        }
    }

    pub fn with_payload_size(mut self, size: u32) -> Self {
        self.payload_size = size;
        self
    }

    pub fn with_type(mut self, data_type: u16, count: u32) -> Self {
        self.data_type = data_type;
        self.count = count;
        self
    }

    pub fn with_ids(mut self, cid: u32, available: u32) -> Self {
        self.cid = cid;
        self.available = available;
        self
    }

    /// Whether this header has to be sent in the extended form.
    pub fn needs_extension(&self) -> bool {
        let sentinel = u32::from(EXTENDED_SENTINEL);
        self.payload_size >= sentinel || self.count >= sentinel
    }

    /// Bytes this header occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        if self.needs_extension() {
            EXTENDED_HEADER_SIZE
        } else {
            COMPACT_HEADER_SIZE
        }
    }

    /// Append the header, picking the compact or extended form.
    pub fn encode(&self, dst: &mut BytesMut) {
        if self.needs_extension() {
            self.encode_extended(dst);
        } else {
            self.encode_compact(dst);
        }
    }

    /// Append the compact form, truncating sizes to 16 bits.
    pub fn encode_compact(&self, dst: &mut BytesMut) {
        dst.reserve(COMPACT_HEADER_SIZE);
        dst.put_u16(self.command);
        dst.put_u16(self.payload_size as u16);
        dst.put_u16(self.data_type);
        dst.put_u16(self.count as u16);
        dst.put_u32(self.cid);
        dst.put_u32(self.available);
    }

    /// Append the extended form: sentinel size, zero count, then the 32-bit words.
    pub fn encode_extended(&self, dst: &mut BytesMut) {
        dst.reserve(EXTENDED_HEADER_SIZE);
        dst.put_u16(self.command);
        dst.put_u16(EXTENDED_SENTINEL);
        dst.put_u16(self.data_type);
        dst.put_u16(0);
        dst.put_u32(self.cid);
        dst.put_u32(self.available);
        dst.put_u32(self.payload_size);
        dst.put_u32(self.count);
    }

    /// Decode a header from the front of `src`.
    ///
    /// Returns `None` if `src` does not yet hold the whole header (including the
    /// extension when either 16-bit field carries the sentinel). On success the
    /// second value is the header length; the payload is not inspected.
    pub fn peek(src: &[u8]) -> Option<(Self, usize)> {
        if src.len() < COMPACT_HEADER_SIZE {
            return None;
        }

        let command = be16(src, 0);
        let short_size = be16(src, 2);
        let data_type = be16(src, 4);
        let short_count = be16(src, 6);
        let cid = be32(src, 8);
        let available = be32(src, 12);

        let (payload_size, count, header_len) =
            if short_size != EXTENDED_SENTINEL && short_count != EXTENDED_SENTINEL {
                (u32::from(short_size), u32::from(short_count), COMPACT_HEADER_SIZE)
            } else {
                if src.len() < EXTENDED_HEADER_SIZE {
                    return None;
                }
                (be32(src, 16), be32(src, 20), EXTENDED_HEADER_SIZE)
            };

        Some((
            Self {
                command,
                payload_size,
                data_type,
                count,
                cid,
                available,
            },
            header_len,
        ))
    }
}

fn be16(src: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([src[at], src[at + 1]])
}

fn be32(src: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]])
}
