use std::time::Duration;

use casrv_wire::command::{DBE_ALARM, DBE_LOG, DBE_VALUE};
use casrv_wire::{InBufConfig, OutBufConfig, EXTENDED_HEADER_SIZE};

/// Default for the largest array payload a client may transfer.
pub const DEFAULT_MAX_ARRAY_BYTES: usize = 16 * 1024;

/// Size of the input buffer before it is grown for a large message.
pub const SMALL_BUFFER_SIZE: usize = 16 * 1024;

/// Server-internal event selection bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u32);

impl EventMask {
    pub const NONE: Self = Self(0);
    pub const VALUE: Self = Self(1);
    pub const LOG: Self = Self(2);
    pub const ALARM: Self = Self(4);
    pub const ALL: Self = Self(7);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn no_events_selected(self) -> bool {
        self.0 == 0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Which server-internal bits each client mask bit selects.
///
/// Clearing a member disables that kind of subscription server-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPolicy {
    pub value: EventMask,
    pub log: EventMask,
    pub alarm: EventMask,
}

impl EventPolicy {
    /// Translate a client's `DBE_*` mask into server event bits.
    pub fn translate(&self, wire_mask: u16) -> EventMask {
        let mut mask = EventMask::NONE;
        if wire_mask & DBE_VALUE != 0 {
            mask |= self.value;
        }
        if wire_mask & DBE_LOG != 0 {
            mask |= self.log;
        }
        if wire_mask & DBE_ALARM != 0 {
            mask |= self.alarm;
        }
        mask
    }
}

impl Default for EventPolicy {
    fn default() -> Self {
        Self {
            value: EventMask::VALUE,
            log: EventMask::LOG,
            alarm: EventMask::ALARM,
        }
    }
}

/// Server-wide tunables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Largest array payload accepted or sent (EPICS_CA_MAX_ARRAY_BYTES).
    pub max_array_bytes: usize,
    /// Event mask translation.
    pub event_policy: EventPolicy,
    /// Queue a version message when a session starts.
    pub announce_version: bool,
    /// Log every request at debug level.
    pub dump_requests: bool,
    /// Write timeout applied to circuits.
    pub write_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_array_bytes: DEFAULT_MAX_ARRAY_BYTES,
            event_policy: EventPolicy::default(),
            announce_version: true,
            dump_requests: false,
            write_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn with_max_array_bytes(mut self, bytes: usize) -> Self {
        self.max_array_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_event_policy(mut self, policy: EventPolicy) -> Self {
        self.event_policy = policy;
        self
    }

    #[must_use]
    pub fn with_announce_version(mut self, announce: bool) -> Self {
        self.announce_version = announce;
        self
    }

    #[must_use]
    pub fn with_dump_requests(mut self, dump: bool) -> Self {
        self.dump_requests = dump;
        self
    }

    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Size of a buffer able to hold the largest array plus its header.
    pub fn large_buffer_size(&self) -> usize {
        self.max_array_bytes.max(SMALL_BUFFER_SIZE) + EXTENDED_HEADER_SIZE
    }

    pub fn in_buf_config(&self) -> InBufConfig {
        InBufConfig {
            initial_capacity: SMALL_BUFFER_SIZE,
            max_capacity: self.large_buffer_size(),
        }
    }

    pub fn out_buf_config(&self) -> OutBufConfig {
        OutBufConfig {
            capacity: self.large_buffer_size(),
        }
    }
}
