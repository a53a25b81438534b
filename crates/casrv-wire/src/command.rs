//! Command opcodes carried in the first header word.
//!
//! Opcodes below [`COMMAND_TABLE_SIZE`] have a slot in the server's dispatch
//! table; some slots are outbound-only and are treated as unknown when a
//! client sends them.

pub const VERSION: u16 = 0;
pub const EVENT_ADD: u16 = 1;
pub const EVENT_CANCEL: u16 = 2;
pub const READ: u16 = 3;
pub const WRITE: u16 = 4;
pub const SNAPSHOT: u16 = 5;
pub const SEARCH: u16 = 6;
pub const BUILD: u16 = 7;
pub const EVENTS_OFF: u16 = 8;
pub const EVENTS_ON: u16 = 9;
pub const READ_SYNC: u16 = 10;
pub const ERROR: u16 = 11;
pub const CLEAR_CHANNEL: u16 = 12;
pub const RSRV_IS_UP: u16 = 13;
pub const NOT_FOUND: u16 = 14;
pub const READ_NOTIFY: u16 = 15;
pub const READ_BUILD: u16 = 16;
pub const REPEATER_CONFIRM: u16 = 17;
pub const CLAIM_CIU: u16 = 18;
pub const WRITE_NOTIFY: u16 = 19;
pub const CLIENT_NAME: u16 = 20;
pub const HOST_NAME: u16 = 21;
pub const ACCESS_RIGHTS: u16 = 22;
pub const ECHO: u16 = 23;
pub const REPEATER_REGISTER: u16 = 24;
pub const SIGNAL: u16 = 25;
pub const CLAIM_CIU_FAILED: u16 = 26;
pub const SERVER_DISCONN: u16 = 27;

/// Number of opcode slots in the dispatch table.
pub const COMMAND_TABLE_SIZE: usize = 28;

/// Access rights bit: client may read.
pub const ACCESS_RIGHT_READ: u32 = 1;

/// Access rights bit: client may write.
pub const ACCESS_RIGHT_WRITE: u32 = 2;

/// Minor protocol revision this server speaks.
pub const MINOR_PROTOCOL_REVISION: u16 = 13;

/// Subscription mask bit: value changes.
pub const DBE_VALUE: u16 = 1;

/// Subscription mask bit: archive (log) changes.
pub const DBE_LOG: u16 = 2;

/// Subscription mask bit: alarm changes.
pub const DBE_ALARM: u16 = 4;

/// Size of the event-add payload: three f32 deadbands, u16 mask, u16 pad.
pub const MON_INFO_SIZE: usize = 16;

/// Offset of the mask inside the event-add payload.
pub const MON_INFO_MASK_OFFSET: usize = 12;

/// Longest process variable name accepted in a claim.
pub const UNREASONABLE_PV_NAME_SIZE: usize = 500;

/// Resource id used in diagnostics that do not refer to a channel.
pub const INVALID_RES_ID: u32 = u32::MAX;

/// Returns a human-readable name for an opcode.
pub fn command_name(cmd: u16) -> &'static str {
    match cmd {
        VERSION => "VERSION",
        EVENT_ADD => "EVENT_ADD",
        EVENT_CANCEL => "EVENT_CANCEL",
        READ => "READ",
        WRITE => "WRITE",
        SNAPSHOT => "SNAPSHOT",
        SEARCH => "SEARCH",
        BUILD => "BUILD",
        EVENTS_OFF => "EVENTS_OFF",
        EVENTS_ON => "EVENTS_ON",
        READ_SYNC => "READ_SYNC",
        ERROR => "ERROR",
        CLEAR_CHANNEL => "CLEAR_CHANNEL",
        RSRV_IS_UP => "RSRV_IS_UP",
        NOT_FOUND => "NOT_FOUND",
        READ_NOTIFY => "READ_NOTIFY",
        READ_BUILD => "READ_BUILD",
        REPEATER_CONFIRM => "REPEATER_CONFIRM",
        CLAIM_CIU => "CLAIM_CIU",
        WRITE_NOTIFY => "WRITE_NOTIFY",
        CLIENT_NAME => "CLIENT_NAME",
        HOST_NAME => "HOST_NAME",
        ACCESS_RIGHTS => "ACCESS_RIGHTS",
        ECHO => "ECHO",
        REPEATER_REGISTER => "REPEATER_REGISTER",
        SIGNAL => "SIGNAL",
        CLAIM_CIU_FAILED => "CLAIM_CIU_FAILED",
        SERVER_DISCONN => "SERVER_DISCONN",
        _ => "UNKNOWN",
    }
}

/// Access rights granted at minor version 1 and later.
pub fn supports_access_rights(minor: u16) -> bool {
    minor >= 1
}

/// Claim requests are only understood from minor version 4 on.
pub fn supports_claim(minor: u16) -> bool {
    minor >= 4
}

/// Dedicated claim-failed opcode from minor version 6 on.
pub fn supports_claim_failed(minor: u16) -> bool {
    minor >= 6
}

/// Server-initiated channel disconnect from minor version 7 on.
pub fn supports_server_disconnect(minor: u16) -> bool {
    minor >= 7
}

/// Extended header echo in error responses from minor version 9 on.
pub fn supports_extended_echo(minor: u16) -> bool {
    minor >= 9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_names() {
        assert_eq!(command_name(CLAIM_CIU), "CLAIM_CIU");
        assert_eq!(command_name(ECHO), "ECHO");
        assert_eq!(command_name(SERVER_DISCONN), "SERVER_DISCONN");
        assert_eq!(command_name(COMMAND_TABLE_SIZE as u16), "UNKNOWN");
        assert_eq!(command_name(u16::MAX), "UNKNOWN");
    }

    #[test]
    fn test_version_gates() {
        assert!(!supports_access_rights(0));
        assert!(supports_access_rights(1));
        assert!(!supports_claim(3));
        assert!(supports_claim(4));
        assert!(!supports_claim_failed(5));
        assert!(supports_claim_failed(6));
        assert!(!supports_server_disconnect(6));
        assert!(supports_server_disconnect(7));
        assert!(!supports_extended_echo(8));
        assert!(supports_extended_echo(MINOR_PROTOCOL_REVISION));
    }
}
