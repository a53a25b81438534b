//! ECA status codes reported to clients.
//!
//! A code packs a message number and a severity:
//! `((number << 3) & 0xFFF8) | severity`.

use std::fmt;

const WARNING: u32 = 0;
const SUCCESS: u32 = 1;
const ERROR: u32 = 2;
const INFO: u32 = 3;
const SEVERE: u32 = 4;
const FATAL: u32 = 6;

const fn defmsg(severity: u32, number: u32) -> u32 {
    ((number << 3) & 0xFFF8) | severity
}

/// Client-visible status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EcaStatus(u32);

impl EcaStatus {
    pub const NORMAL: Self = Self(defmsg(SUCCESS, 0));
    pub const MAXIOC: Self = Self(defmsg(ERROR, 1));
    pub const UKNHOST: Self = Self(defmsg(ERROR, 2));
    pub const UKNSERV: Self = Self(defmsg(ERROR, 3));
    pub const SOCK: Self = Self(defmsg(ERROR, 4));
    pub const CONN: Self = Self(defmsg(WARNING, 5));
    pub const ALLOCMEM: Self = Self(defmsg(WARNING, 6));
    pub const UKNCHAN: Self = Self(defmsg(WARNING, 7));
    pub const UKNFIELD: Self = Self(defmsg(WARNING, 8));
    pub const TOLARGE: Self = Self(defmsg(WARNING, 9));
    pub const TIMEOUT: Self = Self(defmsg(WARNING, 10));
    pub const NOSUPPORT: Self = Self(defmsg(WARNING, 11));
    pub const STRTOBIG: Self = Self(defmsg(WARNING, 12));
    pub const DISCONNCHID: Self = Self(defmsg(ERROR, 13));
    pub const BADTYPE: Self = Self(defmsg(ERROR, 14));
    pub const CHIDNOTFND: Self = Self(defmsg(INFO, 15));
    pub const CHIDRETRY: Self = Self(defmsg(INFO, 16));
    pub const INTERNAL: Self = Self(defmsg(FATAL, 17));
    pub const DBLCLFAIL: Self = Self(defmsg(WARNING, 18));
    pub const GETFAIL: Self = Self(defmsg(WARNING, 19));
    pub const PUTFAIL: Self = Self(defmsg(WARNING, 20));
    pub const ADDFAIL: Self = Self(defmsg(WARNING, 21));
    pub const BADCOUNT: Self = Self(defmsg(WARNING, 22));
    pub const BADSTR: Self = Self(defmsg(ERROR, 23));
    pub const DISCONN: Self = Self(defmsg(WARNING, 24));
    pub const DBLCHNL: Self = Self(defmsg(WARNING, 25));
    pub const EVDISALLOW: Self = Self(defmsg(ERROR, 26));
    pub const BUILDGET: Self = Self(defmsg(WARNING, 27));
    pub const NEEDSFP: Self = Self(defmsg(WARNING, 28));
    pub const OVEVFAIL: Self = Self(defmsg(WARNING, 29));
    pub const BADMONID: Self = Self(defmsg(ERROR, 30));
    pub const NEWADDR: Self = Self(defmsg(WARNING, 31));
    pub const NEWCONN: Self = Self(defmsg(INFO, 32));
    pub const NOCACTX: Self = Self(defmsg(WARNING, 33));
    pub const DEFUNCT: Self = Self(defmsg(FATAL, 34));
    pub const EMPTYSTR: Self = Self(defmsg(WARNING, 35));
    pub const NOREPEATER: Self = Self(defmsg(WARNING, 36));
    pub const NOCHANMSG: Self = Self(defmsg(WARNING, 37));
    pub const DLCKREST: Self = Self(defmsg(WARNING, 38));
    pub const SERVBEHIND: Self = Self(defmsg(WARNING, 39));
    pub const NOCAST: Self = Self(defmsg(WARNING, 40));
    pub const BADMASK: Self = Self(defmsg(ERROR, 41));
    pub const IODONE: Self = Self(defmsg(INFO, 42));
    pub const IOINPROGESS: Self = Self(defmsg(INFO, 43));
    pub const BADSYNCGRP: Self = Self(defmsg(ERROR, 44));
    pub const PUTCBINPROG: Self = Self(defmsg(ERROR, 45));
    pub const NORDACCESS: Self = Self(defmsg(WARNING, 46));
    pub const NOWTACCESS: Self = Self(defmsg(WARNING, 47));
    pub const ANACHRONISM: Self = Self(defmsg(ERROR, 48));
    pub const NOSEARCHADDR: Self = Self(defmsg(WARNING, 49));
    pub const NOCONVERT: Self = Self(defmsg(WARNING, 50));
    pub const BADCHID: Self = Self(defmsg(ERROR, 51));
    pub const BADFUNCPTR: Self = Self(defmsg(ERROR, 52));
    pub const ISATTACHED: Self = Self(defmsg(WARNING, 53));
    pub const UNAVAILINSERV: Self = Self(defmsg(WARNING, 54));
    pub const CHANDESTROY: Self = Self(defmsg(WARNING, 55));
    pub const BADPRIORITY: Self = Self(defmsg(ERROR, 56));
    pub const NOTTHREADED: Self = Self(defmsg(ERROR, 57));
    pub const ARRAY16KCLIENT: Self = Self(defmsg(WARNING, 58));
    pub const CONNSEQTMO: Self = Self(defmsg(WARNING, 59));
    pub const UNRESPTMO: Self = Self(defmsg(WARNING, 60));

    /// Wrap a raw code received from or destined for the wire.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw 32-bit code.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Message number (index into the message catalogue).
    pub const fn number(self) -> u32 {
        (self.0 & 0xFFF8) >> 3
    }

    /// Severity bits.
    pub const fn severity(self) -> u32 {
        self.0 & 0x7
    }

    pub fn is_success(self) -> bool {
        self.severity() == SUCCESS || self.severity() == INFO
    }

    pub fn is_severe(self) -> bool {
        self.severity() & SEVERE != 0
    }

    /// Human-readable message for this code.
    pub fn message(self) -> &'static str {
        MESSAGES
            .get(self.number() as usize)
            .copied()
            .unwrap_or("Unknown ECA status")
    }
}

impl fmt::Display for EcaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.message(), self.0)
    }
}

const MESSAGES: [&str; 61] = [
    "Normal successful completion",
    "Maximum simultaneous IOC connections exceeded",
    "Unknown internet host",
    "Unknown internet service",
    "Unable to allocate a new socket",
    "Unable to connect to internet host or service",
    "Unable to allocate additional dynamic memory",
    "Unknown IO channel",
    "Record field specified inappropriate for channel specified",
    "The requested data transfer is greater than available memory or EPICS_CA_MAX_ARRAY_BYTES",
    "User specified timeout on IO operation expired",
    "Sorry, that feature is planned but not supported at this time",
    "The supplied string is unusually large",
    "The request was ignored because the specified channel is disconnected",
    "The data type specified is invalid",
    "Remote channel not found",
    "Unable to locate all user specified channels",
    "Channel Access internal failure",
    "The requested local DB operation failed",
    "Channel read request failed",
    "Channel write request failed",
    "Channel subscription request failed",
    "Invalid element count requested",
    "Invalid string",
    "Virtual circuit disconnect",
    "Identical process variable names on multiple servers",
    "Request inappropriate within subscription (monitor) update callback",
    "Database value get for that channel failed during channel search",
    "Unable to initialize without the vxWorks VX_FP_TASK task option set",
    "Event queue overflow has prevented first pass event after event add",
    "Bad event subscription (monitor) identifier",
    "Remote channel has new network address",
    "New or resumed network connection",
    "Specified task isn't a member of a CA context",
    "Attempt to use defunct CA feature failed",
    "The supplied string is empty",
    "Unable to spawn the CA repeater thread; auto reconnect will fail",
    "No channel id match for search reply; search reply ignored",
    "Resetting dead connection; will try to reconnect",
    "Server (IOC) has fallen behind or is not responding; still waiting",
    "No internet interface with broadcast available",
    "Invalid event selection mask",
    "IO operations have completed",
    "IO operations are in progress",
    "Invalid synchronous group identifier",
    "Put callback timed out",
    "Read access denied",
    "Write access denied",
    "Requested feature is no longer supported",
    "Empty PV search address list",
    "No reasonable data conversion between client and server types",
    "Invalid channel identifier",
    "Invalid function pointer",
    "Thread is already attached to a client context",
    "Not supported by attached service",
    "User destroyed channel",
    "Invalid channel priority",
    "Preemptive callback not enabled; additional threads may not join context",
    "Client's protocol revision does not support transfers exceeding 16k bytes",
    "Virtual circuit connection sequence aborted",
    "Virtual circuit unresponsive",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes() {
        assert_eq!(EcaStatus::NORMAL.raw(), 1);
        assert_eq!(EcaStatus::ALLOCMEM.raw(), 48);
        assert_eq!(EcaStatus::TOLARGE.raw(), 72);
        assert_eq!(EcaStatus::BADTYPE.raw(), 114);
        assert_eq!(EcaStatus::INTERNAL.raw(), 142);
        assert_eq!(EcaStatus::GETFAIL.raw(), 152);
        assert_eq!(EcaStatus::PUTFAIL.raw(), 160);
        assert_eq!(EcaStatus::BADCOUNT.raw(), 176);
        assert_eq!(EcaStatus::BADMONID.raw(), 242);
        assert_eq!(EcaStatus::DEFUNCT.raw(), 278);
        assert_eq!(EcaStatus::BADMASK.raw(), 330);
        assert_eq!(EcaStatus::NORDACCESS.raw(), 368);
        assert_eq!(EcaStatus::NOWTACCESS.raw(), 376);
        assert_eq!(EcaStatus::NOCONVERT.raw(), 400);
        assert_eq!(EcaStatus::BADCHID.raw(), 410);
        assert_eq!(EcaStatus::UNAVAILINSERV.raw(), 432);
    }

    #[test]
    fn test_severity_and_message() {
        assert!(EcaStatus::NORMAL.is_success());
        assert!(!EcaStatus::GETFAIL.is_success());
        assert!(EcaStatus::INTERNAL.is_severe());
        assert_eq!(EcaStatus::NORDACCESS.message(), "Read access denied");
        assert_eq!(EcaStatus::from_raw(0xFFF8).message(), "Unknown ECA status");
        assert!(EcaStatus::BADCHID.to_string().contains("0x19a"));
    }
}
