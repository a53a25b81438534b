//! Response encoders.
//!
//! Primary responses report [`WireError::SendBlocked`] to the caller so the
//! request can be retried after a flush. Diagnostics built by
//! [`SessionState::send_err`] are best effort: callers log a failure and move
//! on.

use bytes::{BufMut, BytesMut};
use casrv_wire::command::{
    self, supports_access_rights, supports_claim_failed, supports_extended_echo, INVALID_RES_ID,
};
use casrv_wire::header::EXTENDED_SENTINEL;
use casrv_wire::{
    encode_dbr, DbrType, EcaStatus, Header, Reservation, Value, WireError, EXTENDED_HEADER_SIZE,
};
use tracing::{debug, warn};

use crate::dispatch::{HandlerResult, Outcome};
use crate::pv::{AccessRights, PvError};
use crate::session::SessionState;

type WireResult<T> = casrv_wire::Result<T>;

/// Turn the result of a primary response into a handler outcome.
pub(crate) fn respond(result: WireResult<()>) -> HandlerResult {
    match result {
        Ok(()) => Ok(Outcome::Done),
        Err(WireError::SendBlocked { .. }) => Ok(Outcome::SendBlocked),
        Err(err) => {
            warn!(error = %err, "response dropped");
            Ok(Outcome::Done)
        }
    }
}

/// Turn the result of a diagnostic into a handler outcome; it never blocks
/// the request.
pub(crate) fn diagnostic(result: WireResult<()>) -> HandlerResult {
    if let Err(err) = result {
        warn!(error = %err, "diagnostic not sent to client");
    }
    Ok(Outcome::Done)
}

/// Append the request header as the error message echoes it.
fn encode_echo(request: &Header, extended_allowed: bool, dst: &mut BytesMut) {
    let sentinel = u32::from(EXTENDED_SENTINEL);
    if extended_allowed && (request.payload_size >= sentinel || request.count >= sentinel) {
        request.encode_extended(dst);
    } else {
        request.encode_compact(dst);
    }
}

fn access_rights_header(cid: u32, rights: AccessRights) -> Header {
    Header::new(command::ACCESS_RIGHTS).with_ids(cid, rights.wire_bits())
}

/// Shorten a single `DBR_STRING` to its text and terminator.
fn trim_string_payload(dbr: DbrType, count: u32, payload: &mut Vec<u8>) {
    if dbr == DbrType::STRING && count == 1 {
        let len = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
        payload.truncate((len + 1).min(payload.len()));
    }
}

impl SessionState {
    /// Send an error message echoing `request`, with an optional detail.
    pub(crate) fn send_err(
        &mut self,
        request: &Header,
        id: u32,
        status: EcaStatus,
        detail: Option<&str>,
    ) -> WireResult<()> {
        let detail_len = detail.map_or(0, |d| d.len() + 1);
        let mut payload = BytesMut::with_capacity(EXTENDED_HEADER_SIZE + detail_len);
        encode_echo(
            request,
            supports_extended_echo(self.minor_version),
            &mut payload,
        );
        if let Some(detail) = detail {
            payload.put_slice(detail.as_bytes());
            payload.put_u8(0);
        }

        debug!(
            session = self.id,
            command = command::command_name(request.command),
            id,
            status = %status,
            detail = detail.unwrap_or(""),
            "error response"
        );
        let header = Header::new(command::ERROR).with_ids(id, status.raw());
        self.outbuf.push(header, &payload)
    }

    /// [`send_err`](Self::send_err) with the application's failure text as
    /// the detail.
    pub(crate) fn send_err_with_status(
        &mut self,
        request: &Header,
        id: u32,
        status: EcaStatus,
        cause: &PvError,
    ) -> WireResult<()> {
        let detail = cause.to_string();
        self.send_err(request, id, status, Some(&detail))
    }

    /// Report a request naming a resource that does not exist.
    pub(crate) fn log_bad_id(&mut self, request: &Header, status: EcaStatus, id: u32) {
        warn!(
            session = self.id,
            host = %self.host,
            user = %self.user,
            command = command::command_name(request.command),
            id,
            "bad resource id"
        );
        let detail = format!("Bad Resource ID={id} detected");
        if let Err(err) = self.send_err(request, INVALID_RES_ID, status, Some(&detail)) {
            warn!(error = %err, "bad resource id not reported to client");
        }
    }

    /// Reply to a plain read.
    pub(crate) fn read_response(
        &mut self,
        request: &Header,
        cid: u32,
        completion: Result<&Value, &PvError>,
        enum_strings: &[String],
    ) -> WireResult<()> {
        let value = match completion {
            Ok(value) => value,
            Err(cause) => {
                return self.send_err_with_status(request, cid, EcaStatus::GETFAIL, cause);
            }
        };
        let Some(dbr) = DbrType::from_code(request.data_type) else {
            return self.send_err(request, cid, EcaStatus::BADTYPE, Some("get request"));
        };

        let mut payload = match encode_dbr(dbr, request.count, value, enum_strings) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(session = self.id, cid, error = %err, "get conversion failed");
                let cause = PvError::NoConvert(err.to_string());
                return self.send_err_with_status(request, cid, EcaStatus::GETFAIL, &cause);
            }
        };
        trim_string_payload(dbr, request.count, &mut payload);

        let header = Header::new(request.command)
            .with_type(request.data_type, request.count)
            .with_ids(cid, request.available);
        match self.outbuf.push(header, &payload) {
            Err(WireError::HugeRequest { .. }) => self.send_err(
                request,
                cid,
                EcaStatus::TOLARGE,
                Some("unable to fit read response into server's buffer"),
            ),
            other => other,
        }
    }

    /// Reply to a read-notify. Exactly one callback response is attempted;
    /// on failure a diagnostic with the detail follows it.
    pub(crate) fn read_notify_response(
        &mut self,
        request: &Header,
        cid: u32,
        completion: Result<&Value, &PvError>,
        enum_strings: &[String],
    ) -> WireResult<()> {
        let value = match completion {
            Ok(value) => value,
            Err(cause) => {
                self.read_notify_failure(request, EcaStatus::GETFAIL)?;
                if let Err(err) =
                    self.send_err_with_status(request, cid, EcaStatus::NOCONVERT, cause)
                {
                    warn!(error = %err, cause = %cause, "get callback failure detail not passed to client");
                }
                return Ok(());
            }
        };
        let Some(dbr) = DbrType::from_code(request.data_type) else {
            return self.read_notify_failure(request, EcaStatus::BADTYPE);
        };

        let mut payload = match encode_dbr(dbr, request.count, value, enum_strings) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(session = self.id, cid, error = %err, "get notify conversion failed");
                return self.read_notify_failure(request, EcaStatus::NOCONVERT);
            }
        };
        trim_string_payload(dbr, request.count, &mut payload);

        let header = Header::new(request.command)
            .with_type(request.data_type, request.count)
            .with_ids(EcaStatus::NORMAL.raw(), request.available);
        match self.outbuf.push(header, &payload) {
            Err(WireError::HugeRequest { .. }) => self.send_err(
                request,
                cid,
                EcaStatus::TOLARGE,
                Some("unable to fit read notify response into server's buffer"),
            ),
            other => other,
        }
    }

    /// Zero-filled read-notify reply carrying `status`.
    pub(crate) fn read_notify_failure(
        &mut self,
        request: &Header,
        status: EcaStatus,
    ) -> WireResult<()> {
        self.zeroed_reply(request, status)
    }

    /// Zero-filled subscription update carrying `status`.
    pub(crate) fn monitor_failure(&mut self, request: &Header, status: EcaStatus) -> WireResult<()> {
        self.zeroed_reply(request, status)
    }

    fn zeroed_reply(&mut self, request: &Header, status: EcaStatus) -> WireResult<()> {
        let size = DbrType::from_code(request.data_type)
            .map_or(0, |dbr| dbr.size_n(request.count));
        let header = Header::new(request.command)
            .with_type(request.data_type, request.count)
            .with_ids(status.raw(), request.available);
        self.outbuf.push(header, &vec![0u8; size])
    }

    /// Send one subscription update. Every call puts exactly one message on
    /// the wire (or reports why it could not); the returned status is the one
    /// the client received.
    pub(crate) fn monitor_response(
        &mut self,
        request: &Header,
        cid: u32,
        read_access: bool,
        completion: Result<&Value, &PvError>,
        enum_strings: &[String],
    ) -> WireResult<EcaStatus> {
        let Some(dbr) = DbrType::from_code(request.data_type) else {
            self.monitor_failure(request, EcaStatus::BADTYPE)?;
            return Ok(EcaStatus::BADTYPE);
        };
        let size = dbr.size_n(request.count);
        if size > self.outbuf.capacity() {
            self.send_err(
                request,
                cid,
                EcaStatus::TOLARGE,
                Some("unable to fit read subscription update response into server's buffer"),
            )?;
            return Ok(EcaStatus::TOLARGE);
        }

        let failure = if !read_access {
            Some(EcaStatus::NORDACCESS)
        } else {
            match completion {
                Ok(_) => None,
                Err(cause) => {
                    warn!(session = self.id, cid, cause = %cause, "failure in monitor response");
                    Some(match cause {
                        PvError::NoRead => EcaStatus::NORDACCESS,
                        PvError::NoMemory => EcaStatus::ALLOCMEM,
                        _ => EcaStatus::GETFAIL,
                    })
                }
            }
        };
        if let Some(status) = failure {
            self.monitor_failure(request, status)?;
            return Ok(status);
        }

        let Ok(value) = completion else {
            return Ok(EcaStatus::GETFAIL);
        };
        let mut payload = match encode_dbr(dbr, request.count, value, enum_strings) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(session = self.id, cid, error = %err, "no conversion for subscription update");
                self.monitor_failure(request, EcaStatus::NOCONVERT)?;
                return Ok(EcaStatus::NOCONVERT);
            }
        };
        trim_string_payload(dbr, request.count, &mut payload);

        let header = Header::new(request.command)
            .with_type(request.data_type, request.count)
            .with_ids(EcaStatus::NORMAL.raw(), request.available);
        self.outbuf.push(header, &payload)?;
        Ok(EcaStatus::NORMAL)
    }

    /// Write-notify reply with an empty payload carrying `status`.
    pub(crate) fn write_notify_status(
        &mut self,
        request: &Header,
        status: EcaStatus,
    ) -> WireResult<()> {
        let header = Header::new(request.command)
            .with_type(request.data_type, request.count)
            .with_ids(status.raw(), request.available);
        self.outbuf.push(header, &[])
    }

    /// Reply to a write-notify: the callback response first, then on failure
    /// a diagnostic carrying the detail.
    pub(crate) fn write_notify_response(
        &mut self,
        request: &Header,
        cid: u32,
        completion: Result<(), &PvError>,
    ) -> WireResult<()> {
        let status = if completion.is_ok() {
            EcaStatus::NORMAL
        } else {
            EcaStatus::PUTFAIL
        };
        self.write_notify_status(request, status)?;

        if let Err(cause) = completion {
            if let Err(err) = self.send_err_with_status(request, cid, EcaStatus::NOCONVERT, cause) {
                warn!(error = %err, cause = %cause, "put callback failure detail not passed to client");
            }
        }
        Ok(())
    }

    /// Report a failed write (fire-and-forget variant).
    pub(crate) fn write_response(
        &mut self,
        request: &Header,
        cid: u32,
        completion: Result<(), &PvError>,
    ) -> WireResult<()> {
        let Err(cause) = completion else {
            return Ok(());
        };
        warn!(session = self.id, cid, cause = %cause, "write failed");
        self.send_err_with_status(request, cid, EcaStatus::PUTFAIL, cause)
    }

    /// Access-rights message for channel `cid`, or nothing for clients that
    /// predate it.
    pub(crate) fn access_rights_into(
        &self,
        reservation: &mut Reservation,
        cid: u32,
        rights: AccessRights,
    ) -> WireResult<()> {
        if !supports_access_rights(self.minor_version) {
            return Ok(());
        }
        reservation.push(access_rights_header(cid, rights), &[])
    }

    pub(crate) fn access_rights_response(&mut self, cid: u32, rights: AccessRights) -> WireResult<()> {
        if !supports_access_rights(self.minor_version) {
            return Ok(());
        }
        self.outbuf.push(access_rights_header(cid, rights), &[])
    }

    /// Tell the client a claim failed.
    pub(crate) fn channel_create_failed(&mut self, request: &Header, cause: &PvError) -> HandlerResult {
        if *cause != PvError::NotFound {
            warn!(session = self.id, cid = request.cid, cause = %cause, "server unable to create a new channel");
        }
        if supports_claim_failed(self.minor_version) {
            let header = Header::new(command::CLAIM_CIU_FAILED).with_ids(request.cid, 0);
            respond(self.outbuf.push(header, &[]))
        } else {
            diagnostic(self.send_err_with_status(request, request.cid, EcaStatus::ALLOCMEM, cause))
        }
    }

    /// Announce the server's minor protocol revision.
    pub(crate) fn send_version(&mut self) -> WireResult<()> {
        let header = Header::new(command::VERSION).with_type(0, u32::from(command::MINOR_PROTOCOL_REVISION));
        self.outbuf.push(header, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_echo_truncates_sizes() {
        let request = Header::new(command::READ)
            .with_payload_size(0x1_0010)
            .with_type(6, 3)
            .with_ids(7, 9);
        let mut echo = BytesMut::new();
        encode_echo(&request, false, &mut echo);
        assert_eq!(echo.len(), 16);
        assert_eq!(&echo[2..4], &0x0010u16.to_be_bytes());
    }

    #[test]
    fn test_extended_echo_when_allowed() {
        let request = Header::new(command::WRITE)
            .with_payload_size(0x2_0000)
            .with_type(6, 0x4000)
            .with_ids(7, 9);
        let mut echo = BytesMut::new();
        encode_echo(&request, true, &mut echo);
        assert_eq!(echo.len(), EXTENDED_HEADER_SIZE);
        assert_eq!(&echo[2..4], &[0xff, 0xff]);
        assert_eq!(&echo[6..8], &[0, 0]);
        assert_eq!(&echo[16..20], &0x2_0000u32.to_be_bytes());
        assert_eq!(&echo[20..24], &0x4000u32.to_be_bytes());
    }

    #[test]
    fn test_small_request_never_extended() {
        let request = Header::new(command::READ).with_type(6, 1).with_ids(1, 2);
        let mut echo = BytesMut::new();
        encode_echo(&request, true, &mut echo);
        assert_eq!(echo.len(), 16);
    }

    #[test]
    fn test_string_trim() {
        let mut payload = vec![0u8; 40];
        payload[..5].copy_from_slice(b"hello");
        trim_string_payload(DbrType::STRING, 1, &mut payload);
        assert_eq!(payload, b"hello\0");

        let mut array = vec![0u8; 80];
        trim_string_payload(DbrType::STRING, 2, &mut array);
        assert_eq!(array.len(), 80);

        let mut number = vec![0u8; 8];
        trim_string_payload(DbrType::DOUBLE, 1, &mut number);
        assert_eq!(number.len(), 8);
    }
}
