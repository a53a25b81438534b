//! Session control: version, echo, names, read sync, clear channel and the
//! catch-all for unknown opcodes.

use casrv_wire::command::{self, INVALID_RES_ID};
use casrv_wire::{EcaStatus, Header};
use tracing::{debug, warn};

use crate::dispatch::{HandlerResult, Outcome, Request};
use crate::error::SessionError;
use crate::response::{diagnostic, respond};
use crate::session::SessionState;

/// Priority negotiation is not supported; the message is accepted and
/// ignored.
pub(crate) fn version(_s: &mut SessionState, _request: &Request) -> HandlerResult {
    Ok(Outcome::Done)
}

pub(crate) fn ignore(_s: &mut SessionState, _request: &Request) -> HandlerResult {
    Ok(Outcome::Done)
}

pub(crate) fn echo(s: &mut SessionState, request: &Request) -> HandlerResult {
    respond(s.outbuf.push(request.header, &request.payload))
}

/// Header-only copy of a request, used for confirmations.
fn confirmation(header: &Header) -> Header {
    Header::new(header.command)
        .with_type(header.data_type, header.count)
        .with_ids(header.cid, header.available)
}

pub(crate) fn read_sync(s: &mut SessionState, request: &Request) -> HandlerResult {
    let aborted = s.abort_outstanding_reads();
    if aborted > 0 {
        debug!(session = s.id, aborted, "outstanding reads discarded by read sync");
    }
    respond(s.outbuf.push(confirmation(&request.header), &[]))
}

/// Confirm first, then remove. A missing channel is reported but the session
/// stays up.
pub(crate) fn clear_channel(s: &mut SessionState, request: &Request) -> HandlerResult {
    let header = &request.header;
    if let Ok(Outcome::SendBlocked) = respond(s.outbuf.push(confirmation(header), &[])) {
        return Ok(Outcome::SendBlocked);
    }

    if s.detach_channel(header.cid).is_none() {
        s.log_bad_id(header, EcaStatus::BADCHID, header.cid);
    }
    Ok(Outcome::Done)
}

/// Name carried by a client or host name message.
fn payload_name(payload: &[u8]) -> String {
    let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

pub(crate) fn client_name(s: &mut SessionState, request: &Request) -> HandlerResult {
    let name = payload_name(&request.payload);
    if !s.channels.is_empty() {
        return diagnostic(s.send_err(
            &request.header,
            INVALID_RES_ID,
            EcaStatus::UNAVAILINSERV,
            Some(&name),
        ));
    }
    debug!(session = s.id, user = %name, "client name");
    s.user = name;
    Ok(Outcome::Done)
}

pub(crate) fn host_name(s: &mut SessionState, request: &Request) -> HandlerResult {
    let name = payload_name(&request.payload);
    if !s.channels.is_empty() {
        return diagnostic(s.send_err(
            &request.header,
            INVALID_RES_ID,
            EcaStatus::UNAVAILINSERV,
            Some(&name),
        ));
    }
    debug!(session = s.id, host = %name, "host name");
    s.host = name;
    Ok(Outcome::Done)
}

/// The stream cannot be trusted past an opcode without a handler.
pub(crate) fn unknown(s: &mut SessionState, request: &Request) -> HandlerResult {
    let header = &request.header;
    warn!(
        session = s.id,
        host = %s.host,
        user = %s.user,
        opcode = header.command,
        command = command::command_name(header.command),
        "invalid request code"
    );
    if let Err(err) = s.send_err(header, INVALID_RES_ID, EcaStatus::INTERNAL, Some("Invalid Request Code")) {
        warn!(error = %err, "invalid request code not reported to client");
    }
    Err(SessionError::UnknownCommand(header.command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_name_stops_at_nul() {
        assert_eq!(payload_name(b"ws1\0\0\0\0\0"), "ws1");
        assert_eq!(payload_name(b"plain"), "plain");
        assert_eq!(payload_name(b""), "");
    }

    #[test]
    fn test_confirmation_drops_payload() {
        let header = Header::new(command::READ_SYNC)
            .with_payload_size(8)
            .with_type(1, 2)
            .with_ids(3, 4);
        let echo = confirmation(&header);
        assert_eq!(echo.payload_size, 0);
        assert_eq!(echo.count, 2);
        assert_eq!(echo.available, 4);
    }
}
