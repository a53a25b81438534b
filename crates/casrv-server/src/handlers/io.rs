//! Read and write, in their plain and notify variants.

use casrv_wire::command::supports_access_rights;
use casrv_wire::{EcaStatus, Header, Value};

use crate::dispatch::{HandlerResult, Outcome, Request, RetryKey};
use crate::pv::{IoOutcome, PvError};
use crate::response::{diagnostic, respond};
use crate::session::{PendingIo, SessionState};

/// Enum state strings of the channel a completed request targeted.
fn enum_strings_for(s: &SessionState, cid: u32) -> Vec<String> {
    s.channels
        .get(cid)
        .map(|channel| channel.pv().enum_strings())
        .unwrap_or_default()
}

pub(crate) fn read(s: &mut SessionState, request: &Request) -> HandlerResult {
    let header = &request.header;
    let target = match s.verify_request(header) {
        Ok(target) => target,
        Err(rejected) => {
            return diagnostic(s.send_err(
                header,
                rejected.id(),
                rejected.status,
                Some("get request"),
            ));
        }
    };

    if !target.rights.read {
        let status = if supports_access_rights(s.minor_version) {
            EcaStatus::NORDACCESS
        } else {
            EcaStatus::GETFAIL
        };
        return diagnostic(s.send_err(header, target.cid, status, Some("read access denied")));
    }

    match s.call_read(&target, PendingIo::Read { header: *header }) {
        IoOutcome::Done(value) => finish_read(s, header, Ok(value)),
        IoOutcome::Failed(cause) => finish_read(s, header, Err(cause)),
        IoOutcome::Async => Ok(Outcome::Done),
        IoOutcome::Postponed => Ok(Outcome::Postponed(RetryKey::Pv(target.pv))),
    }
}

pub(crate) fn finish_read(
    s: &mut SessionState,
    header: &Header,
    result: Result<Value, PvError>,
) -> HandlerResult {
    let enum_strings = enum_strings_for(s, header.cid);
    respond(s.read_response(header, header.cid, result.as_ref(), &enum_strings))
}

pub(crate) fn read_notify(s: &mut SessionState, request: &Request) -> HandlerResult {
    let header = &request.header;
    let target = match s.verify_request(header) {
        Ok(target) => target,
        Err(rejected) => return respond(s.read_notify_failure(header, rejected.status)),
    };

    if !target.rights.read {
        return respond(s.read_notify_failure(header, EcaStatus::NORDACCESS));
    }

    match s.call_read(&target, PendingIo::ReadNotify { header: *header }) {
        IoOutcome::Done(value) => finish_read_notify(s, header, Ok(value)),
        IoOutcome::Failed(cause) => finish_read_notify(s, header, Err(cause)),
        IoOutcome::Async => Ok(Outcome::Done),
        IoOutcome::Postponed => Ok(Outcome::Postponed(RetryKey::Pv(target.pv))),
    }
}

pub(crate) fn finish_read_notify(
    s: &mut SessionState,
    header: &Header,
    result: Result<Value, PvError>,
) -> HandlerResult {
    let enum_strings = enum_strings_for(s, header.cid);
    respond(s.read_notify_response(header, header.cid, result.as_ref(), &enum_strings))
}

pub(crate) fn write(s: &mut SessionState, request: &Request) -> HandlerResult {
    let header = &request.header;
    let target = match s.verify_request(header) {
        Ok(target) => target,
        Err(rejected) => {
            return diagnostic(s.send_err(
                header,
                rejected.id(),
                rejected.status,
                Some("put request"),
            ));
        }
    };

    if !target.rights.write {
        let status = if supports_access_rights(s.minor_version) {
            EcaStatus::NOWTACCESS
        } else {
            EcaStatus::PUTFAIL
        };
        return diagnostic(s.send_err(header, target.cid, status, Some("write access denied")));
    }

    let value = match s.decode_write(&target, &request.payload) {
        Ok(value) => value,
        Err(cause) => {
            return diagnostic(s.send_err_with_status(header, target.cid, EcaStatus::PUTFAIL, &cause));
        }
    };

    match s.call_write(&target, value, PendingIo::Write { header: *header }) {
        IoOutcome::Done(()) | IoOutcome::Async => Ok(Outcome::Done),
        IoOutcome::Failed(cause) => diagnostic(s.write_response(header, target.cid, Err(&cause))),
        IoOutcome::Postponed => Ok(Outcome::Postponed(RetryKey::Pv(target.pv))),
    }
}

/// Asynchronous write completion; a failure report waits for room.
pub(crate) fn finish_write(
    s: &mut SessionState,
    header: &Header,
    result: Result<(), PvError>,
) -> HandlerResult {
    respond(s.write_response(header, header.cid, result.as_ref().map(|_| ())))
}

pub(crate) fn write_notify(s: &mut SessionState, request: &Request) -> HandlerResult {
    let header = &request.header;
    let target = match s.verify_request(header) {
        Ok(target) => target,
        Err(rejected) => return respond(s.write_notify_status(header, rejected.status)),
    };

    if !target.rights.write {
        if supports_access_rights(s.minor_version) {
            return respond(s.write_notify_status(header, EcaStatus::NOWTACCESS));
        }
        return respond(s.write_notify_response(header, target.cid, Err(&PvError::NoWrite)));
    }

    let value = match s.decode_write(&target, &request.payload) {
        Ok(value) => value,
        Err(cause) => return respond(s.write_notify_response(header, target.cid, Err(&cause))),
    };

    match s.call_write(&target, value, PendingIo::WriteNotify { header: *header }) {
        IoOutcome::Done(()) => finish_write_notify(s, header, Ok(())),
        IoOutcome::Failed(cause) => finish_write_notify(s, header, Err(cause)),
        IoOutcome::Async => Ok(Outcome::Done),
        IoOutcome::Postponed => Ok(Outcome::Postponed(RetryKey::Pv(target.pv))),
    }
}

pub(crate) fn finish_write_notify(
    s: &mut SessionState,
    header: &Header,
    result: Result<(), PvError>,
) -> HandlerResult {
    respond(s.write_notify_response(header, header.cid, result.as_ref().map(|_| ())))
}
