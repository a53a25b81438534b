//! Monitor lifecycle: event add and cancel, events on and off.

use casrv_wire::command::{EVENT_ADD, MON_INFO_MASK_OFFSET};
use casrv_wire::{DbrType, EcaStatus, Header, Value, WireError};
use tracing::{debug, warn};

use crate::config::EventMask;
use crate::dispatch::{HandlerResult, Outcome, Request, RetryKey};
use crate::error::SessionError;
use crate::monitor::Monitor;
use crate::pv::{IoOutcome, PvError};
use crate::response::diagnostic;
use crate::session::{PendingIo, SessionState};

/// Client `DBE_*` bits from an event-add payload; a short payload selects
/// nothing.
fn wire_mask(payload: &[u8]) -> u16 {
    payload
        .get(MON_INFO_MASK_OFFSET..MON_INFO_MASK_OFFSET + 2)
        .map_or(0, |b| u16::from_be_bytes([b[0], b[1]]))
}

pub(crate) fn event_add(s: &mut SessionState, request: &Request) -> HandlerResult {
    let header = &request.header;
    let target = match s.verify_request(header) {
        Ok(target) => target,
        Err(rejected) => {
            return diagnostic(s.send_err(header, rejected.id(), rejected.status, None));
        }
    };

    let requested = wire_mask(&request.payload);
    let mask = s.core.config.event_policy.translate(requested);
    if mask.no_events_selected() {
        let detail = format!("event add req with mask=0X{requested:X}");
        return diagnostic(s.send_err(header, target.cid, EcaStatus::BADMASK, Some(&detail)));
    }

    if !target.rights.read {
        return finish_event_add(s, header, mask, Err(PvError::NoRead));
    }

    let pending = PendingIo::EventAdd {
        header: *header,
        mask,
    };
    match s.call_read(&target, pending) {
        IoOutcome::Done(value) => finish_event_add(s, header, mask, Ok(value)),
        IoOutcome::Failed(cause) => finish_event_add(s, header, mask, Err(cause)),
        IoOutcome::Async => Ok(Outcome::Done),
        IoOutcome::Postponed => Ok(Outcome::Postponed(RetryKey::Pv(target.pv))),
    }
}

/// Send the first update and install the monitor if the client received a
/// value.
pub(crate) fn finish_event_add(
    s: &mut SessionState,
    header: &Header,
    mask: EventMask,
    result: Result<Value, PvError>,
) -> HandlerResult {
    let Some(channel) = s.channels.get(header.cid) else {
        debug!(session = s.id, cid = header.cid, "event add for a removed channel");
        return Ok(Outcome::Done);
    };
    let read_access = channel.rights().read;
    let enum_strings = channel.pv().enum_strings();

    let status = match s.monitor_response(header, header.cid, read_access, result.as_ref(), &enum_strings) {
        Ok(status) => status,
        Err(WireError::SendBlocked { .. }) => return Ok(Outcome::SendBlocked),
        Err(err) => {
            warn!(session = s.id, cid = header.cid, error = %err, "first subscription update dropped");
            return Ok(Outcome::Done);
        }
    };
    if status != EcaStatus::NORMAL {
        return Ok(Outcome::Done);
    }

    let Some(dbr) = DbrType::from_code(header.data_type) else {
        return Ok(Outcome::Done);
    };
    let monitor = Monitor::new(header.available, dbr, header.count, mask);
    if let Some(channel) = s.channels.get_mut(header.cid) {
        if channel.install_monitor(monitor).is_some() {
            debug!(
                session = s.id,
                cid = header.cid,
                subscription = header.available,
                "subscription id reused, previous monitor replaced"
            );
        }
    }
    Ok(Outcome::Done)
}

pub(crate) fn event_cancel(s: &mut SessionState, request: &Request) -> HandlerResult {
    let header = &request.header;
    if !s.channels.contains(header.cid) {
        s.log_bad_id(header, EcaStatus::BADCHID, header.cid);
        return Err(SessionError::BadResourceId { id: header.cid });
    }

    let ack = Header::new(EVENT_ADD)
        .with_type(header.data_type, header.count)
        .with_ids(header.cid, header.available);
    match s.outbuf.push(ack, &[]) {
        Ok(()) => {}
        Err(WireError::SendBlocked { .. }) => return Ok(Outcome::SendBlocked),
        Err(err) => warn!(session = s.id, error = %err, "event cancel acknowledgement dropped"),
    }

    let removed = s
        .channels
        .get_mut(header.cid)
        .and_then(|channel| channel.remove_monitor(header.available));
    if removed.is_none() {
        s.log_bad_id(header, EcaStatus::BADMONID, header.available);
        return Err(SessionError::BadResourceId {
            id: header.available,
        });
    }
    Ok(Outcome::Done)
}

pub(crate) fn events_off(s: &mut SessionState, _request: &Request) -> HandlerResult {
    s.events_enabled = false;
    debug!(session = s.id, "subscription updates held");
    Ok(Outcome::Done)
}

pub(crate) fn events_on(s: &mut SessionState, _request: &Request) -> HandlerResult {
    s.events_enabled = true;
    s.release_held_updates();
    Ok(Outcome::Done)
}
