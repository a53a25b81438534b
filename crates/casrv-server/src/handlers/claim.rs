//! Channel claim: attach a name and confirm the channel to the client.
//!
//! The access-rights message and the confirmation are written into one
//! output reservation. The channel is installed between the two writes and
//! removed again if the confirmation cannot be completed, so a client never
//! sees a confirmation without its rights and the server never keeps a
//! channel the client was not told about.

use std::sync::Arc;

use casrv_wire::command::{self, supports_claim, UNREASONABLE_PV_NAME_SIZE};
use casrv_wire::{EcaStatus, FieldType, Header, WireError, COMPACT_HEADER_SIZE, MESSAGE_ALIGN};
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::dispatch::{HandlerResult, Outcome, Request, RetryKey};
use crate::error::SessionError;
use crate::pv::{AttachOutcome, IoOutcome, ProcessVariable, PvError};
use crate::session::{PendingIo, SessionState};

/// Minor revision announced in a claim; values that do not fit count as 0.
fn claimed_minor_version(available: u32) -> u16 {
    u16::try_from(available)
        .ok()
        .filter(|minor| *minor != u16::MAX)
        .unwrap_or(0)
}

/// Name requested by a claim, or why the request is malformed.
fn claimed_name(header: &Header, payload: &[u8]) -> Result<String, SessionError> {
    if header.payload_size <= 1 {
        return Err(SessionError::BadProtocol("empty channel name"));
    }
    if header.payload_size as usize - 1 > UNREASONABLE_PV_NAME_SIZE {
        return Err(SessionError::BadProtocol("channel name too long"));
    }
    let Some(end) = payload.iter().position(|b| *b == 0) else {
        return Err(SessionError::BadProtocol("channel name not terminated"));
    };
    if end == 0 {
        return Err(SessionError::BadProtocol("empty channel name"));
    }
    Ok(String::from_utf8_lossy(&payload[..end]).into_owned())
}

pub(crate) fn claim_channel(s: &mut SessionState, request: &Request) -> HandlerResult {
    let header = &request.header;
    s.minor_version = claimed_minor_version(header.available);

    if !supports_claim(s.minor_version) {
        let detail = "R3.11 connect sequence from old client was ignored";
        if let Err(err) = s.send_err(header, header.cid, EcaStatus::DEFUNCT, Some(detail)) {
            warn!(error = %err, "legacy client not told why it is disconnected");
        }
        return Err(SessionError::BadProtocol("pre-claim connect sequence"));
    }

    let name = claimed_name(header, &request.payload)?;
    match s.call_attach(&name, PendingIo::Attach { header: *header }) {
        AttachOutcome::Attached(pv) => create_channel(s, header, pv),
        AttachOutcome::Async => Ok(Outcome::Done),
        AttachOutcome::Postponed => Ok(Outcome::Postponed(RetryKey::Attach)),
        AttachOutcome::NotFound => s.channel_create_failed(header, &PvError::NotFound),
        AttachOutcome::Failed(cause) => s.channel_create_failed(header, &cause),
    }
}

pub(crate) fn finish_attach(
    s: &mut SessionState,
    header: &Header,
    result: Result<Arc<dyn ProcessVariable>, PvError>,
) -> HandlerResult {
    match result {
        Ok(pv) => create_channel(s, header, pv),
        Err(cause) => s.channel_create_failed(header, &cause),
    }
}

/// Build the channel for an attached variable. Enumerated variables get
/// their state strings refreshed before the client hears about the channel.
fn create_channel(
    s: &mut SessionState,
    header: &Header,
    pv: Arc<dyn ProcessVariable>,
) -> HandlerResult {
    let attachment = s.core.attachment_for(pv);
    let native_type = match attachment.pv().best_external_type() {
        Ok(native_type) => native_type,
        Err(cause) => return s.channel_create_failed(header, &cause),
    };
    let rights = attachment.pv().access_rights(&s.user, &s.host);
    let sid = s.allocate_sid();

    if native_type == FieldType::Enum {
        let (outcome, request) = s.call_enum_strings(&attachment);
        match outcome {
            IoOutcome::Done(strings) => attachment.set_enum_strings(strings),
            IoOutcome::Async => {
                let pending = PendingIo::EnumStrings {
                    header: *header,
                    sid,
                    pv: Arc::clone(&attachment),
                    rights,
                    native_type,
                };
                s.park(request, pending);
                return Ok(Outcome::Done);
            }
            IoOutcome::Postponed => {
                warn!(
                    pv = attachment.name(),
                    "postponed enum string table refresh not supported, using cached strings"
                );
            }
            IoOutcome::Failed(cause) => return s.channel_create_failed(header, &cause),
        }
    }

    let channel = Channel::new(header.cid, sid, attachment, rights, native_type);
    confirm_channel(s, header, channel)
}

pub(crate) fn finish_enum_strings(
    s: &mut SessionState,
    header: &Header,
    channel: Channel,
    result: Result<Vec<String>, PvError>,
) -> HandlerResult {
    match result {
        Ok(strings) => {
            channel.pv().set_enum_strings(strings);
            confirm_channel(s, header, channel)
        }
        Err(cause) => s.channel_create_failed(header, &cause),
    }
}

/// Output reserved for the access-rights message and the confirmation.
const CLAIM_REPLY_SIZE: usize = 2 * COMPACT_HEADER_SIZE + MESSAGE_ALIGN;

fn confirm_channel(s: &mut SessionState, header: &Header, channel: Channel) -> HandlerResult {
    confirm_channel_in(s, header, channel, CLAIM_REPLY_SIZE)
}

/// Send access rights and the confirmation as one unit within `reserve`
/// bytes, installing the channel in between.
pub(crate) fn confirm_channel_in(
    s: &mut SessionState,
    header: &Header,
    channel: Channel,
    reserve: usize,
) -> HandlerResult {
    let mut reservation = match s.outbuf.reserve(reserve) {
        Ok(reservation) => reservation,
        Err(WireError::SendBlocked { .. }) => return Ok(Outcome::SendBlocked),
        Err(err) => return s.channel_create_failed(header, &PvError::Failed(err.to_string())),
    };

    let cid = channel.cid();
    let sid = channel.sid();
    let rights = channel.rights();
    let confirm = Header::new(command::CLAIM_CIU)
        .with_type(channel.native_type().dbr_code(), channel.native_count())
        .with_ids(cid, sid);
    let pv = Arc::clone(channel.pv());

    if let Err(err) = s.access_rights_into(&mut reservation, cid, rights) {
        return s.channel_create_failed(header, &PvError::Failed(err.to_string()));
    }

    if s.channels.insert(cid, channel).is_err() {
        warn!(session = s.id, cid, pv = pv.name(), "client reused a channel id");
        let cause = PvError::BadParameter(format!("channel id {cid} already in use"));
        return s.channel_create_failed(header, &cause);
    }
    pv.install(s.handle.clone(), cid);

    let committed = match reservation.push(confirm, &[]) {
        Ok(()) => s.outbuf.commit(reservation).map(|_| ()),
        Err(err) => Err(err),
    };
    if let Err(err) = committed {
        s.detach_channel(cid);
        return s.channel_create_failed(header, &PvError::Failed(err.to_string()));
    }

    debug!(
        session = s.id,
        cid,
        sid,
        pv = pv.name(),
        read = rights.read,
        write = rights.write,
        "channel created"
    );
    Ok(Outcome::Done)
}
