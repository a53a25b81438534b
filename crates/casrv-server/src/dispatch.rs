//! Opcode-indexed handler table.
//!
//! Every slot without a handler, and every opcode past the end of the table,
//! resolves to the unknown-command handler, which ends the session.

use std::sync::Arc;

use casrv_wire::command::{self, COMMAND_TABLE_SIZE};
use casrv_wire::Header;

use crate::attachment::PvAttachment;
use crate::error::SessionError;
use crate::handlers::{claim, control, io, subscription};
use crate::session::SessionState;

/// One framed request.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub(crate) header: Header,
    pub(crate) payload: Vec<u8>,
}

/// Where a postponed request waits to be retried.
#[derive(Debug, Clone)]
pub(crate) enum RetryKey {
    /// The server-wide list used by name resolution.
    Attach,
    /// The blocked list of one variable.
    Pv(Arc<PvAttachment>),
}

/// How a handler left its request.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// Handled (possibly with asynchronous completion still to come); the
    /// message is consumed.
    Done,
    /// The collaborator postponed the request; the message stays buffered
    /// and is handled again once the keyed list is released.
    Postponed(RetryKey),
    /// The output buffer had no room; the message stays buffered and is
    /// handled again after a flush.
    SendBlocked,
}

/// A handler's verdict. `Err` ends the session.
pub(crate) type HandlerResult = Result<Outcome, SessionError>;

pub(crate) type Handler = fn(&mut SessionState, &Request) -> HandlerResult;

static HANDLERS: [Option<Handler>; COMMAND_TABLE_SIZE] = [
    Some(control::version),            // VERSION
    Some(subscription::event_add),     // EVENT_ADD
    Some(subscription::event_cancel),  // EVENT_CANCEL
    Some(io::read),                    // READ
    Some(io::write),                   // WRITE
    None,                              // SNAPSHOT
    None,                              // SEARCH
    None,                              // BUILD
    Some(subscription::events_off),    // EVENTS_OFF
    Some(subscription::events_on),     // EVENTS_ON
    Some(control::read_sync),          // READ_SYNC
    None,                              // ERROR
    Some(control::clear_channel),      // CLEAR_CHANNEL
    None,                              // RSRV_IS_UP
    None,                              // NOT_FOUND
    Some(io::read_notify),             // READ_NOTIFY
    Some(control::ignore),             // READ_BUILD
    None,                              // REPEATER_CONFIRM
    Some(claim::claim_channel),        // CLAIM_CIU
    Some(io::write_notify),            // WRITE_NOTIFY
    Some(control::client_name),        // CLIENT_NAME
    Some(control::host_name),          // HOST_NAME
    None,                              // ACCESS_RIGHTS
    Some(control::echo),               // ECHO
    None,                              // REPEATER_REGISTER
    None,                              // SIGNAL
    None,                              // CLAIM_CIU_FAILED
    None,                              // SERVER_DISCONN
];

/// Handler for `command`.
pub(crate) fn lookup(command: u16) -> Handler {
    HANDLERS
        .get(usize::from(command))
        .copied()
        .flatten()
        .unwrap_or(control::unknown)
}

/// Whether `command` has a handler of its own.
pub fn is_implemented(command: u16) -> bool {
    matches!(HANDLERS.get(usize::from(command)), Some(Some(_)))
}

/// Opcodes the server only ever sends.
pub fn is_outbound_only(command: u16) -> bool {
    matches!(
        command,
        command::ERROR | command::ACCESS_RIGHTS | command::CLAIM_CIU_FAILED | command::SERVER_DISCONN
    )
}
