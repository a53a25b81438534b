//! Interfaces to the application that owns process variables.
//!
//! The server never produces or stores values itself. It resolves names
//! through a [`PvServer`] and performs I/O through the [`ProcessVariable`]s it
//! returns. Either side may finish synchronously, ask to be retried later
//! (postponement), or take the [`AsyncIo`] completion handle out of the
//! [`IoContext`] and finish from another thread.

use std::fmt;
use std::sync::Arc;

use casrv_wire::{DbrType, FieldType, Value};
use tracing::warn;

use crate::events::{AsyncResult, EventSender, SessionEvent};

/// Failure reported by the application.
///
/// The display text is forwarded to clients as the diagnostic detail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PvError {
    #[error("process variable not found")]
    NotFound,

    #[error("read access denied")]
    NoRead,

    #[error("write access denied")]
    NoWrite,

    #[error("memory allocation failed")]
    NoMemory,

    #[error("unsupported data type")]
    BadType,

    #[error("no conversion: {0}")]
    NoConvert(String),

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("{0}")]
    Failed(String),
}

/// Read and write permission of one client on one variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessRights {
    pub read: bool,
    pub write: bool,
}

impl AccessRights {
    pub const NONE: Self = Self {
        read: false,
        write: false,
    };
    pub const READ_ONLY: Self = Self {
        read: true,
        write: false,
    };
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
    };

    /// Bits carried by the access-rights message.
    pub fn wire_bits(self) -> u32 {
        let mut bits = 0;
        if self.read {
            bits |= casrv_wire::command::ACCESS_RIGHT_READ;
        }
        if self.write {
            bits |= casrv_wire::command::ACCESS_RIGHT_WRITE;
        }
        bits
    }
}

/// How an I/O request ended when control returned to the server.
#[derive(Debug)]
pub enum IoOutcome<T> {
    /// Completed synchronously.
    Done(T),
    /// Cannot start now; the server retries the request when the variable's
    /// blocked list is released.
    Postponed,
    /// Started; the completion handle taken from the context finishes it.
    Async,
    /// Failed synchronously.
    Failed(PvError),
}

/// How a name lookup ended when control returned to the server.
pub enum AttachOutcome {
    Attached(Arc<dyn ProcessVariable>),
    Postponed,
    Async,
    NotFound,
    Failed(PvError),
}

impl fmt::Debug for AttachOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachOutcome::Attached(pv) => f.debug_tuple("Attached").field(&pv.name()).finish(),
            AttachOutcome::Postponed => f.write_str("Postponed"),
            AttachOutcome::Async => f.write_str("Async"),
            AttachOutcome::NotFound => f.write_str("NotFound"),
            AttachOutcome::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
        }
    }
}

/// What a client asked to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub dbr: DbrType,
    pub count: u32,
}

/// Name resolution for the server.
pub trait PvServer: Send + Sync {
    /// Resolve `name` to a process variable.
    fn attach(&self, ctx: &mut IoContext<'_>, name: &str) -> AttachOutcome;
}

/// A named value the application serves.
pub trait ProcessVariable: Send + Sync {
    fn name(&self) -> &str;

    /// Element type clients should use by default.
    fn best_external_type(&self) -> Result<FieldType, PvError>;

    /// Maximum element count.
    fn native_count(&self) -> u32;

    /// Produce the current value. The server converts it to the requested
    /// buffer type.
    fn read(&self, ctx: &mut IoContext<'_>, request: &ReadRequest) -> IoOutcome<Value>;

    /// Accept a new value, already converted to the native element type.
    fn write(&self, ctx: &mut IoContext<'_>, value: Value) -> IoOutcome<()>;

    /// Refresh the enum state strings.
    fn update_enum_strings(&self, _ctx: &mut IoContext<'_>) -> IoOutcome<Vec<String>> {
        IoOutcome::Done(Vec::new())
    }

    /// Permissions for a client identity.
    fn access_rights(&self, _user: &str, _host: &str) -> AccessRights {
        AccessRights::READ_WRITE
    }
}

/// Per-call context handed to the application.
pub struct IoContext<'a> {
    user: &'a str,
    host: &'a str,
    completion: Option<AsyncIo>,
}

impl<'a> IoContext<'a> {
    pub(crate) fn new(user: &'a str, host: &'a str, completion: AsyncIo) -> Self {
        Self {
            user,
            host,
            completion: Some(completion),
        }
    }

    /// Client user name.
    pub fn user(&self) -> &str {
        self.user
    }

    /// Client host name.
    pub fn host(&self) -> &str {
        self.host
    }

    /// Take the completion handle; the request then has to be reported as
    /// [`IoOutcome::Async`] (or [`AttachOutcome::Async`]).
    pub fn start_async(&mut self) -> Option<AsyncIo> {
        self.completion.take()
    }

    /// Whether the application took the completion handle.
    pub(crate) fn async_started(&self) -> bool {
        self.completion.is_none()
    }
}

impl Drop for IoContext<'_> {
    fn drop(&mut self) {
        // An untaken handle means the request finished synchronously.
        if let Some(mut unused) = self.completion.take() {
            unused.disarm();
        }
    }
}

/// Completion handle for asynchronous I/O.
///
/// Exactly one `complete_*` call finishes the request. Dropping the handle
/// without completing reports a failure so the client is never left waiting.
pub struct AsyncIo {
    events: EventSender,
    request: u64,
    armed: bool,
}

impl AsyncIo {
    pub(crate) fn new(events: EventSender, request: u64) -> Self {
        Self {
            events,
            request,
            armed: true,
        }
    }

    pub fn complete_read(self, result: Result<Value, PvError>) {
        self.deliver(AsyncResult::Read(result));
    }

    pub fn complete_write(self, result: Result<(), PvError>) {
        self.deliver(AsyncResult::Write(result));
    }

    pub fn complete_attach(self, result: Result<Arc<dyn ProcessVariable>, PvError>) {
        self.deliver(AsyncResult::Attach(result));
    }

    pub fn complete_enum_strings(self, result: Result<Vec<String>, PvError>) {
        self.deliver(AsyncResult::EnumStrings(result));
    }

    fn deliver(mut self, result: AsyncResult) {
        self.armed = false;
        self.send(result);
    }

    fn send(&self, result: AsyncResult) {
        let event = SessionEvent::Completion {
            request: self.request,
            result,
        };
        if !self.events.send(event) {
            warn!(
                session = self.events.session_id(),
                request = self.request,
                "asynchronous completion for a closed session"
            );
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AsyncIo {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            self.send(AsyncResult::Abandoned);
        }
    }
}

impl fmt::Debug for AsyncIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncIo")
            .field("session", &self.events.session_id())
            .field("request", &self.request)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_rights_bits() {
        assert_eq!(AccessRights::NONE.wire_bits(), 0);
        assert_eq!(AccessRights::READ_ONLY.wire_bits(), 1);
        assert_eq!(AccessRights::READ_WRITE.wire_bits(), 3);
    }

    #[test]
    fn test_dropped_handle_reports_abandoned() {
        let (events, rx) = EventSender::channel(9);
        drop(AsyncIo::new(events, 4));

        match rx.try_recv().unwrap() {
            SessionEvent::Completion { request, result } => {
                assert_eq!(request, 4);
                assert!(matches!(result, AsyncResult::Abandoned));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_unused_handle_is_silent() {
        let (events, rx) = EventSender::channel(9);
        let ctx = IoContext::new("u", "h", AsyncIo::new(events, 1));
        assert!(!ctx.async_started());
        drop(ctx);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_completed_handle_reports_once() {
        let (events, rx) = EventSender::channel(9);
        let mut ctx = IoContext::new("u", "h", AsyncIo::new(events, 2));
        let io = ctx.start_async().unwrap();
        assert!(ctx.async_started());
        drop(ctx);
        io.complete_write(Ok(()));

        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionEvent::Completion {
                request: 2,
                result: AsyncResult::Write(Ok(()))
            }
        ));
        assert!(rx.try_recv().is_err());
    }
}
