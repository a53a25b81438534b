//! Session event queue and blocked-I/O lists.
//!
//! Everything that reaches a session from outside its own request handling
//! (received bytes, subscription updates, asynchronous completions, channel
//! teardown requested by the application, retry signals) is queued here and
//! applied by the session's worker under the session lock. The circuit
//! reader is throttled by an [`InputGate`] so received bytes the session has
//! not taken yet stay bounded.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};

use casrv_wire::{EpicsTimeStamp, Value};
use tracing::debug;

use crate::channel::Channel;
use crate::config::EventMask;
use crate::pv::{ProcessVariable, PvError};

/// Identifies a session for the lifetime of the server.
pub type SessionId = u64;

/// A value (or failure) posted to subscribers, shared by every receiving session.
pub type PostedValue = Arc<Result<Value, PvError>>;

/// Result delivered by an [`AsyncIo`](crate::pv::AsyncIo) handle.
#[derive(Clone)]
pub enum AsyncResult {
    Read(Result<Value, PvError>),
    Write(Result<(), PvError>),
    Attach(Result<Arc<dyn ProcessVariable>, PvError>),
    EnumStrings(Result<Vec<String>, PvError>),
    /// The handle was dropped without a result.
    Abandoned,
}

impl AsyncResult {
    pub(crate) fn into_read(self) -> Result<Value, PvError> {
        match self {
            AsyncResult::Read(result) => result,
            other => Err(other.unexpected("read")),
        }
    }

    pub(crate) fn into_write(self) -> Result<(), PvError> {
        match self {
            AsyncResult::Write(result) => result,
            other => Err(other.unexpected("write")),
        }
    }

    pub(crate) fn into_attach(self) -> Result<Arc<dyn ProcessVariable>, PvError> {
        match self {
            AsyncResult::Attach(result) => result,
            other => Err(other.unexpected("attach")),
        }
    }

    pub(crate) fn into_enum_strings(self) -> Result<Vec<String>, PvError> {
        match self {
            AsyncResult::EnumStrings(result) => result,
            other => Err(other.unexpected("enum string table")),
        }
    }

    fn unexpected(&self, expected: &str) -> PvError {
        match self {
            AsyncResult::Abandoned => {
                PvError::Failed(format!("asynchronous {expected} abandoned by the application"))
            }
            other => PvError::BadParameter(format!("{expected} completed with {other:?}")),
        }
    }
}

impl fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncResult::Read(r) => f.debug_tuple("Read").field(r).finish(),
            AsyncResult::Write(r) => f.debug_tuple("Write").field(r).finish(),
            AsyncResult::Attach(Ok(pv)) => f.debug_tuple("Attach").field(&pv.name()).finish(),
            AsyncResult::Attach(Err(e)) => f.debug_tuple("Attach").field(e).finish(),
            AsyncResult::EnumStrings(r) => f.debug_tuple("EnumStrings").field(r).finish(),
            AsyncResult::Abandoned => f.write_str("Abandoned"),
        }
    }
}

/// Work queued for a session.
#[derive(Debug)]
pub enum SessionEvent {
    /// Bytes read from the circuit.
    Received {
        bytes: Vec<u8>,
        at: EpicsTimeStamp,
    },
    /// The circuit reached end of stream or failed.
    Closed,
    /// A blocked list this session waited on was released.
    Retry,
    /// The application destroyed a channel. `uninstalled` carries the channel
    /// when it was already removed from the session's tables.
    ChannelDestroyed {
        cid: u32,
        uninstalled: Option<Box<Channel>>,
    },
    /// The application's access policy for `cid` changed.
    RightsChanged { cid: u32 },
    /// A subscription update for every monitor on `cid` selecting `mask`.
    Post {
        cid: u32,
        mask: EventMask,
        update: PostedValue,
    },
    /// An asynchronous request finished.
    Completion { request: u64, result: AsyncResult },
}

/// Sending half of a session's event queue.
#[derive(Debug, Clone)]
pub struct EventSender {
    session: SessionId,
    tx: Sender<SessionEvent>,
}

impl EventSender {
    /// Create a queue for `session`.
    pub fn channel(session: SessionId) -> (Self, Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { session, tx }, rx)
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Queue an event. Returns false once the session is gone.
    pub fn send(&self, event: SessionEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Sessions waiting for a collaborator to accept I/O again.
///
/// Each session appears at most once; releasing the list sends every waiter
/// a [`SessionEvent::Retry`].
#[derive(Debug, Default)]
pub struct IoBlockedList {
    waiters: Mutex<BTreeMap<SessionId, EventSender>>,
}

impl IoBlockedList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, waiter: &EventSender) {
        let mut waiters = lock(&self.waiters);
        waiters
            .entry(waiter.session_id())
            .or_insert_with(|| waiter.clone());
    }

    pub fn remove(&self, session: SessionId) {
        lock(&self.waiters).remove(&session);
    }

    pub fn contains(&self, session: SessionId) -> bool {
        lock(&self.waiters).contains_key(&session)
    }

    pub fn len(&self) -> usize {
        lock(&self.waiters).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake every waiter. Returns how many were signalled.
    pub fn release(&self) -> usize {
        let waiters = std::mem::take(&mut *lock(&self.waiters));
        let mut woken = 0;
        for (session, waiter) in waiters {
            if waiter.send(SessionEvent::Retry) {
                woken += 1;
            } else {
                debug!(session, "blocked session already gone");
            }
        }
        woken
    }
}

#[derive(Debug, Default)]
struct GateState {
    queued: usize,
    closed: bool,
}

/// Byte credit between a circuit reader and its session.
///
/// The reader acquires credit for every chunk before queueing it; the session
/// releases credit as the bytes move into its input buffer. A reader blocks
/// while `limit` bytes are outstanding, except that one chunk is always let
/// through when nothing is queued.
#[derive(Debug)]
pub struct InputGate {
    limit: usize,
    state: Mutex<GateState>,
    space: Condvar,
}

impl InputGate {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            state: Mutex::new(GateState::default()),
            space: Condvar::new(),
        }
    }

    /// Wait for room to queue `len` bytes. Returns false once closed.
    pub fn acquire(&self, len: usize) -> bool {
        let mut state = lock(&self.state);
        while !state.closed && state.queued > 0 && state.queued + len > self.limit {
            state = self
                .space
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        if state.closed {
            return false;
        }
        state.queued += len;
        true
    }

    /// Return credit for bytes the session has taken. Bytes that were
    /// never acquired (fed directly to the session) release nothing.
    pub fn release(&self, len: usize) {
        if len == 0 {
            return;
        }
        let mut state = lock(&self.state);
        state.queued = state.queued.saturating_sub(len);
        self.space.notify_all();
    }

    /// Wake and refuse every reader from now on.
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.space.notify_all();
    }

    /// Bytes acquired but not yet released.
    pub fn queued(&self) -> usize {
        lock(&self.state).queued
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_list_deduplicates_and_releases() {
        let list = IoBlockedList::new();
        let (a, rx_a) = EventSender::channel(1);
        let (b, rx_b) = EventSender::channel(2);

        list.add(&a);
        list.add(&a);
        list.add(&b);
        assert_eq!(list.len(), 2);
        assert!(list.contains(1));

        assert_eq!(list.release(), 2);
        assert!(list.is_empty());
        assert!(matches!(rx_a.try_recv().unwrap(), SessionEvent::Retry));
        assert!(rx_a.try_recv().is_err());
        assert!(matches!(rx_b.try_recv().unwrap(), SessionEvent::Retry));
    }

    #[test]
    fn test_release_skips_closed_sessions() {
        let list = IoBlockedList::new();
        let (a, rx_a) = EventSender::channel(1);
        list.add(&a);
        drop(rx_a);
        assert_eq!(list.release(), 0);
    }

    #[test]
    fn test_mismatched_completion_is_a_failure() {
        let result = AsyncResult::Write(Ok(())).into_read();
        assert!(matches!(result, Err(PvError::BadParameter(_))));

        let result = AsyncResult::Abandoned.into_write();
        assert!(matches!(result, Err(PvError::Failed(_))));

        let strings = AsyncResult::EnumStrings(Ok(vec!["off".into()])).into_enum_strings();
        assert_eq!(strings.unwrap(), vec!["off".to_string()]);
    }

    #[test]
    fn test_gate_blocks_reader_until_released() {
        let gate = Arc::new(InputGate::new(100));
        assert!(gate.acquire(80));
        assert_eq!(gate.queued(), 80);

        let reader = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.acquire(40))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!reader.is_finished());

        gate.release(80);
        assert!(reader.join().unwrap());
        assert_eq!(gate.queued(), 40);
    }

    #[test]
    fn test_gate_admits_oversized_chunk_when_idle() {
        let gate = InputGate::new(10);
        assert!(gate.acquire(64));
        gate.release(1000);
        assert_eq!(gate.queued(), 0);
    }

    #[test]
    fn test_closing_gate_wakes_blocked_reader() {
        let gate = Arc::new(InputGate::new(10));
        assert!(gate.acquire(10));
        let reader = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.acquire(1))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        gate.close();
        assert!(!reader.join().unwrap());
        assert!(gate.is_closed());
        assert!(!gate.acquire(1));
    }

    #[test]
    fn test_remove_waiter() {
        let list = IoBlockedList::new();
        let (a, _rx) = EventSender::channel(1);
        list.add(&a);
        list.remove(1);
        assert!(!list.contains(1));
    }
}
