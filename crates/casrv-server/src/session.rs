//! Stream session: one client's virtual circuit.
//!
//! All mutable per-client state lives in [`SessionState`] behind a single
//! mutex. The circuit worker applies queued [`SessionEvent`]s under that lock
//! and flushes the output buffer between them; nothing else mutates the
//! state. Other threads reach a session only through its [`SessionHandle`].
//!
//! Output that cannot be buffered is never dropped. A request stays in the
//! input buffer, a finished asynchronous request or a channel notice waits in
//! the session's backlog, and a subscription update is held on its monitor
//! (only the latest one per monitor). Once a flush empties the output buffer
//! the backlog goes first, then held updates, then buffered requests.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{Arc, Mutex, TryLockError, Weak};

use casrv_wire::command::{self, supports_server_disconnect, INVALID_RES_ID};
use bytes::{Buf, BytesMut};
use casrv_wire::{
    decode_put, DbrType, EcaStatus, EpicsTimeStamp, FieldType, Framed, Header, InBuf, OutBuf,
    Value, WireError,
};
use tracing::{debug, info, trace, warn};

use crate::attachment::PvAttachment;
use crate::channel::Channel;
use crate::config::EventMask;
use crate::dispatch::{self, Outcome, Request, RetryKey};
use crate::error::{ServerError, SessionError};
use crate::events::{
    lock, AsyncResult, EventSender, InputGate, PostedValue, SessionEvent, SessionId,
};
use crate::handlers;
use crate::pv::{AccessRights, AsyncIo, AttachOutcome, IoContext, IoOutcome, PvError, ReadRequest};
use crate::resource::ResourceTable;
use crate::server::ServerCore;

/// Bytes of payload shown by the request dump.
const DUMP_PREVIEW_BYTES: usize = 16;

/// What the message being handled refers to.
#[derive(Debug, Default)]
pub(crate) struct MessageContext {
    pub(crate) header: Option<Header>,
    pub(crate) channel: Option<u32>,
    pub(crate) pv: Option<Arc<PvAttachment>>,
}

impl MessageContext {
    fn reset(&mut self, header: Header) {
        self.header = Some(header);
        self.channel = None;
        self.pv = None;
    }
}

/// A request that passed channel, type and count validation.
#[derive(Debug, Clone)]
pub(crate) struct Verified {
    pub(crate) cid: u32,
    pub(crate) pv: Arc<PvAttachment>,
    pub(crate) dbr: DbrType,
    pub(crate) count: u32,
    pub(crate) rights: AccessRights,
    pub(crate) native_type: FieldType,
}

/// Why validation failed. `cid` is set once the channel was found.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Rejected {
    pub(crate) status: EcaStatus,
    pub(crate) cid: Option<u32>,
}

impl Rejected {
    /// Resource id to report the failure against.
    pub(crate) fn id(&self) -> u32 {
        self.cid.unwrap_or(INVALID_RES_ID)
    }
}

/// Asynchronous work the session still expects a completion for.
#[derive(Debug)]
pub(crate) enum PendingIo {
    Read { header: Header },
    ReadNotify { header: Header },
    Write { header: Header },
    WriteNotify { header: Header },
    EventAdd { header: Header, mask: EventMask },
    Attach { header: Header },
    /// Claim of an enumerated variable waiting for its state strings.
    EnumStrings {
        header: Header,
        sid: u32,
        pv: Arc<PvAttachment>,
        rights: AccessRights,
        native_type: FieldType,
    },
}

impl PendingIo {
    /// Installed channel the request targets.
    fn channel(&self) -> Option<u32> {
        match self {
            PendingIo::Read { header }
            | PendingIo::ReadNotify { header }
            | PendingIo::Write { header }
            | PendingIo::WriteNotify { header }
            | PendingIo::EventAdd { header, .. } => Some(header.cid),
            PendingIo::Attach { .. } | PendingIo::EnumStrings { .. } => None,
        }
    }

    fn is_read(&self) -> bool {
        matches!(
            self,
            PendingIo::Read { .. } | PendingIo::ReadNotify { .. } | PendingIo::EventAdd { .. }
        )
    }
}

/// Output waiting for room in the output buffer, sent in queue order.
#[derive(Debug)]
enum Deferred {
    Completion {
        request: u64,
        pending: PendingIo,
        result: AsyncResult,
    },
    AccessRights { cid: u32 },
    ServerDisconnect { cid: u32 },
}

impl Deferred {
    /// Installed channel whose removal makes this entry moot.
    fn channel(&self) -> Option<u32> {
        match self {
            Deferred::Completion { pending, .. } => pending.channel(),
            Deferred::AccessRights { cid } => Some(*cid),
            Deferred::ServerDisconnect { .. } => None,
        }
    }
}

/// Mutable state of one session. Only touched under the session lock.
pub(crate) struct SessionState {
    pub(crate) id: SessionId,
    pub(crate) core: Arc<ServerCore>,
    pub(crate) handle: SessionHandle,
    pub(crate) inbuf: InBuf,
    pub(crate) outbuf: OutBuf,
    pub(crate) channels: ResourceTable<Channel>,
    pub(crate) minor_version: u16,
    pub(crate) user: String,
    pub(crate) host: String,
    pub(crate) last_recv: EpicsTimeStamp,
    pub(crate) events_enabled: bool,
    pub(crate) ctx: MessageContext,
    pub(crate) peer: Option<SocketAddr>,
    next_sid: u32,
    next_request: u64,
    pending: HashMap<u64, PendingIo>,
    backlog: VecDeque<Deferred>,
    pending_input: BytesMut,
    input_gate: Arc<InputGate>,
    waiting: Option<RetryKey>,
    send_blocked: bool,
    closing: Option<SessionError>,
}

impl SessionState {
    fn new(core: Arc<ServerCore>, handle: SessionHandle, peer: Option<SocketAddr>) -> Self {
        let inbuf = InBuf::new(core.config.in_buf_config());
        let outbuf = OutBuf::new(core.config.out_buf_config());
        let input_gate = Arc::new(InputGate::new(core.config.large_buffer_size()));
        Self {
            id: handle.id,
            core,
            handle,
            inbuf,
            outbuf,
            channels: ResourceTable::new(),
            minor_version: 0,
            user: String::new(),
            host: String::new(),
            last_recv: EpicsTimeStamp::now(),
            events_enabled: true,
            ctx: MessageContext::default(),
            peer,
            next_sid: 1,
            next_request: 1,
            pending: HashMap::new(),
            backlog: VecDeque::new(),
            pending_input: BytesMut::new(),
            input_gate,
            waiting: None,
            send_blocked: false,
            closing: None,
        }
    }

    fn is_blocked(&self) -> bool {
        self.waiting.is_some() || self.send_blocked || self.closing.is_some()
    }

    /// Move received bytes into the input buffer as room allows and handle
    /// what they complete. Bytes that do not fit stay queued, and their gate
    /// credit stays taken, until the session can make progress again.
    fn take_input(&mut self) -> Result<(), SessionError> {
        loop {
            let taken = self.inbuf.extend(&self.pending_input);
            self.pending_input.advance(taken);
            self.input_gate.release(taken);

            let present = self.inbuf.bytes_present();
            self.process_input()?;
            if self.pending_input.is_empty() || self.is_blocked() {
                return Ok(());
            }
            if self.inbuf.room() == 0 && self.inbuf.bytes_present() == present {
                return Ok(());
            }
        }
    }

    /// Frame and handle buffered messages until input runs out, a request
    /// has to wait, or the session fails.
    pub(crate) fn process_input(&mut self) -> Result<(), SessionError> {
        if self.is_blocked() {
            return Ok(());
        }

        loop {
            match self.inbuf.next_message() {
                Framed::NeedMore => return Ok(()),
                Framed::TooLarge { header, total } => {
                    warn!(
                        session = self.id,
                        command = command::command_name(header.command),
                        total,
                        capacity = self.inbuf.capacity(),
                        "request does not fit the input buffer, draining"
                    );
                    let detail = "client's request didnt fit within the CA server's message buffer";
                    if let Err(err) =
                        self.send_err(&header, INVALID_RES_ID, EcaStatus::TOLARGE, Some(detail))
                    {
                        warn!(error = %err, "too-large diagnostic not sent to client");
                    }
                    self.inbuf.start_drain(total);
                }
                Framed::Message { header, header_len } => {
                    self.ctx.reset(header);
                    let request = self.copy_request(header, header_len)?;
                    if self.core.config.dump_requests {
                        self.dump_request(&request);
                    }

                    let handler = dispatch::lookup(header.command);
                    match handler(self, &request)? {
                        Outcome::Done => {
                            self.inbuf
                                .consume(header_len + header.payload_size as usize);
                            if self.send_blocked {
                                return Ok(());
                            }
                        }
                        Outcome::Postponed(key) => {
                            self.wait_on(key);
                            return Ok(());
                        }
                        Outcome::SendBlocked => {
                            trace!(session = self.id, "output full, request kept for retry");
                            self.send_blocked = true;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn copy_request(&self, header: Header, header_len: usize) -> Result<Request, SessionError> {
        let src = self.inbuf.payload(&header, header_len);
        let mut payload = Vec::new();
        payload
            .try_reserve_exact(src.len())
            .map_err(|_| SessionError::NoMemory)?;
        payload.extend_from_slice(src);
        Ok(Request { header, payload })
    }

    fn dump_request(&self, request: &Request) {
        let preview = request
            .payload
            .iter()
            .take(DUMP_PREVIEW_BYTES)
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        debug!(
            session = self.id,
            host = %self.host,
            user = %self.user,
            command = command::command_name(request.header.command),
            opcode = request.header.command,
            payload_size = request.header.payload_size,
            data_type = request.header.data_type,
            count = request.header.count,
            cid = request.header.cid,
            available = request.header.available,
            payload = %preview,
            "request"
        );
    }

    /// Park the session until `key`'s blocked list is released.
    fn wait_on(&mut self, key: RetryKey) {
        match &key {
            RetryKey::Attach => self.core.attach_blocked.add(self.handle.events()),
            RetryKey::Pv(pv) => {
                pv.blocked().add(self.handle.events());
                debug!(session = self.id, pv = pv.name(), "request postponed");
            }
        }
        self.waiting = Some(key);
    }

    /// Apply one queued event under the processing boundary.
    pub(crate) fn apply(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        if let Some(reason) = &self.closing {
            return Err(reason.clone());
        }
        self.run_guarded(|state| state.apply_event(event))
    }

    /// Run `f`, turning panics into internal faults. Any error is reported
    /// to the client when it has a status and marks the session closing.
    fn run_guarded<F>(&mut self, f: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut Self) -> Result<(), SessionError>,
    {
        let result = match panic::catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(result) => result,
            Err(payload) => Err(SessionError::Internal(panic_message(payload.as_ref()))),
        };
        if let Err(reason) = &result {
            self.fail(reason);
        }
        result
    }

    fn fail(&mut self, reason: &SessionError) {
        if let Some(status) = reason.eca_status() {
            let header = self.ctx.header.unwrap_or_else(|| Header::new(command::VERSION));
            let detail = match reason {
                SessionError::NoMemory => {
                    "inability to allocate memory in the server disconnected client".to_string()
                }
                other => format!("{other} in the server disconnected client"),
            };
            if let Err(err) = self.send_err(&header, INVALID_RES_ID, status, Some(&detail)) {
                warn!(error = %err, "fault diagnostic not sent to client");
            }
        }

        match reason {
            SessionError::Closed => debug!(session = self.id, "circuit closed by client"),
            other => warn!(
                session = self.id,
                host = %self.host,
                user = %self.user,
                channel = ?self.ctx.channel,
                pv = self.ctx.pv.as_ref().map(|pv| pv.name()),
                reason = %other,
                "disconnecting client"
            ),
        }
        self.closing = Some(reason.clone());
        self.input_gate.close();
    }

    fn apply_event(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        match event {
            SessionEvent::Received { bytes, at } => {
                self.last_recv = at;
                self.pending_input.extend_from_slice(&bytes);
                self.take_input()
            }
            SessionEvent::Closed => Err(SessionError::Closed),
            SessionEvent::Retry => {
                self.waiting = None;
                self.take_input()
            }
            SessionEvent::ChannelDestroyed { cid, uninstalled } => {
                self.channel_destroyed(cid, uninstalled.map(|channel| *channel))
            }
            SessionEvent::RightsChanged { cid } => {
                self.refresh_access_rights(cid);
                Ok(())
            }
            SessionEvent::Post { cid, mask, update } => {
                self.deliver_post(cid, mask, &update);
                Ok(())
            }
            SessionEvent::Completion { request, result } => {
                self.complete_io(request, result)?;
                self.take_input()
            }
        }
    }

    /// Resume after the output buffer was flushed.
    fn resume(&mut self) -> Result<(), SessionError> {
        self.send_blocked = false;
        self.run_guarded(Self::drain_backlog)
    }

    /// Send what waited for room: the backlog in order, then held
    /// subscription updates, then the buffered requests.
    fn drain_backlog(&mut self) -> Result<(), SessionError> {
        while !self.send_blocked {
            let Some(deferred) = self.backlog.pop_front() else {
                break;
            };
            match deferred {
                Deferred::Completion {
                    request,
                    pending,
                    result,
                } => self.finish_io(request, pending, result)?,
                Deferred::AccessRights { cid } => self.send_access_rights(cid),
                Deferred::ServerDisconnect { cid } => self.send_server_disconnect(cid),
            }
        }
        if !self.send_blocked && self.events_enabled {
            self.release_held_updates();
        }
        self.take_input()
    }

    /// Park output until the next flush. Output that was already blocked
    /// joins the back of the backlog; output just taken from its head goes
    /// back there.
    fn defer(&mut self, deferred: Deferred, was_blocked: bool) {
        self.send_blocked = true;
        if was_blocked {
            self.backlog.push_back(deferred);
        } else {
            self.backlog.push_front(deferred);
        }
    }

    /// Resolve the request's channel and validate its type and count.
    pub(crate) fn verify_request(&mut self, header: &Header) -> Result<Verified, Rejected> {
        let Some(channel) = self.channels.get(header.cid) else {
            return Err(Rejected {
                status: EcaStatus::BADCHID,
                cid: None,
            });
        };
        let cid = Some(channel.cid());
        let Some(dbr) = DbrType::from_code(header.data_type) else {
            return Err(Rejected {
                status: EcaStatus::BADTYPE,
                cid,
            });
        };
        if header.count == 0 || header.count > channel.native_count() {
            return Err(Rejected {
                status: EcaStatus::BADCOUNT,
                cid,
            });
        }

        let verified = Verified {
            cid: channel.cid(),
            pv: Arc::clone(channel.pv()),
            dbr,
            count: header.count,
            rights: channel.rights(),
            native_type: channel.native_type(),
        };
        self.ctx.channel = Some(verified.cid);
        self.ctx.pv = Some(Arc::clone(&verified.pv));
        Ok(verified)
    }

    /// Read through the application. `pending` is kept if it completes
    /// asynchronously.
    pub(crate) fn call_read(&mut self, target: &Verified, pending: PendingIo) -> IoOutcome<Value> {
        let request = self.allocate_request();
        let read = ReadRequest {
            dbr: target.dbr,
            count: target.count,
        };
        let (outcome, started) = {
            let mut ctx = IoContext::new(&self.user, &self.host, self.async_io(request));
            let outcome = target.pv.pv().read(&mut ctx, &read);
            (outcome, ctx.async_started())
        };

        let outcome = reconcile(outcome, started, "read", target.pv.name());
        if matches!(outcome, IoOutcome::Async) {
            if let Some(channel) = self.channels.get_mut(target.cid) {
                channel.add_outstanding_read(request);
            }
            self.pending.insert(request, pending);
        }
        outcome
    }

    /// Write through the application.
    pub(crate) fn call_write(
        &mut self,
        target: &Verified,
        value: Value,
        pending: PendingIo,
    ) -> IoOutcome<()> {
        let request = self.allocate_request();
        let (outcome, started) = {
            let mut ctx = IoContext::new(&self.user, &self.host, self.async_io(request));
            let outcome = target.pv.pv().write(&mut ctx, value);
            (outcome, ctx.async_started())
        };

        let outcome = reconcile(outcome, started, "write", target.pv.name());
        if matches!(outcome, IoOutcome::Async) {
            self.pending.insert(request, pending);
        }
        outcome
    }

    /// Resolve a name through the application's server.
    pub(crate) fn call_attach(&mut self, name: &str, pending: PendingIo) -> AttachOutcome {
        let request = self.allocate_request();
        let core = Arc::clone(&self.core);
        let (outcome, started) = {
            let mut ctx = IoContext::new(&self.user, &self.host, self.async_io(request));
            let outcome = core.pv_server.attach(&mut ctx, name);
            (outcome, ctx.async_started())
        };

        let outcome = match (outcome, started) {
            (AttachOutcome::Async, true) => AttachOutcome::Async,
            (other, true) => {
                warn!(pv = name, returned = ?other, "application started asynchronous attach but did not report it");
                AttachOutcome::Async
            }
            (AttachOutcome::Async, false) => {
                warn!(pv = name, "application reported asynchronous attach without starting it");
                AttachOutcome::Failed(PvError::BadParameter(
                    "asynchronous attach was not started".into(),
                ))
            }
            (other, false) => other,
        };
        if matches!(outcome, AttachOutcome::Async) {
            self.pending.insert(request, pending);
        }
        outcome
    }

    /// Refresh the enum state strings of `pv`. Returns the request id to
    /// [`park`](Self::park) the claim under if it completes asynchronously.
    pub(crate) fn call_enum_strings(&mut self, pv: &PvAttachment) -> (IoOutcome<Vec<String>>, u64) {
        let request = self.allocate_request();
        let (outcome, started) = {
            let mut ctx = IoContext::new(&self.user, &self.host, self.async_io(request));
            let outcome = pv.pv().update_enum_strings(&mut ctx);
            (outcome, ctx.async_started())
        };
        (reconcile(outcome, started, "enum string table", pv.name()), request)
    }

    /// Keep `pending` until request `request` completes.
    pub(crate) fn park(&mut self, request: u64, pending: PendingIo) {
        self.pending.insert(request, pending);
    }

    /// Convert a write payload to the variable's element type, stamped with
    /// the time the request arrived.
    pub(crate) fn decode_write(&self, target: &Verified, payload: &[u8]) -> Result<Value, PvError> {
        if target.dbr.is_compound() {
            return Err(PvError::BadType);
        }
        let data = decode_put(
            target.dbr,
            target.count,
            payload,
            target.native_type,
            &target.pv.enum_strings(),
        )
        .map_err(|err| PvError::NoConvert(err.to_string()))?;
        Ok(Value::new(data).with_stamp(self.last_recv))
    }

    fn async_io(&self, request: u64) -> AsyncIo {
        AsyncIo::new(self.handle.events().clone(), request)
    }

    fn allocate_request(&mut self) -> u64 {
        let request = self.next_request;
        self.next_request = self.next_request.wrapping_add(1);
        request
    }

    pub(crate) fn allocate_sid(&mut self) -> u32 {
        let sid = self.next_sid;
        self.next_sid = self.next_sid.wrapping_add(1).max(1);
        sid
    }

    /// Drop every asynchronous read still in flight on any channel.
    pub(crate) fn abort_outstanding_reads(&mut self) -> usize {
        let aborted: Vec<u64> = self
            .channels
            .iter_mut()
            .flat_map(Channel::clear_outstanding_reads)
            .collect();
        for request in &aborted {
            self.pending.remove(request);
        }
        aborted.len()
    }

    /// Remove `cid` from the table and from its variable.
    pub(crate) fn detach_channel(&mut self, cid: u32) -> Option<Channel> {
        let channel = self.channels.remove(cid)?;
        self.uninstall(&channel);
        Some(channel)
    }

    pub(crate) fn uninstall(&mut self, channel: &Channel) {
        channel.pv().uninstall(self.id, channel.cid());
        self.pending
            .retain(|_, pending| pending.channel() != Some(channel.cid()));
        self.backlog
            .retain(|deferred| deferred.channel() != Some(channel.cid()));
        debug!(
            session = self.id,
            cid = channel.cid(),
            sid = channel.sid(),
            pv = channel.pv().name(),
            "channel removed"
        );
    }

    fn channel_destroyed(
        &mut self,
        cid: u32,
        uninstalled: Option<Channel>,
    ) -> Result<(), SessionError> {
        let pre_uninstalled = uninstalled.is_some();
        if !pre_uninstalled && !self.channels.contains(cid) {
            return Ok(());
        }

        if !supports_server_disconnect(self.minor_version) {
            return Err(SessionError::ForcedDisconnect);
        }
        if !pre_uninstalled {
            self.detach_channel(cid);
        }
        self.send_server_disconnect(cid);
        Ok(())
    }

    fn send_server_disconnect(&mut self, cid: u32) {
        if self.send_blocked {
            self.defer(Deferred::ServerDisconnect { cid }, true);
            return;
        }
        let header = Header::new(command::SERVER_DISCONN).with_ids(cid, 0);
        match self.outbuf.push(header, &[]) {
            Ok(()) => {}
            Err(WireError::SendBlocked { .. }) => {
                self.defer(Deferred::ServerDisconnect { cid }, false);
            }
            Err(err) => {
                warn!(session = self.id, cid, error = %err, "channel disconnect not sent to client");
            }
        }
    }

    fn refresh_access_rights(&mut self, cid: u32) {
        let Some(channel) = self.channels.get_mut(cid) else {
            debug!(session = self.id, cid, "access rights change for a removed channel");
            return;
        };
        let rights = channel.pv().pv().access_rights(&self.user, &self.host);
        channel.set_rights(rights);
        self.send_access_rights(cid);
    }

    /// Send the current rights of `cid`, if it still exists.
    fn send_access_rights(&mut self, cid: u32) {
        let Some(rights) = self.channels.get(cid).map(Channel::rights) else {
            return;
        };
        if self.send_blocked {
            self.defer(Deferred::AccessRights { cid }, true);
            return;
        }
        match self.access_rights_response(cid, rights) {
            Ok(()) => {}
            Err(WireError::SendBlocked { .. }) => {
                self.defer(Deferred::AccessRights { cid }, false);
            }
            Err(err) => {
                warn!(session = self.id, cid, error = %err, "access rights update not sent to client");
            }
        }
    }

    fn deliver_post(&mut self, cid: u32, mask: EventMask, update: &PostedValue) {
        let enabled = self.events_enabled && !self.send_blocked;
        let Some(channel) = self.channels.get_mut(cid) else {
            trace!(session = self.id, cid, "update for a removed channel");
            return;
        };
        let read_access = channel.rights().read;
        let enum_strings = channel.pv().enum_strings();

        let mut headers = Vec::new();
        for monitor in channel.monitors_mut().filter(|m| m.selects(mask)) {
            if enabled {
                headers.push(monitor.update_header());
            } else {
                monitor.hold(Arc::clone(update));
            }
        }
        for header in headers {
            self.send_update(&header, cid, read_access, update, &enum_strings);
        }
    }

    /// Send every held update. Updates that still do not fit are held again.
    pub(crate) fn release_held_updates(&mut self) {
        let mut held = Vec::new();
        for channel in self.channels.iter_mut() {
            let cid = channel.cid();
            let read_access = channel.rights().read;
            let enum_strings = channel.pv().enum_strings();
            for monitor in channel.monitors_mut() {
                if let Some(update) = monitor.take_held() {
                    held.push((monitor.update_header(), cid, read_access, update, enum_strings.clone()));
                }
            }
        }
        for (header, cid, read_access, update, enum_strings) in held {
            self.send_update(&header, cid, read_access, &update, &enum_strings);
        }
    }

    fn send_update(
        &mut self,
        header: &Header,
        cid: u32,
        read_access: bool,
        update: &PostedValue,
        enum_strings: &[String],
    ) {
        let blocked = self.send_blocked
            || match self.monitor_response(header, cid, read_access, (**update).as_ref(), enum_strings) {
                Ok(_) => false,
                Err(WireError::SendBlocked { .. }) => true,
                Err(err) => {
                    warn!(
                        session = self.id,
                        cid,
                        subscription = header.available,
                        error = %err,
                        "subscription update dropped"
                    );
                    false
                }
            };
        if !blocked {
            return;
        }

        self.send_blocked = true;
        let monitor = self
            .channels
            .get_mut(cid)
            .and_then(|channel| channel.monitor_mut(header.available));
        if let Some(monitor) = monitor {
            trace!(session = self.id, cid, subscription = header.available, "output full, update held");
            monitor.hold(Arc::clone(update));
        }
    }

    fn complete_io(&mut self, request: u64, result: AsyncResult) -> Result<(), SessionError> {
        let Some(pending) = self.pending.remove(&request) else {
            debug!(session = self.id, request, "completion for a request no longer pending");
            return Ok(());
        };
        if pending.is_read() {
            if let Some(channel) = pending.channel().and_then(|cid| self.channels.get_mut(cid)) {
                channel.finish_read(request);
            }
        }

        if self.send_blocked {
            trace!(session = self.id, request, "output full, completion queued");
            let deferred = Deferred::Completion {
                request,
                pending,
                result,
            };
            self.defer(deferred, true);
            return Ok(());
        }
        self.finish_io(request, pending, result)
    }

    /// Send the response of a finished request. It goes back to the head of
    /// the backlog if the output buffer is full.
    fn finish_io(
        &mut self,
        request: u64,
        pending: PendingIo,
        result: AsyncResult,
    ) -> Result<(), SessionError> {
        let outcome = match &pending {
            PendingIo::Read { header } => {
                handlers::io::finish_read(self, header, result.clone().into_read())
            }
            PendingIo::ReadNotify { header } => {
                handlers::io::finish_read_notify(self, header, result.clone().into_read())
            }
            PendingIo::Write { header } => {
                handlers::io::finish_write(self, header, result.clone().into_write())
            }
            PendingIo::WriteNotify { header } => {
                handlers::io::finish_write_notify(self, header, result.clone().into_write())
            }
            PendingIo::EventAdd { header, mask } => handlers::subscription::finish_event_add(
                self,
                header,
                *mask,
                result.clone().into_read(),
            ),
            PendingIo::Attach { header } => {
                handlers::claim::finish_attach(self, header, result.clone().into_attach())
            }
            PendingIo::EnumStrings {
                header,
                sid,
                pv,
                rights,
                native_type,
            } => {
                let channel = Channel::new(header.cid, *sid, Arc::clone(pv), *rights, *native_type);
                handlers::claim::finish_enum_strings(
                    self,
                    header,
                    channel,
                    result.clone().into_enum_strings(),
                )
            }
        };
        match outcome? {
            Outcome::Done => {}
            Outcome::SendBlocked => {
                trace!(session = self.id, request, "output full, completion kept for retry");
                let deferred = Deferred::Completion {
                    request,
                    pending,
                    result,
                };
                self.defer(deferred, false);
            }
            Outcome::Postponed(_) => {
                warn!(session = self.id, request, "asynchronous completion cannot be postponed");
            }
        }
        Ok(())
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.input_gate.close();
        for channel in self.channels.drain() {
            channel.pv().uninstall(self.id, channel.cid());
        }
        self.core.attach_blocked.remove(self.id);
        if let Some(RetryKey::Pv(pv)) = &self.waiting {
            pv.blocked().remove(self.id);
        }
        self.core.forget_session(self.id);
        debug!(session = self.id, "session destroyed");
    }
}

/// Settle disagreement between what the application returned and whether it
/// took the completion handle.
fn reconcile<T>(outcome: IoOutcome<T>, started: bool, what: &str, pv: &str) -> IoOutcome<T> {
    match (outcome, started) {
        (IoOutcome::Async, true) => IoOutcome::Async,
        (other, true) => {
            warn!(pv, kind = outcome_name(&other), "application started asynchronous {what} but did not report it");
            IoOutcome::Async
        }
        (IoOutcome::Async, false) => {
            warn!(pv, "application reported asynchronous {what} without starting it");
            IoOutcome::Failed(PvError::BadParameter(format!(
                "asynchronous {what} was not started"
            )))
        }
        (other, false) => other,
    }
}

fn outcome_name<T>(outcome: &IoOutcome<T>) -> &'static str {
    match outcome {
        IoOutcome::Done(_) => "done",
        IoOutcome::Postponed => "postponed",
        IoOutcome::Async => "async",
        IoOutcome::Failed(_) => "failed",
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic while handling a request".to_string()
    }
}

/// One client session.
///
/// Created by [`CaServer::create_session`](crate::CaServer::create_session).
/// Dropping the session tears it down: every channel is uninstalled from its
/// variable.
pub struct Session {
    state: Arc<Mutex<SessionState>>,
    handle: SessionHandle,
    queue: Receiver<SessionEvent>,
}

impl Session {
    pub(crate) fn new(core: Arc<ServerCore>, id: SessionId, peer: Option<SocketAddr>) -> Self {
        let (events, queue) = EventSender::channel(id);
        let announce = core.config.announce_version;
        let state = Arc::new_cyclic(|weak| {
            let handle = SessionHandle {
                id,
                events: events.clone(),
                state: weak.clone(),
            };
            Mutex::new(SessionState::new(core, handle, peer))
        });
        let handle = SessionHandle {
            id,
            events,
            state: Arc::downgrade(&state),
        };

        if announce {
            if let Err(err) = lock(&state).send_version() {
                warn!(session = id, error = %err, "version announcement not queued");
            }
        }
        info!(session = id, peer = ?peer, "session created");

        Self {
            state,
            handle,
            queue,
        }
    }

    pub fn id(&self) -> SessionId {
        self.handle.id
    }

    /// Handle for reaching the session from other threads.
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Queue for events produced outside the session.
    pub fn sender(&self) -> EventSender {
        self.handle.events.clone()
    }

    /// Credit a circuit reader acquires before queueing received bytes.
    pub fn input_gate(&self) -> Arc<InputGate> {
        Arc::clone(&lock(&self.state).input_gate)
    }

    /// Feed bytes received from the circuit and handle what they complete.
    pub fn receive(&self, bytes: &[u8]) -> Result<(), SessionError> {
        self.apply(SessionEvent::Received {
            bytes: bytes.to_vec(),
            at: EpicsTimeStamp::now(),
        })
    }

    /// Apply one event. An error means the session must be closed.
    pub fn apply(&self, event: SessionEvent) -> Result<(), SessionError> {
        lock(&self.state).apply(event)
    }

    /// Apply every event already queued.
    pub fn process_queued(&self) -> Result<(), SessionError> {
        loop {
            match self.queue.try_recv() {
                Ok(event) => self.apply(event)?,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    /// Wait for the next queued event.
    pub fn next_event(&self) -> Option<SessionEvent> {
        self.queue.recv().ok()
    }

    /// Write pending output to `dst`. A request held back because the buffer
    /// was full is handled again once it drained.
    pub fn flush_to<W: Write>(&self, dst: &mut W) -> Result<usize, ServerError> {
        let mut state = lock(&self.state);
        let mut written = 0;
        loop {
            written += state.outbuf.flush_to(dst)?;
            if !state.send_blocked || !state.outbuf.is_empty() {
                return Ok(written);
            }
            state.resume().map_err(|reason| ServerError::Disconnected {
                id: self.handle.id,
                reason,
            })?;
        }
    }

    /// Take pending output without a transport.
    pub fn take_output(&self) -> Result<Vec<u8>, ServerError> {
        let mut out = Vec::new();
        self.flush_to(&mut out)?;
        Ok(out)
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.state).channels.len()
    }

    /// Minor protocol revision negotiated by the client's claims.
    pub fn minor_version(&self) -> u16 {
        lock(&self.state).minor_version
    }

    pub fn user(&self) -> String {
        lock(&self.state).user.clone()
    }

    pub fn host(&self) -> String {
        lock(&self.state).host.clone()
    }

    /// Why the session is closing, once it is.
    pub fn close_reason(&self) -> Option<SessionError> {
        lock(&self.state).closing.clone()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.handle.id).finish()
    }
}

/// Cloneable reference to a session, usable from any thread.
///
/// Holds no strong reference: once the session is dropped every operation
/// becomes a no-op.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    events: EventSender,
    state: Weak<Mutex<SessionState>>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn events(&self) -> &EventSender {
        &self.events
    }

    pub fn is_alive(&self) -> bool {
        self.state.strong_count() > 0
    }

    /// Queue removal of channel `cid`; the session uninstalls it and tells
    /// the client when it next runs.
    pub fn schedule_channel_destroy(&self, cid: u32) -> bool {
        self.events.send(SessionEvent::ChannelDestroyed {
            cid,
            uninstalled: None,
        })
    }

    /// Uninstall channel `cid` right away if the session lock is free, else
    /// fall back to [`schedule_channel_destroy`](Self::schedule_channel_destroy).
    /// The client is told in both cases.
    pub fn destroy_channel_now(&self, cid: u32) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        let removed = match state.try_lock() {
            Ok(mut guard) => guard.detach_channel(cid),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().detach_channel(cid),
            Err(TryLockError::WouldBlock) => return self.schedule_channel_destroy(cid),
        };
        match removed {
            Some(channel) => self.events.send(SessionEvent::ChannelDestroyed {
                cid,
                uninstalled: Some(Box::new(channel)),
            }),
            None => false,
        }
    }

    /// Re-evaluate and resend the access rights of channel `cid`.
    pub fn update_access_rights(&self, cid: u32) -> bool {
        self.events.send(SessionEvent::RightsChanged { cid })
    }

    #[cfg(test)]
    pub(crate) fn detached(events: EventSender) -> Self {
        Self {
            id: events.session_id(),
            events,
            state: Weak::new(),
        }
    }
}
