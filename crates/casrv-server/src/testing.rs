//! Scripted application collaborators and message helpers for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use casrv_wire::command::CLAIM_CIU;
use casrv_wire::{align_size, FieldType, Header, Value, ValueData, COMPACT_HEADER_SIZE};

use crate::events::lock;
use crate::pv::{
    AccessRights, AsyncIo, AttachOutcome, IoContext, IoOutcome, ProcessVariable, PvError,
    PvServer, ReadRequest,
};

/// What the next scripted call does instead of completing normally.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Postpone,
    Async,
    Fail(PvError),
    Panic,
}

#[derive(Default)]
struct PvState {
    rights: Option<AccessRights>,
    reads: usize,
    writes: usize,
    last_write: Option<ValueData>,
    read_steps: VecDeque<Step>,
    write_steps: VecDeque<Step>,
    pending_read: Option<AsyncIo>,
    pending_write: Option<AsyncIo>,
}

/// A single-element variable whose next reads and writes can be scripted.
pub(crate) struct ScriptedPv {
    name: String,
    value: Mutex<ValueData>,
    enum_strings: Vec<String>,
    state: Mutex<PvState>,
}

impl ScriptedPv {
    fn new(name: &str, value: ValueData) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            value: Mutex::new(value),
            enum_strings: Vec::new(),
            state: Mutex::new(PvState::default()),
        })
    }

    pub(crate) fn double(name: &str, value: f64) -> Arc<Self> {
        Self::new(name, ValueData::Double(vec![value]))
    }

    pub(crate) fn float(name: &str, value: f32) -> Arc<Self> {
        Self::new(name, ValueData::Float(vec![value]))
    }

    pub(crate) fn enumerated(name: &str, state: u16, strings: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            value: Mutex::new(ValueData::Enum(vec![state])),
            enum_strings: strings.iter().map(|s| s.to_string()).collect(),
            state: Mutex::new(PvState::default()),
        })
    }

    pub(crate) fn with_rights(self: Arc<Self>, rights: AccessRights) -> Arc<Self> {
        self.set_rights(rights);
        self
    }

    pub(crate) fn set_rights(&self, rights: AccessRights) {
        lock(&self.state).rights = Some(rights);
    }

    pub(crate) fn reads(&self) -> usize {
        lock(&self.state).reads
    }

    pub(crate) fn writes(&self) -> usize {
        lock(&self.state).writes
    }

    pub(crate) fn last_write(&self) -> Option<ValueData> {
        lock(&self.state).last_write.clone()
    }

    pub(crate) fn script_read(&self, step: Step) {
        lock(&self.state).read_steps.push_back(step);
    }

    pub(crate) fn script_write(&self, step: Step) {
        lock(&self.state).write_steps.push_back(step);
    }

    pub(crate) fn complete_read(&self, result: Result<Value, PvError>) {
        let io = lock(&self.state).pending_read.take().expect("no asynchronous read started");
        io.complete_read(result);
    }

    pub(crate) fn complete_write(&self, result: Result<(), PvError>) {
        let io = lock(&self.state).pending_write.take().expect("no asynchronous write started");
        io.complete_write(result);
    }
}

impl ProcessVariable for ScriptedPv {
    fn name(&self) -> &str {
        &self.name
    }

    fn best_external_type(&self) -> Result<FieldType, PvError> {
        Ok(lock(&self.value).field_type())
    }

    fn native_count(&self) -> u32 {
        1
    }

    fn read(&self, ctx: &mut IoContext<'_>, _request: &ReadRequest) -> IoOutcome<Value> {
        let step = {
            let mut state = lock(&self.state);
            state.reads += 1;
            state.read_steps.pop_front()
        };
        match step {
            None => IoOutcome::Done(Value::new(lock(&self.value).clone())),
            Some(Step::Postpone) => IoOutcome::Postponed,
            Some(Step::Fail(cause)) => IoOutcome::Failed(cause),
            Some(Step::Panic) => panic!("scripted read panic"),
            Some(Step::Async) => {
                lock(&self.state).pending_read = ctx.start_async();
                IoOutcome::Async
            }
        }
    }

    fn write(&self, ctx: &mut IoContext<'_>, value: Value) -> IoOutcome<()> {
        let step = {
            let mut state = lock(&self.state);
            state.writes += 1;
            state.last_write = Some(value.data.clone());
            state.write_steps.pop_front()
        };
        match step {
            None => {
                *lock(&self.value) = value.data;
                IoOutcome::Done(())
            }
            Some(Step::Postpone) => IoOutcome::Postponed,
            Some(Step::Fail(cause)) => IoOutcome::Failed(cause),
            Some(Step::Panic) => panic!("scripted write panic"),
            Some(Step::Async) => {
                lock(&self.state).pending_write = ctx.start_async();
                IoOutcome::Async
            }
        }
    }

    fn update_enum_strings(&self, _ctx: &mut IoContext<'_>) -> IoOutcome<Vec<String>> {
        IoOutcome::Done(self.enum_strings.clone())
    }

    fn access_rights(&self, _user: &str, _host: &str) -> AccessRights {
        lock(&self.state).rights.unwrap_or(AccessRights::READ_WRITE)
    }
}

/// Name server over a fixed set of scripted variables.
pub(crate) struct ScriptedServer {
    pvs: HashMap<String, Arc<ScriptedPv>>,
    steps: Mutex<VecDeque<Step>>,
    attaches: Mutex<usize>,
}

impl ScriptedServer {
    pub(crate) fn new(pvs: Vec<Arc<ScriptedPv>>) -> Self {
        Self {
            pvs: pvs.into_iter().map(|pv| (pv.name.clone(), pv)).collect(),
            steps: Mutex::new(VecDeque::new()),
            attaches: Mutex::new(0),
        }
    }

    pub(crate) fn script_attach(&self, step: Step) {
        lock(&self.steps).push_back(step);
    }

    pub(crate) fn attaches(&self) -> usize {
        *lock(&self.attaches)
    }
}

impl PvServer for ScriptedServer {
    fn attach(&self, _ctx: &mut IoContext<'_>, name: &str) -> AttachOutcome {
        *lock(&self.attaches) += 1;
        let step = lock(&self.steps).pop_front();
        match step {
            Some(Step::Postpone) => AttachOutcome::Postponed,
            Some(Step::Fail(cause)) => AttachOutcome::Failed(cause),
            Some(Step::Panic) => panic!("scripted attach panic"),
            Some(Step::Async) => AttachOutcome::Async,
            None => match self.pvs.get(name) {
                Some(pv) => AttachOutcome::Attached(pv.clone()),
                None => AttachOutcome::NotFound,
            },
        }
    }
}

/// One request or reply on the wire, payload padded to the message alignment.
pub(crate) fn msg(
    command: u16,
    data_type: u16,
    count: u32,
    cid: u32,
    available: u32,
    payload: &[u8],
) -> Vec<u8> {
    let padded = align_size(payload.len());
    let header = Header::new(command)
        .with_payload_size(padded as u32)
        .with_type(data_type, count)
        .with_ids(cid, available);
    let mut dst = BytesMut::new();
    header.encode(&mut dst);
    dst.extend_from_slice(payload);
    dst.resize(dst.len() + padded - payload.len(), 0);
    dst.to_vec()
}

/// A claim for `name` announcing protocol revision `minor`.
pub(crate) fn claim(cid: u32, name: &str, minor: u16) -> Vec<u8> {
    let mut payload = name.as_bytes().to_vec();
    payload.push(0);
    msg(CLAIM_CIU, 0, 0, cid, u32::from(minor), &payload)
}

/// A decoded reply.
#[derive(Debug)]
pub(crate) struct Reply {
    pub(crate) header: Header,
    pub(crate) payload: Vec<u8>,
}

impl Reply {
    /// Text following the echoed request header in an error reply.
    pub(crate) fn detail(&self) -> String {
        let text = self.payload.get(COMPACT_HEADER_SIZE..).unwrap_or_default();
        let end = text.iter().position(|b| *b == 0).unwrap_or(text.len());
        String::from_utf8_lossy(&text[..end]).into_owned()
    }
}

/// Split a byte stream into replies.
pub(crate) fn parse_all(mut bytes: &[u8]) -> Vec<Reply> {
    let mut replies = Vec::new();
    while let Some((header, header_len)) = Header::peek(bytes) {
        let end = header_len + header.payload_size as usize;
        assert!(bytes.len() >= end, "truncated reply {header:?}");
        replies.push(Reply {
            header,
            payload: bytes[header_len..end].to_vec(),
        });
        bytes = &bytes[end..];
    }
    assert!(bytes.is_empty(), "{} trailing bytes", bytes.len());
    replies
}
