//! One virtual circuit: a reader thread feeding the session queue and a
//! worker thread applying events and flushing replies. The reader stops
//! reading while the session's input gate is out of credit.

use std::io::{ErrorKind, Read};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use casrv_transport::CaStream;
use casrv_wire::EpicsTimeStamp;
use tracing::{debug, info, warn};

use crate::error::{Result, ServerError, SessionError};
use crate::events::{EventSender, InputGate, SessionEvent, SessionId};
use crate::server::CaServer;
use crate::session::Session;

const READ_CHUNK: usize = 16 * 1024;

/// Threads serving one accepted circuit.
#[derive(Debug)]
pub struct CircuitHandle {
    id: SessionId,
    peer: SocketAddr,
    stream: CaStream,
    gate: Arc<InputGate>,
    reader: JoinHandle<()>,
    worker: JoinHandle<()>,
}

impl CircuitHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether both threads have exited.
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished() && self.worker.is_finished()
    }

    /// Close the circuit; both threads exit once they notice.
    pub fn shutdown(&self) {
        self.stream.shutdown();
        self.gate.close();
    }

    pub fn join(self) {
        if self.reader.join().is_err() {
            warn!(session = self.id, "circuit reader panicked");
        }
        if self.worker.join().is_err() {
            warn!(session = self.id, "circuit worker panicked");
        }
    }
}

/// Start serving `stream` with a new session of `server`.
pub fn spawn_circuit(server: &CaServer, stream: CaStream) -> Result<CircuitHandle> {
    stream.set_write_timeout(server.config().write_timeout)?;
    let peer = stream.peer_addr();
    let mut inbound = stream.try_clone()?;
    let mut outbound = stream.try_clone()?;

    let session = server.create_session(Some(peer));
    let id = session.id();
    let events = session.sender();
    let gate = session.input_gate();
    let reader_gate = Arc::clone(&gate);
    info!(session = id, %peer, "circuit accepted");

    let worker = thread::Builder::new()
        .name(format!("ca-circuit-{id}"))
        .spawn(move || {
            serve_session(&session, &mut outbound);
            outbound.shutdown();
        })
        .map_err(ServerError::Spawn)?;

    let reader = thread::Builder::new()
        .name(format!("ca-circuit-{id}-rx"))
        .spawn(move || read_loop(&mut inbound, &events, &reader_gate))
        .map_err(|err| {
            stream.shutdown();
            ServerError::Spawn(err)
        })?;

    Ok(CircuitHandle {
        id,
        peer,
        stream,
        gate,
        reader,
        worker,
    })
}

fn read_loop(stream: &mut CaStream, events: &EventSender, gate: &InputGate) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if !gate.acquire(n) {
                    debug!(session = events.session_id(), "input gate closed, circuit reader stopping");
                    break;
                }
                let event = SessionEvent::Received {
                    bytes: buf[..n].to_vec(),
                    at: EpicsTimeStamp::now(),
                };
                if !events.send(event) {
                    return;
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(session = events.session_id(), error = %err, "circuit read ended");
                break;
            }
        }
    }
    events.send(SessionEvent::Closed);
}

fn serve_session(session: &Session, stream: &mut CaStream) {
    if let Err(err) = session.flush_to(stream) {
        warn!(session = session.id(), error = %err, "circuit write failed");
        return;
    }

    while let Some(event) = session.next_event() {
        let applied = session.apply(event);
        if let Err(err) = session.flush_to(stream) {
            warn!(session = session.id(), error = %err, "circuit write failed");
            return;
        }
        match applied {
            Ok(()) => {}
            Err(SessionError::Closed) => {
                info!(session = session.id(), "circuit closed by peer");
                return;
            }
            Err(reason) => {
                let err = ServerError::Disconnected {
                    id: session.id(),
                    reason,
                };
                info!(error = %err, "circuit dropped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    use casrv_transport::CaListener;
    use casrv_wire::command::{ACCESS_RIGHTS, CLAIM_CIU, ECHO, VERSION};

    use super::*;
    use crate::config::ServerConfig;
    use crate::testing::{claim, msg, parse_all, ScriptedPv, ScriptedServer};

    fn read_replies(stream: &mut CaStream, expected: usize) -> Vec<crate::testing::Reply> {
        let mut bytes = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).expect("reply should arrive");
            assert!(n > 0, "circuit closed early");
            bytes.extend_from_slice(&buf[..n]);
            if let Some(replies) = complete(&bytes, expected) {
                return replies;
            }
        }
    }

    fn complete(bytes: &[u8], expected: usize) -> Option<Vec<crate::testing::Reply>> {
        let mut rest = bytes;
        let mut count = 0;
        while let Some((header, len)) = casrv_wire::Header::peek(rest) {
            let end = len + header.payload_size as usize;
            if rest.len() < end {
                return None;
            }
            rest = &rest[end..];
            count += 1;
        }
        (rest.is_empty() && count >= expected).then(|| parse_all(bytes))
    }

    #[test]
    fn test_circuit_serves_claim_and_echo() {
        let listener = CaListener::bind("127.0.0.1:0").expect("bind should succeed");
        let addr = listener.local_addr().to_string();
        let pv = ScriptedPv::double("tempA", 1.5);
        let server = CaServer::new(
            ServerConfig::default(),
            Arc::new(ScriptedServer::new(vec![pv])),
        );

        let client = thread::spawn(move || {
            let mut stream =
                CaListener::connect(&addr, Some(Duration::from_secs(5))).expect("connect should succeed");
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .expect("timeout should apply");
            let version = read_replies(&mut stream, 1);
            assert_eq!(version[0].header.command, VERSION);

            stream.write_all(&claim(1, "tempA", 13)).expect("claim should send");
            let claimed = read_replies(&mut stream, 2);
            assert_eq!(claimed[0].header.command, ACCESS_RIGHTS);
            assert_eq!(claimed[1].header.command, CLAIM_CIU);

            stream.write_all(&msg(ECHO, 0, 0, 0, 0, &[])).expect("echo should send");
            let echoed = read_replies(&mut stream, 1);
            assert_eq!(echoed[0].header.command, ECHO);
        });

        let accepted = listener.accept().expect("accept should succeed");
        let circuit = spawn_circuit(&server, accepted).expect("circuit should start");
        client.join().expect("client should finish");

        circuit.shutdown();
        circuit.join();
        assert_eq!(server.session_count(), 0);
    }
}
