//! Accept loop handing each circuit to its own session.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use casrv_transport::CaListener;
use tracing::{debug, info, warn};

use crate::connection::{spawn_circuit, CircuitHandle};
use crate::error::Result;
use crate::server::CaServer;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Listens for virtual circuits until its shutdown flag is raised.
pub struct CircuitListener {
    listener: CaListener,
    server: CaServer,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
    circuits: Vec<CircuitHandle>,
}

impl CircuitListener {
    pub fn bind(addr: &str, server: CaServer) -> Result<Self> {
        let listener = CaListener::bind(addr)?;
        Ok(Self {
            listener,
            server,
            shutdown: Arc::new(AtomicBool::new(false)),
            poll_interval: DEFAULT_POLL_INTERVAL,
            circuits: Vec::new(),
        })
    }

    /// How long the accept loop sleeps when no circuit is pending.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn server(&self) -> &CaServer {
        &self.server
    }

    /// Flag that stops [`serve`](Self::serve) when set.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Accept and serve circuits until shutdown, then close every circuit
    /// still open. Returns the number of circuits accepted.
    pub fn serve(&mut self) -> Result<usize> {
        let mut accepted = 0;
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.listener.try_accept()? {
                Some(stream) => match spawn_circuit(&self.server, stream) {
                    Ok(circuit) => {
                        accepted += 1;
                        self.circuits.push(circuit);
                    }
                    Err(err) => warn!(error = %err, "circuit not started"),
                },
                None => {
                    self.reap();
                    thread::sleep(self.poll_interval);
                }
            }
        }

        info!(circuits = self.circuits.len(), "closing open circuits");
        for circuit in self.circuits.drain(..) {
            circuit.shutdown();
            circuit.join();
        }
        Ok(accepted)
    }

    /// Block for one circuit and start serving it.
    pub fn accept_one(&self) -> Result<CircuitHandle> {
        let stream = self.listener.accept()?;
        spawn_circuit(&self.server, stream)
    }

    fn reap(&mut self) {
        let (finished, open): (Vec<_>, Vec<_>) =
            self.circuits.drain(..).partition(CircuitHandle::is_finished);
        for circuit in finished {
            debug!(session = circuit.id(), peer = %circuit.peer(), "circuit finished");
            circuit.join();
        }
        self.circuits = open;
    }
}

impl std::fmt::Debug for CircuitListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitListener")
            .field("local", &self.listener.local_addr())
            .field("circuits", &self.circuits.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use casrv_wire::command::{ECHO, VERSION};

    use super::*;
    use crate::config::ServerConfig;
    use crate::testing::{msg, ScriptedServer};

    fn server() -> CaServer {
        CaServer::new(
            ServerConfig::default(),
            Arc::new(ScriptedServer::new(Vec::new())),
        )
    }

    #[test]
    fn test_serve_until_shutdown() {
        let mut listener = CircuitListener::bind("127.0.0.1:0", server())
            .expect("bind should succeed")
            .with_poll_interval(Duration::from_millis(5));
        let addr = listener.local_addr().to_string();
        let shutdown = listener.shutdown_handle();
        let server = listener.server().clone();

        let serving = thread::spawn(move || listener.serve());

        let mut client =
            CaListener::connect(&addr, Some(Duration::from_secs(5))).expect("connect should succeed");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("timeout should apply");
        client
            .write_all(&msg(ECHO, 0, 0, 0, 0, &[]))
            .expect("echo should send");

        let mut replies = [0u8; 32];
        client.read_exact(&mut replies).expect("version and echo should arrive");
        assert_eq!(u16::from_be_bytes([replies[0], replies[1]]), VERSION);
        assert_eq!(u16::from_be_bytes([replies[16], replies[17]]), ECHO);

        shutdown.store(true, Ordering::SeqCst);
        let accepted = serving
            .join()
            .expect("listener thread should finish")
            .expect("serve should succeed");
        assert_eq!(accepted, 1);
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn test_accept_one() {
        let listener = CircuitListener::bind("127.0.0.1:0", server()).expect("bind should succeed");
        let addr = listener.local_addr().to_string();

        let client = thread::spawn(move || {
            let mut stream = CaListener::connect(&addr, Some(Duration::from_secs(5)))
                .expect("connect should succeed");
            let mut version = [0u8; 16];
            stream.read_exact(&mut version).expect("version should arrive");
            version
        });

        let circuit = listener.accept_one().expect("accept should succeed");
        let version = client.join().expect("client should finish");
        assert_eq!(u16::from_be_bytes([version[0], version[1]]), VERSION);
        assert_eq!(circuit.peer().ip(), listener.local_addr().ip());

        circuit.shutdown();
        circuit.join();
    }
}
