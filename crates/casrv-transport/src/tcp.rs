use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::CaStream;

/// Well-known Channel Access virtual circuit port.
pub const DEFAULT_SERVER_PORT: u16 = 5064;

/// TCP listener for incoming virtual circuits.
pub struct CaListener {
    listener: TcpListener,
    local: SocketAddr,
}

impl CaListener {
    /// Bind and listen on `addr`.
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|e| TransportError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let local = listener.local_addr()?;
        info!(%local, "listening for virtual circuits");
        Ok(Self { listener, local })
    }

    /// Accept an incoming circuit (blocking).
    pub fn accept(&self) -> Result<CaStream> {
        let (stream, addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(%addr, "accepted circuit");
        CaStream::from_tcp(stream)
    }

    /// Accept without blocking; `Ok(None)` when no circuit is pending.
    pub fn try_accept(&self) -> Result<Option<CaStream>> {
        self.listener.set_nonblocking(true)?;
        let accepted = self.listener.accept();
        self.listener.set_nonblocking(false)?;
        match accepted {
            Ok((stream, addr)) => {
                stream.set_nonblocking(false)?;
                debug!(%addr, "accepted circuit");
                CaStream::from_tcp(stream).map(Some)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(TransportError::Accept(e)),
        }
    }

    /// Connect to a listening server (blocking).
    pub fn connect(addr: &str, timeout: Option<Duration>) -> Result<CaStream> {
        let resolved = addr
            .to_socket_addrs()
            .map_err(|e| TransportError::Connect {
                addr: addr.to_string(),
                source: e,
            })?
            .next()
            .ok_or_else(|| TransportError::Unresolved {
                addr: addr.to_string(),
            })?;
        let stream = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&resolved, timeout),
            None => TcpStream::connect(resolved),
        }
        .map_err(|e| TransportError::Connect {
            addr: addr.to_string(),
            source: e,
        })?;
        debug!(%resolved, "connected circuit");
        CaStream::from_tcp(stream)
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_bind_accept_connect() {
        let listener = CaListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().to_string();

        let handle = std::thread::spawn(move || {
            let mut client = CaListener::connect(&addr, Some(Duration::from_secs(5))).unwrap();
            client.write_all(b"hello").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert!(server.peer_addr().ip().is_loopback());

        handle.join().unwrap();
    }

    #[test]
    fn test_try_accept_without_pending_circuit() {
        let listener = CaListener::bind("127.0.0.1:0").unwrap();
        assert!(listener.try_accept().unwrap().is_none());
    }

    #[test]
    fn test_bind_rejects_bad_address() {
        let err = CaListener::bind("not-an-address").err().unwrap();
        assert!(matches!(err, TransportError::Bind { .. }));
    }

    #[test]
    fn test_try_clone_shares_circuit() {
        let listener = CaListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().to_string();
        let handle = std::thread::spawn(move || {
            let mut client = CaListener::connect(&addr, None).unwrap();
            let mut buf = [0u8; 2];
            client.read_exact(&mut buf).unwrap();
            buf
        });

        let server = listener.accept().unwrap();
        let mut writer = server.try_clone().unwrap();
        writer.write_all(b"ok").unwrap();
        assert_eq!(&handle.join().unwrap(), b"ok");
        assert_eq!(writer.peer_addr(), server.peer_addr());
    }

    #[test]
    fn test_transport_name() {
        let listener = CaListener::bind("127.0.0.1:0").unwrap();
        assert_eq!(listener.transport_name(), "tcp");
    }
}
