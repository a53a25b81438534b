use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use crate::error::{Result, TransportError};

/// A connected virtual circuit: implements Read + Write.
///
/// Wraps a TCP stream and remembers the peer address so sessions can
/// report it without another syscall.
pub struct CaStream {
    inner: TcpStream,
    peer: SocketAddr,
}

impl Read for CaStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for CaStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl CaStream {
    /// Wrap an already connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Result<Self> {
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(_) => {
                return Err(TransportError::NoPeer {
                    local: stream.local_addr()?,
                })
            }
        };
        // Protocol messages are small and latency sensitive.
        stream.set_nodelay(true)?;
        Ok(Self {
            inner: stream,
            peer,
        })
    }

    /// Address of the remote end.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_read_timeout(timeout).map_err(Into::into)
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.set_write_timeout(timeout).map_err(Into::into)
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            inner: self.inner.try_clone()?,
            peer: self.peer,
        })
    }

    /// Shut down both halves of the circuit.
    ///
    /// Errors are ignored: the peer may already have gone away.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown(Shutdown::Both);
    }
}

impl std::fmt::Debug for CaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaStream")
            .field("type", &"tcp")
            .field("peer", &self.peer)
            .finish()
    }
}
