use casrv_wire::EcaStatus;

/// Errors surfaced by the server outside of a session.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] casrv_transport::TransportError),

    /// Wire-level error.
    #[error("wire error: {0}")]
    Wire(#[from] casrv_wire::WireError),

    /// A circuit worker thread could not be started.
    #[error("failed to spawn circuit thread: {0}")]
    Spawn(std::io::Error),

    /// The session was torn down.
    #[error("session {id} disconnected: {reason}")]
    Disconnected { id: u64, reason: SessionError },
}

/// Conditions that end a session.
///
/// Any of these means the rest of the byte stream cannot be trusted or the
/// client cannot be served; the circuit is closed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The request violates the protocol (malformed claim, legacy client).
    #[error("protocol violation: {0}")]
    BadProtocol(&'static str),

    /// A request referenced a resource that must exist.
    #[error("bad resource id {id}")]
    BadResourceId { id: u32 },

    /// Opcode with no handler.
    #[error("unknown command {0}")]
    UnknownCommand(u16),

    /// Memory could not be obtained for the request.
    #[error("out of memory")]
    NoMemory,

    /// A fault inside the server while handling a request.
    #[error("internal fault: {0}")]
    Internal(String),

    /// The client's protocol revision cannot be notified of a channel loss.
    #[error("client cannot be notified of channel loss")]
    ForcedDisconnect,

    /// The peer closed the circuit.
    #[error("circuit closed by peer")]
    Closed,
}

impl SessionError {
    /// Status reported to the client at the processing boundary. Conditions
    /// whose handler already reported them map to `None`.
    pub fn eca_status(&self) -> Option<EcaStatus> {
        match self {
            SessionError::NoMemory => Some(EcaStatus::ALLOCMEM),
            SessionError::Internal(_) => Some(EcaStatus::INTERNAL),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
