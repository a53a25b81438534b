/// Errors that can occur while framing or buffering protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The message can never fit in the output buffer.
    #[error("message too large for output buffer ({size} bytes, max {max})")]
    HugeRequest { size: usize, max: usize },

    /// The output buffer is full right now; flush and retry.
    #[error("output buffer full ({pending} bytes pending, {need} more needed)")]
    SendBlocked { pending: usize, need: usize },

    /// More bytes were written into a reservation than were reserved.
    #[error("reservation overrun ({need} bytes needed, {left} left)")]
    ReservationOverrun { need: usize, left: usize },

    /// A payload was shorter than its header declares.
    #[error("truncated payload ({have} bytes, need {need})")]
    Truncated { have: usize, need: usize },

    /// An I/O error occurred while filling or flushing a buffer.
    #[error("wire I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the circuit.
    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, WireError>;
