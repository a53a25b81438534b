//! Stream transport for Channel Access virtual circuits.
//!
//! This is the lowest layer of casrv. A virtual circuit is a plain TCP
//! connection; everything above it only sees the [`CaStream`] type provided
//! here.

pub mod error;
pub mod stream;
pub mod tcp;

pub use error::{Result, TransportError};
pub use stream::CaStream;
pub use tcp::{CaListener, DEFAULT_SERVER_PORT};
