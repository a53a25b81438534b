//! Server side of Channel Access virtual circuits.
//!
//! A [`CaServer`] resolves channel names through the application's
//! [`PvServer`] and runs one [`Session`] per accepted circuit. A session
//! frames requests from its input buffer, dispatches them by opcode, and
//! writes replies into its output buffer; I/O on process variables may
//! complete synchronously, be postponed and retried, or finish later
//! through an [`AsyncIo`] handle.

pub mod attachment;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod listener;
pub mod monitor;
pub mod pv;
pub mod server;
pub mod session;

mod dispatch;
mod handlers;
mod resource;
mod response;

#[cfg(test)]
mod testing;

pub use attachment::PvAttachment;
pub use channel::Channel;
pub use config::{EventMask, EventPolicy, ServerConfig};
pub use connection::{spawn_circuit, CircuitHandle};
pub use dispatch::{is_implemented, is_outbound_only};
pub use error::{Result, ServerError, SessionError};
pub use events::{
    AsyncResult, EventSender, InputGate, IoBlockedList, PostedValue, SessionEvent, SessionId,
};
pub use listener::CircuitListener;
pub use monitor::Monitor;
pub use pv::{
    AccessRights, AsyncIo, AttachOutcome, IoContext, IoOutcome, ProcessVariable, PvError,
    PvServer, ReadRequest,
};
pub use server::{CaServer, WeakCaServer};
pub use session::{Session, SessionHandle};
