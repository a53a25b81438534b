//! Channel Access server with an in-memory process variable catalogue.
//!
//! # Crate Structure
//!
//! - [`transport`] re-exports the TCP circuit transport
//! - [`wire`] re-exports the wire protocol codec
//! - [`server`] re-exports the session state machine and circuit server
//! - [`catalog`] loads process variable definitions from JSON
//! - [`provider`] serves a catalogue from memory

pub mod catalog;
pub mod provider;

/// Re-export transport types.
pub mod transport {
    pub use casrv_transport::*;
}

/// Re-export wire protocol types.
pub mod wire {
    pub use casrv_wire::*;
}

/// Re-export server types.
pub mod server {
    pub use casrv_server::*;
}

pub use catalog::{Catalog, CatalogError, PvDefinition};
pub use provider::{MemoryPv, MemoryServer};
