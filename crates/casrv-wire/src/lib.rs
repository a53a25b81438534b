//! Channel Access wire protocol.
//!
//! Everything that touches bytes on a virtual circuit lives here:
//! - the 16-byte message header and its 24-byte large-array extension
//! - command opcodes and ECA status codes
//! - the DBR buffer type table and value serialization
//! - the input framer (with oversized-message drain) and the output buffer
//!   (with reserve/commit transactions)
//!
//! All multi-byte quantities are in network byte order.

pub mod command;
pub mod convert;
pub mod dbr;
pub mod error;
pub mod header;
pub mod inbuf;
pub mod outbuf;
pub mod status;
pub mod value;

pub use command::command_name;
pub use convert::{decode_put, encode_dbr, ConvertError};
pub use dbr::{DbrType, LAST_BUFFER_TYPE, MAX_ENUM_STATES, MAX_ENUM_STRING_SIZE, MAX_STRING_SIZE};
pub use error::{Result, WireError};
pub use header::{
    align_size, Header, COMPACT_HEADER_SIZE, EXTENDED_HEADER_SIZE, EXTENSION_SIZE, MESSAGE_ALIGN,
};
pub use inbuf::{Framed, InBuf, InBufConfig};
pub use outbuf::{OutBuf, OutBufConfig, Reservation};
pub use status::EcaStatus;
pub use value::{EpicsTimeStamp, FieldType, Value, ValueData};
