//! Request handlers, one module per command family.
//!
//! Every handler has the [`Handler`](crate::dispatch::Handler) signature.
//! Validation failures are reported to the client and end in
//! [`Outcome::Done`](crate::dispatch::Outcome::Done); only conditions that
//! leave the stream untrustworthy return an error.

pub(crate) mod claim;
pub(crate) mod control;
pub(crate) mod io;
pub(crate) mod subscription;
