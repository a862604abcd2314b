//! Socket plumbing shared by the RPC server, the RPC client and the dataplane
//! agent connection.
//!
//! Endpoints are either TCP or Unix domain sockets. Messages are single JSON
//! documents terminated by a newline and bounded in size.

mod errors;
mod frame;
mod listener;
mod stream;

pub use self::errors::ListenerError;
pub(crate) use self::frame::{read_frame, write_frame};
pub(crate) use self::listener::SocketListener;
pub(crate) use self::stream::{IoStream, connect};

const TRANSPORT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::transport");
