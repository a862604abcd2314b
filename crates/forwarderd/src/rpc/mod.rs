//! Mutually authenticated JSON-lines RPC.
//!
//! Every connection is wrapped in TLS with client certificates required. On
//! top of TLS each request is one line of JSON naming a service, a method and
//! a payload, answered by one line of JSON carrying either a payload or a
//! status code:
//!
//! ```text
//! -> {"service":"networkservice.NetworkService","method":"Request","payload":{...}}
//! <- {"status":"ok","payload":{...}}
//! <- {"status":"error","code":"permission_denied","message":"..."}
//! ```
//!
//! A connection carries any number of sequential calls.

mod client;
mod errors;
mod protocol;
mod server;

pub use self::client::RpcClient;
pub use self::errors::RpcError;
pub use self::protocol::{RpcCode, RpcRequest, RpcResponse, RpcStatus};
pub use self::server::{
    CallContext, HANDSHAKE_TIMEOUT, RPC_SUBSYSTEM, RpcServer, RpcService, RpcTransport,
    SocketTransport, listen_and_serve,
};

const RPC_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::rpc");
