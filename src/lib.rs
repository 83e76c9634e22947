//! framed-rpc: a framed JSON-RPC style TCP server.
//!
//! A [`Server`] accepts TCP connections, splits each byte stream into frames,
//! decodes JSON requests, hands them to a user-supplied [`Dispatch`]
//! implementation and writes the framed JSON responses back.
//!
//! Features:
//! - Strict lifecycle: initializing, starting, started, stopping, stopped
//! - Newline or length-prefixed framing
//! - Per-connection idle timeout
//! - Protocol failures answered with one error response before closing
//!
//! ```no_run
//! use framed_rpc::{Responder, RpcObject, Server, ServerConfig};
//!
//! # async fn run() -> Result<(), framed_rpc::ServerError> {
//! let server = Server::new(
//!     tokio::runtime::Handle::current(),
//!     ServerConfig::default(),
//!     |_method: String, params: RpcObject, respond: Responder| respond.ok(params.into_value()),
//! );
//! let handle = server.start("127.0.0.1", 8000).await?;
//! handle.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod state;

pub use config::ServerConfig;
pub use error::ServerError;
pub use framing::Framing;
pub use handler::{Dispatch, DispatchResult, Responder};
pub use protocol::{ErrorCode, Request, Response, RpcError, RpcObject};
pub use server::{Server, ServerHandle};
pub use state::ServerState;
