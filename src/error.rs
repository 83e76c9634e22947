//! Lifecycle errors returned by [`Server`](crate::Server).

use crate::state::ServerState;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// `stop` was called while the server was not started.
    #[error("server not ready: state is {0}")]
    NotReady(ServerState),
    #[error("illegal state transition from {from} to {to}")]
    IllegalTransition { from: ServerState, to: ServerState },
    #[error("failed to resolve '{address}': {source}")]
    Resolve { address: String, source: io::Error },
    #[error("failed to bind '{address}': {source}")]
    Bind { address: String, source: io::Error },
    #[error("shutdown did not complete: {0}")]
    Shutdown(String),
}
