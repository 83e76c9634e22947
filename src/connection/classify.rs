//! Classification of connection-fatal failures.
//!
//! Any failure below the request handler ends the connection. Before closing,
//! the client gets a single best-effort error response with the unknown id.

use crate::framing::FrameError;
use crate::protocol::{ErrorCode, Response, RpcError, UNKNOWN_ID};
use std::time::Duration;

/// A failure that terminates a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("no data received for {}ms", .0.as_millis())]
    IdleTimeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// Error code reported to the client for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            ConnectionError::Frame(FrameError::Malformed(_)) => ErrorCode::ParseError,
            ConnectionError::Frame(FrameError::TooLarge { .. }) => ErrorCode::InvalidRequest,
            ConnectionError::Decode(_) => ErrorCode::ParseError,
            ConnectionError::IdleTimeout(_) => ErrorCode::InternalError,
            ConnectionError::Io(_) => ErrorCode::InternalError,
        }
    }

    /// The single response sent before the connection closes.
    pub fn to_response(&self) -> Response {
        Response::failure(UNKNOWN_ID, RpcError::with_code(self.code(), self.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_of(err: ConnectionError) -> i64 {
        match err.to_response() {
            Response::Failure { id, error } => {
                assert_eq!(id, UNKNOWN_ID);
                error.code
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frame_is_parse_error() {
        let err = ConnectionError::from(FrameError::Malformed("bad header".to_string()));
        assert_eq!(code_of(err), -32700);
    }

    #[test]
    fn test_malformed_payload_is_parse_error() {
        let decode = serde_json::from_slice::<serde_json::Value>(b"{oops").unwrap_err();
        assert_eq!(code_of(ConnectionError::from(decode)), -32700);
    }

    #[test]
    fn test_oversized_is_invalid_request() {
        let err = ConnectionError::from(FrameError::TooLarge { len: 10, max: 5 });
        assert_eq!(code_of(err), -32600);
    }

    #[test]
    fn test_timeout_and_io_are_internal() {
        assert_eq!(
            code_of(ConnectionError::IdleTimeout(Duration::from_secs(5))),
            -32603
        );
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(code_of(ConnectionError::from(io)), -32603);
    }

    #[test]
    fn test_detail_is_human_readable() {
        let resp = ConnectionError::IdleTimeout(Duration::from_millis(250)).to_response();
        match resp {
            Response::Failure { error, .. } => {
                assert_eq!(error.message, "no data received for 250ms")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
