//! Per-connection protocol handling.
//!
//! Each accepted socket is driven by a single task running [`Connection::run`],
//! so reads, writes and timer events for one connection never overlap.
//! Connections share nothing but the dispatch function.
//!
//! - Inbound bytes pass through the stages declared by [`Pipeline`].
//! - Dispatch results are written as they complete, not in request order.
//! - Any framing, decode, timeout or I/O failure is classified, answered with a
//!   single error response and ends the connection. Replies that were already
//!   complete are written first.
//! - After the peer closes its side, in-flight requests are answered and the
//!   idle timer no longer applies.

mod classify;
mod idle;
mod pipeline;

pub use classify::ConnectionError;
pub use idle::IdleTimer;
pub use pipeline::{Pipeline, Stage};

use crate::config::ServerConfig;
use crate::framing::FrameResult;
use crate::handler::{Dispatch, PendingReplies};
use crate::protocol::{decode_request, encode_response, Response, RpcError};
use bytes::{Buf, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// State for one accepted connection.
pub struct Connection<S> {
    stream: S,
    pipeline: Pipeline,
    dispatcher: Arc<dyn Dispatch>,
    idle: IdleTimer,
    pending: PendingReplies,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, config: &ServerConfig, dispatcher: Arc<dyn Dispatch>) -> Self {
        let pipeline = Pipeline::from_config(config);
        let idle = IdleTimer::new(pipeline.idle_timeout());

        Connection {
            stream,
            pipeline,
            dispatcher,
            idle,
            pending: PendingReplies::new(config.request_timeout),
            read_buf: BytesMut::with_capacity(BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(BUFFER_SIZE),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Serve the connection until the peer leaves or a fatal error occurs.
    ///
    /// On a fatal error the classified error response is written before the
    /// stream is shut down; the error is returned for logging.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let result = self.serve().await;

        if let Err(ref e) = result {
            // Requests accepted before the failure keep their answers.
            for response in self.pending.drain_ready() {
                if let Err(write_err) = self.write_response(&response).await {
                    trace!(error = %write_err, "Could not deliver completed response");
                    break;
                }
            }

            let response = e.to_response();
            debug!(error = %e, code = e.code().code(), "Closing connection after fatal error");
            if let Err(write_err) = self.write_response(&response).await {
                trace!(error = %write_err, "Could not deliver error response");
            }
        }

        if !self.pending.is_empty() {
            debug!(abandoned = self.pending.len(), "Dropping in-flight requests");
        }

        if let Err(e) = self.stream.shutdown().await {
            trace!(error = %e, "Shutdown failed");
        }

        result
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        let mut eof = false;

        loop {
            self.process_frames()?;

            if eof && self.pending.is_empty() {
                return Ok(());
            }

            tokio::select! {
                res = self.stream.read_buf(&mut self.read_buf), if !eof => {
                    let n = res?;
                    if n == 0 {
                        trace!(in_flight = self.pending.len(), "Connection closed by client");
                        if !self.read_buf.is_empty() {
                            trace!(bytes = self.read_buf.len(), "Discarding partial frame");
                            self.read_buf.clear();
                        }
                        eof = true;
                    } else {
                        trace!(bytes = n, "Read");
                        self.idle.reset();
                    }
                }

                Some(response) = self.pending.next() => {
                    self.write_response(&response).await?;
                }

                _ = self.idle.expired(), if !eof => {
                    return Err(ConnectionError::IdleTimeout(self.idle.duration()));
                }
            }
        }
    }

    /// Split, decode and dispatch every complete frame in the read buffer.
    fn process_frames(&mut self) -> Result<(), ConnectionError> {
        let framing = self.pipeline.framing();
        let max_frame_size = self.pipeline.max_frame_size();

        loop {
            match framing.decode(&self.read_buf, max_frame_size) {
                FrameResult::Complete(frame, consumed) => {
                    self.read_buf.advance(consumed);
                    let request = decode_request(&frame)?;
                    self.pending.dispatch(self.dispatcher.as_ref(), request);
                }
                FrameResult::Skip(consumed) => self.read_buf.advance(consumed),
                FrameResult::Incomplete => return Ok(()),
                FrameResult::Error(e) => {
                    warn!(error = %e, "Framing error");
                    return Err(e.into());
                }
            }
        }
    }

    async fn write_response(&mut self, response: &Response) -> Result<(), ConnectionError> {
        let payload = match encode_response(response) {
            Ok(payload) => payload,
            Err(e) => {
                error!(id = %response.id(), error = %e, "Failed to encode response");
                let fallback =
                    Response::failure(response.id(), RpcError::internal("unencodable result"));
                encode_response(&fallback)?
            }
        };

        self.write_buf.clear();
        self.pipeline.framing().encode(&payload, &mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        trace!(id = %response.id(), error = response.is_error(), "Response written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::Framing;
    use crate::handler::Responder;
    use crate::protocol::RpcObject;
    use serde_json::json;
    use std::time::Duration;
    use tokio_test::io::Builder;

    fn dispatcher() -> Arc<dyn Dispatch> {
        Arc::new(|method: String, params: RpcObject, respond: Responder| {
            match method.as_str() {
                "echo" => respond.ok(params.into_value()),
                "fail" => respond.err(RpcError::new(7, "bad input")),
                _ => respond.err(RpcError::method_not_found(&method)),
            }
        })
    }

    fn config(framing: Framing) -> ServerConfig {
        ServerConfig {
            framing,
            max_frame_size: 256,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let mock = Builder::new()
            .read(b"{\"id\":\"1\",\"method\":\"echo\",\"params\":{\"x\":1}}\n")
            .write(b"{\"id\":\"1\",\"result\":{\"x\":1}}\n")
            .build();

        let conn = Connection::new(mock, &config(Framing::Newline), dispatcher());
        conn.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_application_error_keeps_connection_open() {
        let mock = Builder::new()
            .read(b"{\"id\":\"1\",\"method\":\"fail\"}\n")
            .write(b"{\"id\":\"1\",\"error\":{\"code\":7,\"message\":\"bad input\"}}\n")
            .read(b"{\"id\":\"2\",\"method\":\"echo\",\"params\":\"hi\"}\n")
            .write(b"{\"id\":\"2\",\"result\":\"hi\"}\n")
            .build();

        let conn = Connection::new(mock, &config(Framing::Newline), dispatcher());
        conn.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_split_across_reads() {
        let mock = Builder::new()
            .read(b"{\"id\":\"1\",\"meth")
            .read(b"od\":\"echo\",\"params\":[1]}\r\n")
            .write(b"{\"id\":\"1\",\"result\":[1]}\n")
            .build();

        let conn = Connection::new(mock, &config(Framing::Newline), dispatcher());
        conn.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_with_parse_error() {
        let mock = Builder::new()
            .read(b"abc\r\n2\r\n{}")
            .write(b"97\r\n{\"id\":\"unknown\",\"error\":{\"code\":-32700,\"message\":\"malformed frame: invalid length header 'abc'\"}}")
            .build();

        let conn = Connection::new(mock, &config(Framing::LengthPrefixed), dispatcher());
        let err = conn.run().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Frame(_)));
    }

    #[tokio::test]
    async fn test_malformed_payload_closes_with_parse_error() {
        let mock = Builder::new()
            .read(b"{not json}\n{\"id\":\"2\",\"method\":\"echo\"}\n")
            .write(b"{\"id\":\"unknown\",\"error\":{\"code\":-32700,\"message\":\"malformed payload: key must be a string at line 1 column 2\"}}\n")
            .build();

        let conn = Connection::new(mock, &config(Framing::Newline), dispatcher());
        let err = conn.run().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Decode(_)));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_invalid_request() {
        let mut request = b"{\"id\":\"1\",\"method\":\"echo\",\"params\":\"".to_vec();
        request.extend(std::iter::repeat(b'a').take(300));
        request.extend_from_slice(b"\"}\n");

        let mock = Builder::new()
            .read(&request)
            .write(b"{\"id\":\"unknown\",\"error\":{\"code\":-32600,\"message\":\"frame of 338 bytes exceeds limit of 256 bytes\"}}\n")
            .build();

        let conn = Connection::new(mock, &config(Framing::Newline), dispatcher());
        let err = conn.run().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Frame(_)));
    }

    #[tokio::test]
    async fn test_completed_reply_written_before_fatal_error() {
        let mock = Builder::new()
            .read(b"{\"id\":\"1\",\"method\":\"echo\",\"params\":1}\n{not json}\n")
            .write(b"{\"id\":\"1\",\"result\":1}\n")
            .write(b"{\"id\":\"unknown\",\"error\":{\"code\":-32700,\"message\":\"malformed payload: key must be a string at line 1 column 2\"}}\n")
            .build();

        let conn = Connection::new(mock, &config(Framing::Newline), dispatcher());
        let err = conn.run().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Decode(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_traffic_keeps_connection_alive() {
        let mut builder = Builder::new();
        for i in 0..4 {
            builder
                .wait(Duration::from_secs(3))
                .read(format!("{{\"id\":\"{i}\",\"method\":\"echo\",\"params\":{i}}}\n").as_bytes())
                .write(format!("{{\"id\":\"{i}\",\"result\":{i}}}\n").as_bytes());
        }
        let mock = builder.build();

        let started = tokio::time::Instant::now();
        let conn = Connection::new(mock, &config(Framing::Newline), dispatcher());
        conn.run().await.unwrap();

        // 12s of traffic against a 5s idle timeout.
        assert!(started.elapsed() >= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_off_after_eof() {
        let slow: Arc<dyn Dispatch> =
            Arc::new(|_method: String, params: RpcObject, respond: Responder| {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    respond.ok(params.into_value());
                });
            });

        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"{\"id\":\"1\",\"method\":\"later\",\"params\":\"done\"}\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let started = tokio::time::Instant::now();
        let conn = Connection::new(server, &config(Framing::Newline), slow);
        let (result, output) = tokio::join!(conn.run(), async {
            let mut output = Vec::new();
            client.read_to_end(&mut output).await.unwrap();
            output
        });

        result.unwrap();
        assert_eq!(output, b"{\"id\":\"1\",\"result\":\"done\"}\n");
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_times_out() {
        let mock = Builder::new()
            .write(b"{\"id\":\"unknown\",\"error\":{\"code\":-32603,\"message\":\"no data received for 5000ms\"}}\n")
            .build();

        let conn = Connection::new(mock, &config(Framing::Newline), dispatcher());
        let err = conn.run().await.unwrap_err();
        assert!(matches!(err, ConnectionError::IdleTimeout(_)));
    }

    #[tokio::test]
    async fn test_eof_waits_for_in_flight_responses() {
        let slow: Arc<dyn Dispatch> =
            Arc::new(|_method: String, params: RpcObject, respond: Responder| {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    respond.ok(params.into_value());
                });
            });

        let mock = Builder::new()
            .read(b"{\"id\":\"1\",\"method\":\"later\",\"params\":true}\n")
            .write(b"{\"id\":\"1\",\"result\":true}\n")
            .build();

        let conn = Connection::new(mock, &config(Framing::Newline), slow);
        conn.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_length_prefixed_round_trip() {
        let body = b"{\"id\":\"a\",\"method\":\"echo\",\"params\":null}";
        let mut request = format!("{}\r\n", body.len()).into_bytes();
        request.extend_from_slice(body);

        let mock = Builder::new()
            .read(&request)
            .write(b"24\r\n{\"id\":\"a\",\"result\":null}")
            .build();

        let conn = Connection::new(mock, &config(Framing::LengthPrefixed), dispatcher());
        conn.run().await.unwrap();
    }
}
