//! Request handling: the dispatch seam and its one-shot completion.
//!
//! Every decoded request is handed to the user's [`Dispatch`] implementation
//! together with a [`Responder`]. The responder is consumed by
//! [`Responder::respond`], so a request can be answered at most once. The
//! connection keeps the matching receiving half in its [`PendingReplies`] set
//! and writes the response when it resolves.

use crate::protocol::{Request, Response, RpcError, RpcObject};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{trace, warn};

/// Result a dispatch function completes a request with.
pub type DispatchResult = Result<Value, RpcError>;

/// User-supplied request handler, shared by every connection.
///
/// Implementations must not block: long-running work should be spawned and
/// the responder completed from there.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, method: String, params: RpcObject, respond: Responder);
}

impl<F> Dispatch for F
where
    F: Fn(String, RpcObject, Responder) + Send + Sync + 'static,
{
    fn dispatch(&self, method: String, params: RpcObject, respond: Responder) {
        self(method, params, respond)
    }
}

/// Single-use completion handle for one request.
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<DispatchResult>,
}

impl Responder {
    /// Create a responder and the receiver its result is delivered to.
    pub fn channel() -> (Self, oneshot::Receiver<DispatchResult>) {
        let (tx, rx) = oneshot::channel();
        (Responder { tx }, rx)
    }

    /// Complete the request. Never blocks; a closed connection discards the result.
    pub fn respond(self, result: DispatchResult) {
        if self.tx.send(result).is_err() {
            trace!("Connection closed before response was ready");
        }
    }

    pub fn ok(self, value: Value) {
        self.respond(Ok(value))
    }

    pub fn err(self, error: RpcError) {
        self.respond(Err(error))
    }

    /// Whether the connection that issued the request has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

type ReplyFuture = Pin<Box<dyn Future<Output = Option<Response>> + Send>>;

/// Outstanding requests on one connection, resolved in completion order.
pub struct PendingReplies {
    inner: FuturesUnordered<ReplyFuture>,
    request_timeout: Option<Duration>,
}

impl PendingReplies {
    pub fn new(request_timeout: Option<Duration>) -> Self {
        Self {
            inner: FuturesUnordered::new(),
            request_timeout,
        }
    }

    /// Invoke the dispatch function for `request` and track its completion.
    pub fn dispatch(&mut self, dispatcher: &dyn Dispatch, request: Request) {
        let Request { id, method, params } = request;
        trace!(id = %id, method = %method, "Dispatching request");

        let (responder, rx) = Responder::channel();
        dispatcher.dispatch(method, RpcObject::new(params), responder);

        let request_timeout = self.request_timeout;
        self.inner.push(Box::pin(async move {
            let completion = match request_timeout {
                Some(limit) => match tokio::time::timeout(limit, rx).await {
                    Ok(completion) => completion,
                    Err(_) => {
                        warn!(id = %id, timeout_ms = limit.as_millis() as u64, "Request timed out");
                        return Some(Response::failure(id, RpcError::internal("request timed out")));
                    }
                },
                None => rx.await,
            };

            match completion {
                Ok(result) => Some(Response::from_result(id, result)),
                Err(_) => {
                    warn!(id = %id, "Responder dropped without a response");
                    None
                }
            }
        }));
    }

    /// Wait for the next request to finish.
    ///
    /// Yields `None` for abandoned requests. Pending forever when nothing is
    /// outstanding, so it can sit in a `select!` unguarded.
    pub async fn next(&mut self) -> Option<Response> {
        if self.inner.is_empty() {
            return std::future::pending().await;
        }
        self.inner.next().await.flatten()
    }

    /// Take every reply that has already completed, without waiting.
    pub fn drain_ready(&mut self) -> Vec<Response> {
        let mut ready = Vec::new();
        while let Some(Some(reply)) = self.inner.next().now_or_never() {
            ready.extend(reply);
        }
        ready
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
