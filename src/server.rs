//! TCP server lifecycle.
//!
//! Owns the listening socket and the lifecycle state machine. Every accepted
//! connection gets its own [`Connection`] task wired with the configured
//! pipeline and the shared dispatch function.

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::ServerError;
use crate::handler::Dispatch;
use crate::state::ServerState;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

/// Pending connection queue length for the listening socket
pub const LISTEN_BACKLOG: i32 = 256;

/// First pause after a failed accept
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
/// Longest pause between failing accepts
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay between consecutive accept failures (descriptor exhaustion and the
/// like). Doubles on every failure, resets on success.
#[derive(Debug)]
struct AcceptBackoff {
    next: Duration,
}

impl AcceptBackoff {
    fn new() -> Self {
        Self {
            next: ACCEPT_BACKOFF_MIN,
        }
    }

    fn failed(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(ACCEPT_BACKOFF_MAX);
        delay
    }

    fn reset(&mut self) {
        self.next = ACCEPT_BACKOFF_MIN;
    }
}

/// A running accept loop.
struct Listening {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    acceptor: JoinHandle<()>,
}

/// Lock-protected lifecycle data.
struct Lifecycle {
    state: ServerState,
    listening: Option<Listening>,
}

struct Shared {
    runtime: Handle,
    config: Arc<ServerConfig>,
    dispatcher: Arc<dyn Dispatch>,
    lifecycle: Mutex<Lifecycle>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let lifecycle = self.lock();
        let state = &lifecycle.state;
        if state.holds_listener() {
            error!(state = %state, "Server released without being stopped");
            if cfg!(debug_assertions) && !std::thread::panicking() {
                panic!("server released in state {state}; call stop() first");
            }
        }
    }
}

/// RPC server instance. Cheap to clone; clones share one lifecycle.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    /// Create a server that will run its listener and connections on `runtime`.
    pub fn new<D: Dispatch>(runtime: Handle, config: ServerConfig, dispatcher: D) -> Self {
        Server {
            shared: Arc::new(Shared {
                runtime,
                config: Arc::new(config),
                dispatcher: Arc::new(dispatcher),
                lifecycle: Mutex::new(Lifecycle {
                    state: ServerState::Initializing,
                    listening: None,
                }),
            }),
        }
    }

    /// Bind to `host:port` and start accepting connections.
    ///
    /// # Panics
    ///
    /// If the server is not in [`ServerState::Initializing`]. A server is
    /// started at most once.
    ///
    /// A failed bind leaves the server in [`ServerState::Starting`]; it cannot
    /// be started again.
    pub async fn start(&self, host: &str, port: u16) -> Result<ServerHandle, ServerError> {
        let address = format!("{host}:{port}");
        {
            let mut lifecycle = self.shared.lock();
            assert!(
                lifecycle.state == ServerState::Initializing,
                "start() called on a server in state {}",
                lifecycle.state
            );
            lifecycle
                .state
                .transition(ServerState::Starting(address.clone()))?;
        }

        info!(address = %address, "Starting server");

        let addr = resolve(&address).await?;
        let listener = bind_listener(addr, &self.shared.runtime).map_err(|source| {
            error!(address = %address, error = %source, "Bind failed");
            ServerError::Bind {
                address: address.clone(),
                source,
            }
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { address, source })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let acceptor = self.shared.runtime.spawn(accept_loop(
            listener,
            shutdown_rx,
            Arc::clone(&self.shared.config),
            Arc::clone(&self.shared.dispatcher),
        ));

        {
            let mut lifecycle = self.shared.lock();
            lifecycle.state.transition(ServerState::Started)?;
            lifecycle.listening = Some(Listening {
                local_addr,
                shutdown: shutdown_tx,
                acceptor,
            });
        }

        info!(
            address = %local_addr,
            framing = %self.shared.config.framing,
            idle_timeout_ms = self.shared.config.idle_timeout.as_millis() as u64,
            "Server listening"
        );

        Ok(ServerHandle {
            server: self.clone(),
            local_addr,
        })
    }

    /// Close the listener. Resolves once the server has reached
    /// [`ServerState::Stopped`].
    ///
    /// Fails with [`ServerError::NotReady`] unless the server is started.
    /// Connections already accepted keep running until they close.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let listening = {
            let mut lifecycle = self.shared.lock();
            if lifecycle.state != ServerState::Started {
                return Err(ServerError::NotReady(lifecycle.state.clone()));
            }
            lifecycle.state.transition(ServerState::Stopping)?;
            lifecycle.listening.take()
        };

        info!("Stopping server");

        // Completes even if the caller stops polling.
        let shared = Arc::clone(&self.shared);
        let completion = self.shared.runtime.spawn(async move {
            if let Some(listening) = listening {
                let _ = listening.shutdown.send(());
                if let Err(e) = listening.acceptor.await {
                    error!(error = %e, "Accept loop did not exit cleanly");
                }
                debug!(address = %listening.local_addr, "Listener closed");
            }

            let result = shared.lock().state.transition(ServerState::Stopped);
            result
        });

        match completion.await {
            Ok(result) => {
                result?;
                info!("Server stopped");
                Ok(())
            }
            Err(e) => Err(ServerError::Shutdown(e.to_string())),
        }
    }

    /// Snapshot of the current lifecycle state.
    pub fn state(&self) -> ServerState {
        self.shared.lock().state.clone()
    }

    /// Bound address while the server is listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .lock()
            .listening
            .as_ref()
            .map(|listening| listening.local_addr)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state())
            .field("config", &self.shared.config)
            .finish()
    }
}

/// Returned by a successful [`Server::start`].
#[derive(Debug, Clone)]
pub struct ServerHandle {
    server: Server,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// Address the listener is bound to (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub async fn stop(&self) -> Result<(), ServerError> {
        self.server.stop().await
    }
}

async fn resolve(address: &str) -> Result<SocketAddr, ServerError> {
    let mut addrs = tokio::net::lookup_host(address)
        .await
        .map_err(|source| ServerError::Resolve {
            address: address.to_string(),
            source,
        })?;

    addrs.next().ok_or_else(|| ServerError::Resolve {
        address: address.to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
    })
}

fn bind_listener(addr: SocketAddr, runtime: &Handle) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    // Register with the server's runtime, not the caller's.
    let _guard = runtime.enter();
    TcpListener::from_std(socket.into())
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown: oneshot::Receiver<()>,
    config: Arc<ServerConfig>,
    dispatcher: Arc<dyn Dispatch>,
) {
    let mut backoff = AcceptBackoff::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                trace!("Listener exit loop");
                break;
            }
            res = listener.accept() => {
                match res {
                    Ok((stream, peer)) => {
                        backoff.reset();
                        if let Err(e) = stream.set_nodelay(true) {
                            trace!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }

                        let conn = Connection::new(stream, &config, Arc::clone(&dispatcher));
                        debug!(peer = %peer, pipeline = %conn.pipeline(), "New connection");

                        tokio::spawn(async move {
                            match conn.run().await {
                                Ok(()) => debug!(peer = %peer, "Connection closed"),
                                Err(e) => debug!(peer = %peer, error = %e, "Connection error"),
                            }
                        });
                    }
                    Err(e) => {
                        let delay = backoff.failed();
                        error!(error = %e, retry_ms = delay.as_millis() as u64, "Failed to accept connection");
                        tokio::select! {
                            _ = &mut shutdown => {
                                trace!("Listener exit loop");
                                break;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }
}
