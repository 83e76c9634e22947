//! framed-rpc: a framed JSON-RPC server
//!
//! Runs the server with a small built-in method set:
//! - `echo`: returns its params
//! - `ping`: returns "pong"
//! - `sleep`: waits `{"ms": n}` milliseconds, then returns n
//! - `fail`: fails with the given `{"code": n, "message": s}`
//!
//! Configuration via CLI arguments or TOML file.

use framed_rpc::config::Config;
use framed_rpc::{ErrorCode, Responder, RpcError, RpcObject, Server};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        framing = %config.server.framing,
        idle_timeout_ms = config.server.idle_timeout.as_millis() as u64,
        max_frame_size = config.server.max_frame_size,
        "Starting framed-rpc server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::new(
        tokio::runtime::Handle::current(),
        config.server.clone(),
        demo_dispatch,
    );

    let handle = server.start(&config.host, config.port).await?;
    info!(address = %handle.local_addr(), "Ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }

    handle.stop().await?;
    Ok(())
}

fn demo_dispatch(method: String, params: RpcObject, respond: Responder) {
    match method.as_str() {
        "echo" => respond.ok(params.into_value()),
        "ping" => respond.ok(json!("pong")),
        "sleep" => {
            let Some(ms) = params.get("ms").and_then(Value::as_u64) else {
                respond.err(RpcError::invalid_params("expected {\"ms\": <integer>}"));
                return;
            };
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                respond.ok(json!(ms));
            });
        }
        "fail" => {
            let code = params
                .get("code")
                .and_then(Value::as_i64)
                .unwrap_or(ErrorCode::InternalError.code());
            let message = params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("requested failure");
            respond.err(RpcError::new(code, message));
        }
        _ => respond.err(RpcError::method_not_found(&method)),
    }
}
