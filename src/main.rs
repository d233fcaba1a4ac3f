//! muxrpc - invoke one remote method and print the result.
//!
//! ```text
//! muxrpc [--listen <secs>] <method> [params-json]
//! ```
//!
//! Connection settings come from `MUXRPC_*` environment variables (see
//! `ConnectionConfig::from_env`). With `--listen`, server notifications are
//! printed to stderr for the given number of seconds after the call.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use muxrpc::{Connection, ConnectionConfig};

#[derive(Parser, Debug)]
#[command(name = "muxrpc")]
#[command(about = "Invoke one remote method over a multiplexed JSON-RPC connection")]
struct Args {
    /// Print server notifications for this many seconds after the call
    #[arg(long, value_name = "SECS")]
    listen: Option<u64>,

    /// Remote method name
    method: String,

    /// Params as a JSON value
    #[arg(value_parser = parse_params)]
    params: Option<Value>,
}

fn parse_params(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "muxrpc=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let args = Args::parse();
    let config = ConnectionConfig::from_env();
    tracing::info!("muxrpc v{} connecting to {}", env!("CARGO_PKG_VERSION"), config.address());

    let conn = Connection::connect(config)
        .await
        .context("Failed to connect")?;

    let listen = args.listen.map(Duration::from_secs);
    if listen.is_some() {
        conn.set_notification_handler(|notification| {
            let params = notification.params.unwrap_or(Value::Null);
            eprintln!("<- {} {}", notification.method, params);
        });
    }

    let outcome = conn.call(&args.method, args.params).await;

    if let Some(listen) = listen {
        tokio::select! {
            _ = tokio::time::sleep(listen) => {}
            _ = conn.closed() => tracing::warn!("Server closed the connection"),
        }
    }
    conn.close().await;

    let result = outcome.with_context(|| format!("Call to {} failed", args.method))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
