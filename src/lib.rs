//! Multiplexed JSON-RPC client.
//!
//! Many concurrent callers share one persistent TCP (optionally TLS)
//! connection. Each call gets a unique id; a background reader matches
//! responses back to their callers no matter the order they arrive in, and
//! routes unsolicited notifications to a single handler.
//!
//! - `connection` - the [`Connection`] facade: connect, call, authenticate, close
//! - `registry` - correlation table of in-flight calls
//! - `message` / `framing` - wire encoding
//! - `transport` - TCP/TLS establishment
//! - `config` - [`ConnectionConfig`] and environment overrides
//!
//! ```ignore
//! use muxrpc::{Connection, ConnectionConfig};
//!
//! let conn = Connection::connect(ConnectionConfig::from_env()).await?;
//! let user = conn.authenticate(&my_signer).await?;
//! let stats = conn.invoke("getStats", vec![]).await?;
//! conn.close().await;
//! ```
//!
//! Logging goes through `tracing`; without a subscriber installed it is
//! discarded.

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod message;
pub mod registry;
pub mod transport;

mod keepalive;
mod reader;

pub use auth::{Signer, User};
pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionState};
pub use error::{ClientError, Result};
pub use framing::Framing;
pub use message::{Notification, RpcError};
pub use reader::NotificationHandler;
pub use registry::Outcome;
