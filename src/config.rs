//! Connection configuration.
//!
//! Defaults can be overridden programmatically with the `with_*` builders or
//! from the environment with [`ConnectionConfig::from_env`]:
//!
//! | variable                | meaning                                   |
//! |-------------------------|-------------------------------------------|
//! | `MUXRPC_HOST`           | server host                               |
//! | `MUXRPC_PORT`           | server port                               |
//! | `MUXRPC_TLS`            | `1`/`true` to wrap the stream in TLS      |
//! | `MUXRPC_FRAMING`        | `lines` or `content-length`               |
//! | `MUXRPC_KEEPALIVE_SECS` | keepalive interval, `0` disables it       |
//! | `MUXRPC_TIMEOUT_SECS`   | per-call timeout, `0` means wait forever  |

use std::time::Duration;

use tracing::warn;

use crate::framing::Framing;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 4000;

/// Default interval between keepalive calls.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Remote no-op method called by the keepalive loop.
pub const DEFAULT_KEEPALIVE_METHOD: &str = "ping";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Wrap the TCP stream in TLS.
    pub encrypted: bool,
    /// Name verified against the server certificate. Defaults to `host`.
    pub tls_server_name: Option<String>,
    pub framing: Framing,
    /// `None` disables the keepalive loop.
    pub keepalive_interval: Option<Duration>,
    pub keepalive_method: String,
    /// `None` means a call waits for its response indefinitely.
    pub call_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            encrypted: false,
            tls_server_name: None,
            framing: Framing::default(),
            keepalive_interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            keepalive_method: DEFAULT_KEEPALIVE_METHOD.to_string(),
            call_timeout: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Defaults overlaid with `MUXRPC_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a key lookup. Invalid values are logged and skipped.
    fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MUXRPC_HOST").filter(|h| !h.trim().is_empty()) {
            self.host = host.trim().to_string();
        }

        if let Some(port) = lookup("MUXRPC_PORT") {
            match port.trim().parse::<u16>() {
                Ok(port) => self.port = port,
                Err(e) => warn!("Ignoring invalid MUXRPC_PORT {:?}: {}", port, e),
            }
        }

        if let Some(tls) = lookup("MUXRPC_TLS") {
            match parse_bool(&tls) {
                Some(flag) => self.encrypted = flag,
                None => warn!("Ignoring invalid MUXRPC_TLS {:?}", tls),
            }
        }

        if let Some(framing) = lookup("MUXRPC_FRAMING") {
            match framing.parse::<Framing>() {
                Ok(framing) => self.framing = framing,
                Err(e) => warn!("Ignoring MUXRPC_FRAMING: {}", e),
            }
        }

        if let Some(secs) = lookup("MUXRPC_KEEPALIVE_SECS") {
            match secs.trim().parse::<u64>() {
                Ok(0) => self.keepalive_interval = None,
                Ok(n) => self.keepalive_interval = Some(Duration::from_secs(n)),
                Err(e) => warn!("Ignoring invalid MUXRPC_KEEPALIVE_SECS {:?}: {}", secs, e),
            }
        }

        if let Some(secs) = lookup("MUXRPC_TIMEOUT_SECS") {
            match secs.trim().parse::<u64>() {
                Ok(0) => self.call_timeout = None,
                Ok(n) => self.call_timeout = Some(Duration::from_secs(n)),
                Err(e) => warn!("Ignoring invalid MUXRPC_TIMEOUT_SECS {:?}: {}", secs, e),
            }
        }

        self
    }

    pub fn with_tls(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn with_tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.tls_server_name = Some(name.into());
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_keepalive(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_keepalive_method(mut self, method: impl Into<String>) -> Self {
        self.keepalive_method = method.into();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// `host:port`, for logging.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Name presented for TLS certificate verification.
    pub fn server_name(&self) -> &str {
        self.tls_server_name.as_deref().unwrap_or(&self.host)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> ConnectionConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ConnectionConfig::default().with_overrides(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.address(), "127.0.0.1:4000");
        assert!(!config.encrypted);
        assert_eq!(config.framing, Framing::Lines);
        assert_eq!(config.keepalive_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.keepalive_method, "ping");
        assert_eq!(config.call_timeout, None);
    }

    #[test]
    fn test_env_overrides_applied() {
        let config = overrides(&[
            ("MUXRPC_HOST", "rpc.example.com"),
            ("MUXRPC_PORT", "443"),
            ("MUXRPC_TLS", "true"),
            ("MUXRPC_FRAMING", "content-length"),
            ("MUXRPC_KEEPALIVE_SECS", "0"),
            ("MUXRPC_TIMEOUT_SECS", "15"),
        ]);

        assert_eq!(
            config,
            ConnectionConfig {
                host: "rpc.example.com".to_string(),
                port: 443,
                encrypted: true,
                tls_server_name: None,
                framing: Framing::ContentLength,
                keepalive_interval: None,
                keepalive_method: "ping".to_string(),
                call_timeout: Some(Duration::from_secs(15)),
            }
        );
    }

    #[test]
    fn test_invalid_env_values_ignored() {
        let config = overrides(&[
            ("MUXRPC_PORT", "not-a-port"),
            ("MUXRPC_TLS", "maybe"),
            ("MUXRPC_FRAMING", "xml"),
            ("MUXRPC_HOST", "   "),
        ]);
        assert_eq!(config, ConnectionConfig::default());
    }

    #[test]
    fn test_server_name_defaults_to_host() {
        let config = ConnectionConfig::new("api.example.com", 443).with_tls(true);
        assert_eq!(config.server_name(), "api.example.com");

        let config = config.with_tls_server_name("edge.example.com");
        assert_eq!(config.server_name(), "edge.example.com");
    }
}
