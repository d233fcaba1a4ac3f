//! Transport establishment: TCP, optionally wrapped in TLS.
//!
//! The stream is split into an owned read half (handed to the reader loop)
//! and an owned write half (shared by callers behind a lock).

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::error::{ClientError, Result};

/// Read half of an established transport.
pub type TransportReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

/// Write half of an established transport.
pub type TransportWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Open the transport described by `config`.
///
/// # Errors
///
/// Returns `ClientError::ConnectionFailed` if the TCP connection or the TLS
/// handshake fails.
pub async fn open(config: &ConnectionConfig) -> Result<(TransportReader, TransportWriter)> {
    let address = config.address();
    debug!("Connecting to {}", address);

    let stream = TcpStream::connect((config.host.as_str(), config.port))
        .await
        .map_err(ClientError::ConnectionFailed)?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY on {}: {}", address, e);
    }

    if config.encrypted {
        let connector = tls_connector()?;
        let server_name = ServerName::try_from(config.server_name().to_string()).map_err(|e| {
            ClientError::ConnectionFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid TLS server name {:?}: {}", config.server_name(), e),
            ))
        })?;

        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(ClientError::ConnectionFailed)?;
        info!("Connected to {} (TLS)", address);

        let (read, write) = tokio::io::split(tls);
        Ok(into_halves(read, write))
    } else {
        info!("Connected to {}", address);
        let (read, write) = stream.into_split();
        Ok(into_halves(read, write))
    }
}

/// Box arbitrary stream halves into the transport types.
pub fn into_halves<R, W>(read: R, write: W) -> (TransportReader, TransportWriter)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let read: Box<dyn AsyncRead + Send + Unpin> = Box::new(read);
    (BufReader::new(read), Box::new(write))
}

fn tls_connector() -> Result<TlsConnector> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| {
        ClientError::ConnectionFailed(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Failed to build TLS configuration: {}", e),
        ))
    })?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}
