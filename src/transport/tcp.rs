//! TCP connector with optional TLS (rustls, webpki roots)

use super::{BoxedStream, Connector, Endpoint, TransportError};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Dials the broker over TCP and upgrades to TLS for secure endpoints
#[derive(Clone)]
pub struct TcpConnector {
    tls: TlsConnector,
}

impl TcpConnector {
    /// Build a connector trusting the Mozilla root set
    ///
    /// # Errors
    ///
    /// Fails if the TLS client configuration cannot be built.
    pub fn new() -> Result<Self, TransportError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(TransportError::TlsSetup)?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<BoxedStream> {
        let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        tcp.set_nodelay(true)?;
        debug!(endpoint = %endpoint, "TCP connection open");

        if !endpoint.secure {
            return Ok(Box::new(tcp));
        }

        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tls = self.tls.connect(server_name, tcp).await?;
        debug!(endpoint = %endpoint, "TLS handshake complete");
        Ok(Box::new(tls))
    }
}

impl std::fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnector").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_connector_builds() {
        assert!(TcpConnector::new().is_ok());
    }

    #[tokio::test]
    async fn test_plain_connect_to_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.is_ok() });

        let connector = TcpConnector::new().unwrap();
        let stream = connector
            .connect(&Endpoint::new("127.0.0.1", port, false))
            .await;

        assert!(stream.is_ok());
        assert!(accept.await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_refused_is_error() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TcpConnector::new().unwrap();
        let result = connector
            .connect(&Endpoint::new("127.0.0.1", port, false))
            .await;
        assert!(result.is_err());
    }
}
