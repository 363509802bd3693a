//! TLS listener
//! Reads the SNI from each ClientHello and terminates TLS with a per-domain certificate

use crate::proxy::{ProxyServer, Scheme};
use anyhow::{Context, Result};
use rustls::server::Acceptor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

/// Name used when the client sends no SNI
const DEFAULT_SERVER_NAME: &str = "localhost";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

impl ProxyServer {
    /// Accept TLS connections from `listener`
    pub async fn serve_https(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("HTTPS server listening on {}", listener.local_addr()?);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("HTTPS accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_tls_connection(stream, remote_addr).await {
                    debug!("HTTPS connection error from {}: {:#}", remote_addr, e);
                }
            });
        }
    }

    async fn handle_tls_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> Result<()> {
        let acceptor = LazyConfigAcceptor::new(Acceptor::default(), stream);
        let start = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor)
            .await
            .context("TLS ClientHello timed out")?
            .context("Failed to read TLS ClientHello")?;

        let server_name = start
            .client_hello()
            .server_name()
            .unwrap_or(DEFAULT_SERVER_NAME)
            .to_string();
        debug!("SNI callback for domain: {}", server_name);

        // Dropping `start` closes the socket, so the handshake fails for this client only
        let Some(config) = self.ca.build_tls_config(&server_name).await else {
            warn!(
                "No certificate for {}, closing connection from {}",
                server_name, remote_addr
            );
            return Ok(());
        };

        let tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, start.into_stream(config))
            .await
            .context("TLS handshake timed out")?
            .with_context(|| format!("TLS handshake failed for {}", server_name))?;

        self.serve_connection(tls, remote_addr, Scheme::Https).await
    }
}
