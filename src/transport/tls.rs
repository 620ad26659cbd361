use super::{tune_tcp_stream, BoxedTransport, TransportClient};
use anyhow::{Context, Result};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

/// TLS 传输客户端
pub struct TlsTransportClient {
    address: String,
    server_name: String,
    connector: TlsConnector,
}

impl TlsTransportClient {
    pub fn new(address: String, server_name: String, connector: TlsConnector) -> Self {
        Self {
            address,
            server_name,
            connector,
        }
    }
}

#[async_trait]
impl TransportClient for TlsTransportClient {
    async fn connect(&self) -> Result<BoxedTransport> {
        debug!("Connecting to {} via TLS", self.address);

        let tcp_stream = TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("Failed to connect to {}", self.address))?;
        tune_tcp_stream(&tcp_stream);

        let server_name = ServerName::try_from(self.server_name.clone())
            .with_context(|| format!("Invalid server name '{}'", self.server_name))?;

        let tls_stream = self
            .connector
            .connect(server_name, tcp_stream)
            .await
            .context("TLS handshake failed")?;

        info!("TLS connection established to {}", self.address);
        Ok(Box::pin(tls_stream))
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// TLS 传输服务器
///
/// TCP accept 与 TLS 握手分开进行，握手放在每个连接自己的任务中
pub struct TlsTransportServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsTransportServer {
    pub async fn bind(addr: &str, acceptor: TlsAcceptor) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        info!("TLS transport server listening on {}", listener.local_addr()?);

        Ok(Self { listener, acceptor })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 接受新的 TCP 连接（尚未握手）
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (tcp_stream, peer_addr) = self
            .listener
            .accept()
            .await
            .context("Failed to accept TCP connection")?;
        tune_tcp_stream(&tcp_stream);
        debug!("Accepted TCP connection from {}", peer_addr);
        Ok((tcp_stream, peer_addr))
    }

    /// 完成 TLS 握手
    pub async fn handshake(&self, tcp_stream: TcpStream) -> Result<BoxedTransport> {
        let tls_stream = self
            .acceptor
            .accept(tcp_stream)
            .await
            .context("TLS handshake failed")?;
        Ok(Box::pin(tls_stream))
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.clone()
    }
}
