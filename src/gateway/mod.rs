//! 网关
//!
//! 接受客户端的 TLS 连接，校验用户，在 yamux 之上处理客户端的 dial / listen / ping 请求。

mod client;

use crate::buffer_pool::BufferPool;
use crate::config::GatewayConfig;
use crate::tls;
use crate::transport::TlsTransportServer;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// TLS 握手与认证的最长时间
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// 网关共享状态
pub(crate) struct GatewayState {
    pub config: GatewayConfig,
    pub pool: Arc<BufferPool>,
    pub shutdown: CancellationToken,
}

pub struct Gateway {
    server: TlsTransportServer,
    state: Arc<GatewayState>,
    clients: AtomicUsize,
}

impl Gateway {
    /// 绑定监听地址
    pub async fn bind(config: GatewayConfig, acceptor: TlsAcceptor) -> Result<Self> {
        let addr = format!("{}:{}", config.bind_addr, config.bind_port);
        let server = TlsTransportServer::bind(&addr, acceptor).await?;
        Ok(Self {
            server,
            state: Arc::new(GatewayState {
                config,
                pool: Arc::new(BufferPool::new()),
                shutdown: CancellationToken::new(),
            }),
            clients: AtomicUsize::new(0),
        })
    }

    /// 按配置加载（或生成）证书并绑定
    pub async fn from_config(config: GatewayConfig) -> Result<Self> {
        let tls_config =
            tls::gateway_config(&config).context("Failed to load gateway TLS configuration")?;
        Self::bind(config, TlsAcceptor::from(tls_config)).await
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    /// 用于停止网关的令牌
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// 运行接受循环，直到关闭
    pub async fn run(self) -> Result<()> {
        info!(
            "Gateway listening on {} (dial: {}, listen: {})",
            self.server.local_addr()?,
            self.state.config.allow_dial,
            self.state.config.allow_listen
        );

        loop {
            let accepted = tokio::select! {
                accepted = self.server.accept() => accepted,
                _ = self.state.shutdown.cancelled() => break,
            };

            let (tcp_stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {:#}", e);
                    continue;
                }
            };

            let client_id = self.clients.fetch_add(1, Ordering::Relaxed) + 1;
            let acceptor = self.server.acceptor();
            let state = self.state.clone();

            tokio::spawn(async move {
                let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp_stream));
                let transport = match handshake.await {
                    Ok(Ok(tls_stream)) => tls_stream,
                    Ok(Err(e)) => {
                        warn!("TLS handshake with {} failed: {}", peer, e);
                        return;
                    }
                    Err(_) => {
                        warn!("TLS handshake with {} timed out", peer);
                        return;
                    }
                };

                if let Err(e) = client::serve(client_id, peer, Box::pin(transport), state).await {
                    warn!("Client #{} ({}) error: {}", client_id, peer, e);
                }
            });
        }

        info!("Gateway stopped");
        Ok(())
    }
}
