/// 隧道引擎
///
/// 每个远端主机一个引擎：持有会话管理器、连接注册表和缓冲池，
/// 为每条隧道启动一个监听任务。
use crate::buffer_pool::BufferPool;
use crate::config::{Direction, HostConfig};
use crate::error::{Result, TunnelError};
use crate::registry::ConnectionRegistry;
use crate::session::{
    Connector, CredentialProvider, SessionConfig, SessionManager, SessionState, YamuxConnector,
};
use crate::tunnel::{ForwardTunnel, ReverseTunnel, TunnelContext};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Engine {
    host: HostConfig,
    sessions: Arc<SessionManager>,
    registry: ConnectionRegistry,
    pool: Arc<BufferPool>,
    shutdown: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
    listen_addrs: Mutex<Vec<(usize, SocketAddr)>>,
}

impl Engine {
    pub fn new(
        host: HostConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let sessions = SessionManager::new(SessionConfig::from_host(&host), connector, credentials);
        Self {
            host,
            sessions,
            registry: ConnectionRegistry::new(),
            pool: Arc::new(BufferPool::new()),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            listen_addrs: Mutex::new(Vec::new()),
        }
    }

    /// 使用 TLS + yamux 连接网关
    pub fn from_config(
        host: HostConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> anyhow::Result<Self> {
        let connector = YamuxConnector::tls(&host)?;
        Ok(Self::new(host, Arc::new(connector), credentials))
    }

    pub fn address(&self) -> &str {
        &self.host.address
    }

    /// 启动所有隧道，不等待它们结束
    ///
    /// 会话在第一次使用时才建立。正向隧道在返回前已完成本地绑定；
    /// 绑定失败的隧道记录错误后跳过，不影响其他隧道。
    pub async fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TunnelError::Shutdown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Engine for {} already started", self.host.address);
            return Ok(());
        }

        self.sessions.ensure_credential().await?;

        info!(
            "Starting {} tunnel(s) via {}",
            self.host.tunnels.len(),
            self.host.address
        );

        for (index, spec) in self.host.tunnels.iter().enumerate() {
            let ctx = Arc::new(TunnelContext::new(
                index,
                spec.clone(),
                self.sessions.clone(),
                self.registry.clone(),
                self.pool.clone(),
                self.host.buffer_size,
                self.shutdown.clone(),
            ));

            match spec.direction {
                Direction::Forward => match ForwardTunnel::bind(ctx).await {
                    Ok(tunnel) => {
                        if let Ok(addr) = tunnel.local_addr() {
                            self.listen_addrs.lock().push((index, addr));
                        }
                        tunnel.spawn();
                    }
                    Err(e) => {
                        error!(
                            "Tunnel {} failed to listen on {}: {}",
                            index, spec.local, e
                        );
                    }
                },
                Direction::Reverse => {
                    ReverseTunnel::new(ctx).spawn();
                }
            }
        }

        Ok(())
    }

    /// 关闭引擎（幂等）
    ///
    /// 关闭会话并关闭注册表中的所有连接；不等待监听任务退出。
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Closing tunnels via {}", self.host.address);
        self.shutdown.cancel();
        self.sessions.close().await;

        let closed = self.registry.drain();
        info!(
            "Engine for {} closed ({} connection(s) closed)",
            self.host.address, closed
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 正向隧道实际绑定的本地地址（隧道序号，地址）
    pub fn listen_addrs(&self) -> Vec<(usize, SocketAddr)> {
        self.listen_addrs.lock().clone()
    }

    pub fn session_state(&self) -> SessionState {
        self.sessions.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.sessions.subscribe()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }
}
