//! 隧道监听
//!
//! 每条隧道一个接受循环；每个接受到的连接在独立任务中完成拨号并交给中继，
//! 接受循环不会被拨号或中继阻塞。

mod forward;
mod reverse;

pub use forward::ForwardTunnel;
pub use reverse::ReverseTunnel;

use crate::buffer_pool::BufferPool;
use crate::config::TunnelSpec;
use crate::registry::{ConnectionIds, ConnectionKey, ConnectionRegistry};
use crate::relay::spawn_relay;
use crate::session::SessionManager;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 一条隧道运行所需的共享状态
pub struct TunnelContext {
    /// 隧道在配置中的序号
    pub index: usize,
    pub spec: TunnelSpec,
    pub sessions: Arc<SessionManager>,
    pub registry: ConnectionRegistry,
    pub pool: Arc<BufferPool>,
    pub chunk_size: usize,
    pub shutdown: CancellationToken,
    ids: ConnectionIds,
}

impl TunnelContext {
    pub fn new(
        index: usize,
        spec: TunnelSpec,
        sessions: Arc<SessionManager>,
        registry: ConnectionRegistry,
        pool: Arc<BufferPool>,
        chunk_size: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            index,
            spec,
            sessions,
            registry,
            pool,
            chunk_size,
            shutdown,
            ids: ConnectionIds::new(),
        }
    }

    /// 登记并启动一条中继
    ///
    /// 先登记后转发；关闭开始后才登记的连接立即关闭，不会逃过注册表清空。
    pub(crate) fn relay<L, R>(&self, local: L, remote: R, label: String)
    where
        L: AsyncRead + AsyncWrite + Send + 'static,
        R: AsyncRead + AsyncWrite + Send + 'static,
    {
        let key = ConnectionKey {
            tunnel: self.index,
            id: self.ids.next_id(),
        };
        let conn = self.registry.register(key, label);
        if self.shutdown.is_cancelled() {
            conn.close();
        }
        spawn_relay(conn, local, remote, self.pool.clone(), self.chunk_size);
    }

    pub(crate) fn log_stopped(&self) {
        info!("Tunnel {} ({}) stopped", self.index, self.spec.describe());
    }
}
