use super::TunnelContext;
use crate::session::Session;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 正向隧道：本地监听，经会话连接远端
pub struct ForwardTunnel {
    ctx: Arc<TunnelContext>,
    listener: TcpListener,
}

impl ForwardTunnel {
    /// 绑定本地监听地址
    pub async fn bind(ctx: Arc<TunnelContext>) -> io::Result<Self> {
        let listener = TcpListener::bind(&ctx.spec.local).await?;
        info!(
            "Tunnel {} listening on {} => {}",
            ctx.index,
            listener.local_addr()?,
            ctx.spec.remote
        );
        Ok(Self { ctx, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// 接受循环，仅在 accept 失败或关闭时结束
    ///
    /// 会话在循环内获取：重连期间最多保留一条等待中的本地连接，其余新连接直接关闭。
    async fn run(self) {
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = self.ctx.shutdown.cancelled() => break,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(
                        "Tunnel {} failed to accept on {}: {}",
                        self.ctx.index, self.ctx.spec.local, e
                    );
                    break;
                }
            };
            debug!("Tunnel {} accepted {}", self.ctx.index, peer);

            let session = match self.wait_session().await {
                Ok(session) => session,
                Err(e) => {
                    debug!("Tunnel {} dropping {}: {}", self.ctx.index, peer, e);
                    break;
                }
            };

            tokio::spawn(dial_and_relay(self.ctx.clone(), session, stream, peer));
        }
        self.ctx.log_stopped();
    }

    /// 获取会话；等待期间新到的本地连接立即关闭
    async fn wait_session(&self) -> crate::error::Result<Arc<dyn Session>> {
        let pending = self.ctx.sessions.get_session();
        tokio::pin!(pending);

        loop {
            tokio::select! {
                biased;
                session = &mut pending => return session,
                accepted = self.listener.accept() => match accepted {
                    Ok((_, peer)) => {
                        warn!(
                            "Tunnel {} closing {}: session to {} unavailable",
                            self.ctx.index,
                            peer,
                            self.ctx.sessions.address()
                        );
                    }
                    // 留给外层循环处理
                    Err(_) => return pending.await,
                },
            }
        }
    }
}

async fn dial_and_relay(
    ctx: Arc<TunnelContext>,
    session: Arc<dyn Session>,
    local: TcpStream,
    peer: SocketAddr,
) {
    let _ = local.set_nodelay(true);

    match session.dial(&ctx.spec.remote).await {
        Ok(remote) => {
            let label = format!("{} => {}", peer, ctx.spec.remote);
            info!("Tunnel {} connected {}", ctx.index, label);
            ctx.relay(local, remote, label);
        }
        Err(e) => {
            warn!(
                "Tunnel {} failed to dial {} for {}: {}",
                ctx.index, ctx.spec.remote, peer, e
            );
            drop(local);
            ctx.sessions.report_failure(&session, &e).await;
        }
    }
}
