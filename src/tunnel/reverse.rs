use super::TunnelContext;
use crate::session::BoxedStream;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 反向隧道：经会话在远端监听，连接本地
pub struct ReverseTunnel {
    ctx: Arc<TunnelContext>,
}

impl ReverseTunnel {
    pub fn new(ctx: Arc<TunnelContext>) -> Self {
        Self { ctx }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// 建立远端监听并接受入站通道；监听建立失败或失效后退避重建
    async fn run(self) {
        let ctx = self.ctx;

        'outer: loop {
            let session = match ctx.sessions.get_session().await {
                Ok(session) => session,
                Err(_) => break,
            };

            let mut listener = match session.listen(&ctx.spec.remote).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(
                        "Tunnel {} failed to listen on remote {}: {}, retrying",
                        ctx.index, ctx.spec.remote, e
                    );
                    ctx.sessions.report_failure(&session, &e).await;
                    if !ctx.sessions.backoff().await {
                        break;
                    }
                    continue;
                }
            };

            info!(
                "Tunnel {} listening on remote {} => {}",
                ctx.index, ctx.spec.remote, ctx.spec.local
            );
            let retired = ctx.sessions.retired_signal(&session);

            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = retired.cancelled() => {
                        info!(
                            "Tunnel {} session to {} was replaced, listening again on remote {}",
                            ctx.index,
                            ctx.sessions.address(),
                            ctx.spec.remote
                        );
                        break;
                    }
                    _ = ctx.shutdown.cancelled() => break 'outer,
                };

                match accepted {
                    Ok((stream, peer)) => {
                        debug!("Tunnel {} accepted remote {}", ctx.index, peer);
                        tokio::spawn(handle_inbound(ctx.clone(), stream, peer));
                    }
                    Err(e) => {
                        warn!(
                            "Tunnel {} lost remote listener on {}: {}",
                            ctx.index, ctx.spec.remote, e
                        );
                        ctx.sessions.report_failure(&session, &e).await;
                        break;
                    }
                }
            }

            drop(listener);
            if !ctx.sessions.backoff().await {
                break;
            }
        }

        ctx.log_stopped();
    }
}

async fn handle_inbound(ctx: Arc<TunnelContext>, remote: BoxedStream, peer: String) {
    match TcpStream::connect(&ctx.spec.local).await {
        Ok(local) => {
            let _ = local.set_nodelay(true);
            let label = format!("{} <= {}", ctx.spec.local, peer);
            info!("Tunnel {} connected {}", ctx.index, label);
            ctx.relay(local, remote, label);
        }
        Err(e) => {
            // 入站通道随 remote 一起释放
            warn!(
                "Tunnel {} failed to connect {} for remote {}: {}",
                ctx.index, ctx.spec.local, peer, e
            );
        }
    }
}
