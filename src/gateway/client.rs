use super::{GatewayState, HANDSHAKE_TIMEOUT};
use crate::error::{Result, TunnelError};
use crate::mux::{self, MuxHandle, MuxStream};
use crate::protocol::{
    read_frame, write_frame, AuthRequest, AuthResponse, InboundHeader, StreamRequest,
    StreamResponse, PROTOCOL_VERSION,
};
use crate::registry::{ConnectionIds, ConnectionKey, ConnectionRegistry};
use crate::relay::{spawn_relay, RELAY_CHUNK_SIZE};
use crate::transport::{tune_tcp_stream, BoxedTransport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 读取通道请求帧的超时
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// 单个客户端会话的状态
struct ClientContext {
    id: usize,
    user: String,
    state: Arc<GatewayState>,
    mux: MuxHandle,
    registry: ConnectionRegistry,
    ids: ConnectionIds,
}

impl ClientContext {
    fn next_key(&self) -> ConnectionKey {
        ConnectionKey {
            tunnel: self.id,
            id: self.ids.next_id(),
        }
    }
}

/// 认证客户端并运行其 yamux 会话，直到连接结束
pub(super) async fn serve(
    id: usize,
    peer: SocketAddr,
    mut transport: BoxedTransport,
    state: Arc<GatewayState>,
) -> Result<()> {
    let request: AuthRequest = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut transport))
        .await
        .map_err(|_| TunnelError::timeout(HANDSHAKE_TIMEOUT))??;

    if request.version != PROTOCOL_VERSION {
        write_frame(
            &mut transport,
            &AuthResponse::rejected(format!(
                "unsupported protocol version {}",
                request.version
            )),
        )
        .await?;
        return Err(TunnelError::protocol(format!(
            "Client {} speaks protocol version {}",
            peer, request.version
        )));
    }

    if !state.config.authorize(&request.user, &request.password) {
        warn!("Rejected login from {} as '{}'", peer, request.user);
        write_frame(
            &mut transport,
            &AuthResponse::rejected("invalid user or password"),
        )
        .await?;
        return Ok(());
    }

    write_frame(&mut transport, &AuthResponse::accepted()).await?;
    info!("Client #{} ({}) authenticated as '{}'", id, peer, request.user);

    // 驱动任务结束时回调随之释放，inbound_rx 收到 None
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let handle = mux::spawn(transport, mux::Mode::Server, format!("client #{}", id), move |stream| {
        let _ = inbound_tx.send(stream);
    });

    let ctx = Arc::new(ClientContext {
        id,
        user: request.user,
        state: state.clone(),
        mux: handle.clone(),
        registry: ConnectionRegistry::new(),
        ids: ConnectionIds::new(),
    });

    loop {
        tokio::select! {
            stream = inbound_rx.recv() => match stream {
                Some(stream) => {
                    tokio::spawn(handle_stream(stream, ctx.clone()));
                }
                None => break,
            },
            _ = state.shutdown.cancelled() => {
                handle.close().await;
                break;
            }
        }
    }

    let closed = ctx.registry.drain();
    info!(
        "Client #{} ({}, '{}') disconnected, {} connection(s) closed",
        id, peer, ctx.user, closed
    );
    Ok(())
}

async fn handle_stream(mut stream: MuxStream, ctx: Arc<ClientContext>) {
    let request: StreamRequest =
        match tokio::time::timeout(REQUEST_TIMEOUT, read_frame(&mut stream)).await {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => {
                debug!("Client #{} sent a bad request: {}", ctx.id, e);
                return;
            }
            Err(_) => {
                debug!("Client #{} opened a channel without a request", ctx.id);
                return;
            }
        };

    let result = match request {
        StreamRequest::Ping => write_frame(&mut stream, &StreamResponse::ok()).await,
        StreamRequest::Dial { target } => handle_dial(stream, target, &ctx).await,
        StreamRequest::Listen { bind, listener_id } => {
            handle_listen(stream, bind, listener_id, &ctx).await
        }
    };

    if let Err(e) = result {
        debug!("Client #{} channel error: {}", ctx.id, e);
    }
}

async fn handle_dial(mut stream: MuxStream, target: String, ctx: &Arc<ClientContext>) -> Result<()> {
    if !ctx.state.config.allow_dial {
        return write_frame(&mut stream, &StreamResponse::error("dial is disabled")).await;
    }

    let timeout = ctx.state.config.dial_timeout();
    let tcp = match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(e)) => {
            warn!("Client #{} dial {} failed: {}", ctx.id, target, e);
            return write_frame(&mut stream, &StreamResponse::error(e.to_string())).await;
        }
        Err(_) => {
            warn!("Client #{} dial {} timed out", ctx.id, target);
            return write_frame(&mut stream, &StreamResponse::error("connect timed out")).await;
        }
    };
    tune_tcp_stream(&tcp);

    write_frame(&mut stream, &StreamResponse::ok()).await?;

    let conn = ctx
        .registry
        .register(ctx.next_key(), format!("'{}' => {}", ctx.user, target));
    spawn_relay(conn, stream, tcp, ctx.state.pool.clone(), RELAY_CHUNK_SIZE);
    Ok(())
}

/// 在网关侧监听；控制通道关闭（客户端释放监听器）时停止
async fn handle_listen(
    mut control: MuxStream,
    bind: String,
    listener_id: u64,
    ctx: &Arc<ClientContext>,
) -> Result<()> {
    if !ctx.state.config.allow_listen {
        return write_frame(&mut control, &StreamResponse::error("listen is disabled")).await;
    }

    let listener = match TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("Client #{} listen on {} failed: {}", ctx.id, bind, e);
            return write_frame(&mut control, &StreamResponse::error(e.to_string())).await;
        }
    };
    write_frame(&mut control, &StreamResponse::ok()).await?;
    info!(
        "Client #{} listening on {} (listener {})",
        ctx.id,
        listener.local_addr()?,
        listener_id
    );

    let mut byte = [0u8; 1];
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    tune_tcp_stream(&tcp);
                    tokio::spawn(forward_inbound(tcp, peer, listener_id, ctx.clone()));
                }
                Err(e) => {
                    warn!("Client #{} accept on {} failed: {}", ctx.id, bind, e);
                    break;
                }
            },
            _ = control.read(&mut byte) => {
                debug!("Client #{} released listener on {}", ctx.id, bind);
                break;
            }
            _ = ctx.mux.closed() => break,
            _ = ctx.state.shutdown.cancelled() => break,
        }
    }

    info!("Client #{} stopped listening on {}", ctx.id, bind);
    Ok(())
}

/// 为监听到的连接打开一条到客户端的通道
async fn forward_inbound(tcp: TcpStream, peer: SocketAddr, listener_id: u64, ctx: Arc<ClientContext>) {
    let result = async {
        let mut stream = ctx.mux.open().await?;
        write_frame(
            &mut stream,
            &InboundHeader {
                listener_id,
                peer: peer.to_string(),
            },
        )
        .await?;
        Ok::<_, TunnelError>(stream)
    }
    .await;

    match result {
        Ok(stream) => {
            let conn = ctx
                .registry
                .register(ctx.next_key(), format!("{} => '{}'", peer, ctx.user));
            spawn_relay(conn, tcp, stream, ctx.state.pool.clone(), RELAY_CHUNK_SIZE);
        }
        Err(e) => {
            warn!(
                "Client #{} could not forward connection from {}: {}",
                ctx.id, peer, e
            );
        }
    }
}
