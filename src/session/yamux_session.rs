use super::{BoxedStream, Connector, RemoteListener, Session};
use crate::config::HostConfig;
use crate::error::{Result, TunnelError};
use crate::mux::{self, MuxHandle, MuxStream};
use crate::protocol::{
    read_frame, write_frame, AuthRequest, AuthResponse, InboundHeader, StreamRequest,
    StreamResponse, PROTOCOL_VERSION,
};
use crate::tls;
use crate::transport::{TlsTransportClient, TransportClient};
use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// 入站通道首帧的读取超时
const INBOUND_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// 每个远端监听器排队等待处理的入站通道数
const INBOUND_BACKLOG: usize = 64;

type InboundSender = mpsc::Sender<(MuxStream, String)>;
type ListenerMap = Arc<Mutex<HashMap<u64, InboundSender>>>;

/// 基于 TLS + yamux 的会话
pub struct YamuxSession {
    address: String,
    mux: MuxHandle,
    listeners: ListenerMap,
    next_listener_id: AtomicU64,
    active: Arc<AtomicUsize>,
}

impl YamuxSession {
    /// 在已认证的传输连接上建立客户端会话
    pub fn client(transport: crate::transport::BoxedTransport, address: String) -> Self {
        let listeners: ListenerMap = Arc::new(Mutex::new(HashMap::new()));

        let dispatch_to = listeners.clone();
        let mux = mux::spawn(transport, mux::Mode::Client, address.clone(), move |stream| {
            tokio::spawn(dispatch_inbound(stream, dispatch_to.clone()));
        });

        Self {
            address,
            mux,
            listeners,
            next_listener_id: AtomicU64::new(1),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 打开通道并发送请求，等待网关应答
    async fn request(&self, request: &StreamRequest) -> Result<MuxStream> {
        let mut stream = self.mux.open().await?;
        write_frame(&mut stream, request).await?;
        let response: StreamResponse = read_frame(&mut stream).await?;
        response.into_result()?;
        Ok(stream)
    }

    fn track(&self, stream: MuxStream) -> BoxedStream {
        Box::pin(ChannelStream::new(stream, self.active.clone()))
    }
}

#[async_trait]
impl Session for YamuxSession {
    async fn dial(&self, target: &str) -> Result<BoxedStream> {
        let stream = self
            .request(&StreamRequest::Dial {
                target: target.to_string(),
            })
            .await?;
        debug!("Opened channel to {} via {}", target, self.address);
        Ok(self.track(stream))
    }

    async fn listen(&self, bind: &str) -> Result<Box<dyn RemoteListener>> {
        // 先登记再发送请求，避免入站通道早于登记到达
        let listener_id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BACKLOG);
        self.listeners.lock().insert(listener_id, inbound_tx);
        let registration = ListenerRegistration {
            id: listener_id,
            listeners: self.listeners.clone(),
        };

        let control = self
            .request(&StreamRequest::Listen {
                bind: bind.to_string(),
                listener_id,
            })
            .await?;

        Ok(Box::new(YamuxRemoteListener {
            bind: bind.to_string(),
            control,
            inbound: inbound_rx,
            active: self.active.clone(),
            _registration: registration,
        }))
    }

    async fn ping(&self) -> Result<()> {
        self.request(&StreamRequest::Ping).await.map(|_| ())
    }

    async fn close(&self) {
        if !self.mux.is_closed() {
            self.mux.close().await;
            info!("Session to {} closed", self.address);
        }
    }

    fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    fn active_channels(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// 读取入站通道的首帧并按监听器编号分发
async fn dispatch_inbound(mut stream: MuxStream, listeners: ListenerMap) {
    let header: InboundHeader =
        match tokio::time::timeout(INBOUND_HEADER_TIMEOUT, read_frame(&mut stream)).await {
            Ok(Ok(header)) => header,
            Ok(Err(e)) => {
                warn!("Dropping inbound channel with bad header: {}", e);
                return;
            }
            Err(_) => {
                warn!("Dropping inbound channel: header not received in time");
                return;
            }
        };

    let sender = listeners.lock().get(&header.listener_id).cloned();
    match sender {
        Some(sender) => {
            if sender.send((stream, header.peer)).await.is_err() {
                debug!(
                    "Remote listener {} went away before accepting",
                    header.listener_id
                );
            }
        }
        None => {
            debug!(
                "Dropping inbound channel for unknown listener {}",
                header.listener_id
            );
        }
    }
}

/// 监听器登记，释放时注销
struct ListenerRegistration {
    id: u64,
    listeners: ListenerMap,
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.listeners.lock().remove(&self.id);
    }
}

/// 网关侧监听器在本地的代表
///
/// 控制通道保持打开；网关在该通道上的 EOF 表示监听已失效，
/// 释放本结构体会关闭控制通道，网关随之释放监听端口。
struct YamuxRemoteListener {
    bind: String,
    control: MuxStream,
    inbound: mpsc::Receiver<(MuxStream, String)>,
    active: Arc<AtomicUsize>,
    _registration: ListenerRegistration,
}

#[async_trait]
impl RemoteListener for YamuxRemoteListener {
    async fn accept(&mut self) -> Result<(BoxedStream, String)> {
        let mut byte = [0u8; 1];
        tokio::select! {
            next = self.inbound.recv() => match next {
                Some((stream, peer)) => {
                    let stream: BoxedStream =
                        Box::pin(ChannelStream::new(stream, self.active.clone()));
                    Ok((stream, peer))
                }
                None => Err(TunnelError::SessionClosed),
            },
            read = self.control.read(&mut byte) => {
                let reason = match read {
                    Ok(0) => "closed by gateway".to_string(),
                    Ok(_) => "unexpected data on control channel".to_string(),
                    Err(e) => e.to_string(),
                };
                Err(TunnelError::transport(format!(
                    "Remote listener on {} lost: {}",
                    self.bind, reason
                )))
            }
        }
    }
}

/// 逻辑通道包装，存活期间计入会话的活跃通道数
struct ChannelStream {
    inner: MuxStream,
    active: Arc<AtomicUsize>,
}

impl ChannelStream {
    fn new(inner: MuxStream, active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self { inner, active }
    }
}

impl Drop for ChannelStream {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// 通过传输客户端连接网关并完成认证
pub struct YamuxConnector {
    transport: Arc<dyn TransportClient>,
}

impl YamuxConnector {
    pub fn new(transport: Arc<dyn TransportClient>) -> Self {
        Self { transport }
    }

    /// 按主机配置创建 TLS 连接器
    pub fn tls(host: &HostConfig) -> anyhow::Result<Self> {
        let tls_config = tls::host_config(host)
            .with_context(|| format!("Failed to build TLS configuration for {}", host.address))?;
        let client = TlsTransportClient::new(
            host.address.clone(),
            host.tls_server_name(),
            TlsConnector::from(tls_config),
        );
        Ok(Self::new(Arc::new(client)))
    }
}

#[async_trait]
impl Connector for YamuxConnector {
    async fn connect(&self, user: &str, credential: &str) -> Result<Arc<dyn Session>> {
        let address = self.transport.address().to_string();
        let mut transport = self
            .transport
            .connect()
            .await
            .map_err(|e| TunnelError::transport(format!("{:#}", e)))?;

        write_frame(
            &mut transport,
            &AuthRequest {
                version: PROTOCOL_VERSION,
                user: user.to_string(),
                password: credential.to_string(),
            },
        )
        .await?;

        let response: AuthResponse = read_frame(&mut transport).await?;
        if !response.accepted {
            return Err(TunnelError::auth_failed(
                response
                    .message
                    .unwrap_or_else(|| "credentials rejected".to_string()),
            ));
        }

        debug!("Authenticated to {} as {}", address, user);
        Ok(Arc::new(YamuxSession::client(transport, address)))
    }
}
