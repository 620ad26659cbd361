mod tls;

pub use tls::{TlsTransportClient, TlsTransportServer};

use anyhow::Result;
use async_trait::async_trait;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::warn;

/// 传输层连接抽象
///
/// 会话建立在其上（认证帧 + yamux 多路复用）
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 已装箱的传输层连接
pub type BoxedTransport = Pin<Box<dyn Transport>>;

/// 传输层客户端接口
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// 连接到网关并返回传输层连接
    async fn connect(&self) -> Result<BoxedTransport>;

    /// 网关地址（用于日志）
    fn address(&self) -> &str;
}

/// TCP keepalive 探测起始时间
pub const TCP_KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// 为底层 TCP 连接开启 keepalive 并关闭 Nagle
pub fn tune_tcp_stream(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let keepalive = socket2::TcpKeepalive::new().with_time(TCP_KEEPALIVE_TIME);
    let sock_ref = socket2::SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(
            "Failed to set TCP keepalive on {}: {}",
            stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into()),
            e
        );
    }
}
