/// yamux 连接驱动
///
/// yamux 连接必须被持续 poll 才能推进 I/O，因此每条连接由一个独立任务驱动：
/// 入站通道交给回调处理，出站通道通过命令通道向驱动任务申请
use crate::error::{Result, TunnelError};
use crate::transport::BoxedTransport;
use futures::future::poll_fn;
use std::collections::VecDeque;
use std::task::Poll;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use yamux::{Config as YamuxConfig, Connection as YamuxConnection, Mode as YamuxMode};

pub use yamux::Mode;

/// tokio 兼容的 yamux 逻辑通道
pub type MuxStream = Compat<yamux::Stream>;

/// 等待驱动任务完成关闭的最长时间
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type OpenResponse = oneshot::Sender<std::result::Result<yamux::Stream, yamux::ConnectionError>>;

enum Command {
    Open(OpenResponse),
    Close,
}

enum Event {
    Inbound(Option<std::result::Result<yamux::Stream, yamux::ConnectionError>>),
    Command(Option<Command>),
}

/// yamux 连接句柄（可克隆）
#[derive(Clone)]
pub struct MuxHandle {
    commands: mpsc::Sender<Command>,
    closed: CancellationToken,
}

impl MuxHandle {
    /// 打开一条出站通道
    pub async fn open(&self) -> Result<MuxStream> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Open(tx))
            .await
            .map_err(|_| TunnelError::SessionClosed)?;
        let stream = rx
            .await
            .map_err(|_| TunnelError::SessionClosed)?
            .map_err(|e| TunnelError::transport(format!("Failed to open yamux stream: {}", e)))?;
        Ok(stream.compat())
    }

    /// 关闭连接并等待驱动任务退出
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        // 命令队列可能被 Open 占满，排队发送而不是丢弃
        let closing = async {
            let _ = self.commands.send(Command::Close).await;
            self.closed.cancelled().await;
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, closing).await.is_err() {
            warn!("Timed out waiting for yamux connection to close");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// 等待连接结束
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// 在传输连接上启动 yamux，返回句柄
///
/// `on_inbound` 在驱动任务中同步调用，耗时处理应自行 spawn。
pub fn spawn<F>(transport: BoxedTransport, mode: YamuxMode, label: String, on_inbound: F) -> MuxHandle
where
    F: FnMut(MuxStream) + Send + 'static,
{
    let conn = YamuxConnection::new(transport.compat(), YamuxConfig::default(), mode);
    let (commands_tx, commands_rx) = mpsc::channel(64);
    let closed = CancellationToken::new();

    tokio::spawn(drive(conn, commands_rx, closed.clone(), label, on_inbound));

    MuxHandle {
        commands: commands_tx,
        closed,
    }
}

async fn drive<T, F>(
    mut conn: YamuxConnection<T>,
    mut commands: mpsc::Receiver<Command>,
    closed: CancellationToken,
    label: String,
    mut on_inbound: F,
) where
    T: futures::io::AsyncRead + futures::io::AsyncWrite + Unpin,
    F: FnMut(MuxStream),
{
    // 出站请求在同一次 poll 中推进，等待 ACK 时入站方向不能停
    let mut opening: VecDeque<OpenResponse> = VecDeque::new();

    loop {
        let event = poll_fn(|cx| {
            while !opening.is_empty() {
                match conn.poll_new_outbound(cx) {
                    Poll::Ready(result) => {
                        if let Some(response_tx) = opening.pop_front() {
                            let _ = response_tx.send(result);
                        }
                    }
                    Poll::Pending => break,
                }
            }
            if let Poll::Ready(command) = commands.poll_recv(cx) {
                return Poll::Ready(Event::Command(command));
            }
            if let Poll::Ready(inbound) = conn.poll_next_inbound(cx) {
                return Poll::Ready(Event::Inbound(inbound));
            }
            Poll::Pending
        })
        .await;

        match event {
            Event::Inbound(Some(Ok(stream))) => {
                debug!("Received inbound stream on {}", label);
                on_inbound(stream.compat());
            }
            Event::Inbound(Some(Err(e))) => {
                warn!("Yamux connection {} failed: {}", label, e);
                break;
            }
            Event::Inbound(None) => {
                info!("Yamux connection {} closed by peer", label);
                break;
            }
            Event::Command(Some(Command::Open(response_tx))) => opening.push_back(response_tx),
            // 所有句柄都已释放也视为关闭
            Event::Command(Some(Command::Close)) | Event::Command(None) => {
                if let Err(e) = poll_fn(|cx| conn.poll_close(cx)).await {
                    debug!("Error while closing yamux connection {}: {}", label, e);
                }
                debug!("Yamux connection {} closed locally", label);
                break;
            }
        }
    }

    // 未完成的 open 随 opening 一起丢弃，调用方得到 SessionClosed
    closed.cancel();
}
