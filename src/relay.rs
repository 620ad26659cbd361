/// 双向中继
///
/// 每条连接一个任务，在同一个任务中同时推进两个拷贝方向，每个方向使用缓冲池中的固定大小缓冲区；
/// 任一方向结束（EOF 或 I/O 错误）都会关闭连接，两端套接字都被释放。
///
/// yamux 逻辑通道的读写共用同一个发送端，只能登记一个唤醒者，两个方向不能拆到两个任务中。
use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::registry::RelayedConnection;
use futures::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, error, info};

/// 默认中继块大小（32 KiB）
pub const RELAY_CHUNK_SIZE: usize = 32 * 1024;

/// 关闭写端（发送 FIN）的最长等待时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// 拷贝方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// 本地 -> 远端
    Upstream,
    /// 远端 -> 本地
    Downstream,
}

impl Flow {
    fn as_str(self) -> &'static str {
        match self {
            Flow::Upstream => "upstream",
            Flow::Downstream => "downstream",
        }
    }
}

/// 单方向的拷贝状态：缓冲区中 `pos..filled` 是已读未写的数据
struct Pump {
    buf: PooledBuffer,
    pos: usize,
    filled: usize,
    unflushed: bool,
    total: u64,
}

impl Pump {
    fn new(buf: PooledBuffer) -> Self {
        Self {
            buf,
            pos: 0,
            filled: 0,
            unflushed: false,
            total: 0,
        }
    }

    /// 推进拷贝，读端 EOF 时返回累计字节数
    fn poll_copy<Rd, Wr>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut Rd>,
        mut writer: Pin<&mut Wr>,
    ) -> Poll<io::Result<u64>>
    where
        Rd: AsyncRead + ?Sized,
        Wr: AsyncWrite + ?Sized,
    {
        loop {
            while self.pos < self.filled {
                let n = ready!(writer
                    .as_mut()
                    .poll_write(cx, &self.buf[self.pos..self.filled]))?;
                if n == 0 {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                self.pos += n;
                self.total += n as u64;
                self.unflushed = true;
            }

            let mut read_buf = ReadBuf::new(&mut self.buf);
            match reader.as_mut().poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let n = read_buf.filled().len();
                    if n == 0 {
                        return Poll::Ready(Ok(self.total));
                    }
                    self.pos = 0;
                    self.filled = n;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {
                    // 读端暂无数据时把已写出的数据冲刷出去
                    if self.unflushed {
                        ready!(writer.as_mut().poll_flush(cx))?;
                        self.unflushed = false;
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

/// 启动一条连接的双向中继，立即返回
///
/// 调用前连接必须已在注册表中登记。
pub fn spawn_relay<L, R>(
    conn: RelayedConnection,
    local: L,
    remote: R,
    pool: Arc<BufferPool>,
    chunk_size: usize,
) where
    L: AsyncRead + AsyncWrite + Send + 'static,
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let (Some(up), Some(down)) = (pool.lease(chunk_size), pool.lease(chunk_size)) else {
        error!(
            "Relay {}: invalid chunk size {}",
            conn.key(),
            chunk_size
        );
        conn.close();
        return;
    };

    info!("Relay {} started: {}", conn.key(), conn.label());
    tokio::spawn(relay(conn, local, remote, Pump::new(up), Pump::new(down)));
}

async fn relay<L, R>(conn: RelayedConnection, local: L, remote: R, mut up: Pump, mut down: Pump)
where
    L: AsyncRead + AsyncWrite,
    R: AsyncRead + AsyncWrite,
{
    tokio::pin!(local);
    tokio::pin!(remote);

    let outcome = {
        let copy = poll_fn(|cx| {
            if let Poll::Ready(result) = up.poll_copy(cx, local.as_mut(), remote.as_mut()) {
                return Poll::Ready((Flow::Upstream, result));
            }
            if let Poll::Ready(result) = down.poll_copy(cx, remote.as_mut(), local.as_mut()) {
                return Poll::Ready((Flow::Downstream, result));
            }
            Poll::Pending
        });

        tokio::select! {
            finished = copy => Some(finished),
            _ = conn.closed() => None,
        }
    };

    match outcome {
        Some((flow, Ok(bytes))) => {
            debug!(
                "Relay {} {} reached EOF after {} bytes",
                conn.key(),
                flow.as_str(),
                bytes
            );
            // 向对端转达 EOF
            let _ = match flow {
                Flow::Upstream => tokio::time::timeout(SHUTDOWN_GRACE, remote.shutdown()).await,
                Flow::Downstream => tokio::time::timeout(SHUTDOWN_GRACE, local.shutdown()).await,
            };
        }
        Some((flow, Err(e))) => {
            debug!("Relay {} {} I/O error: {}", conn.key(), flow.as_str(), e);
        }
        None => {
            debug!("Relay {} stopped by close", conn.key());
        }
    }

    if conn.close() {
        info!(
            "Relay {} closed: {} (up {} bytes, down {} bytes)",
            conn.key(),
            conn.label(),
            up.total,
            down.total
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionKey, ConnectionRegistry};
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::time::timeout;

    const KEY: ConnectionKey = ConnectionKey { tunnel: 0, id: 1 };

    fn setup() -> (ConnectionRegistry, RelayedConnection, Arc<BufferPool>) {
        let registry = ConnectionRegistry::new();
        let conn = registry.register(KEY, "local <=> remote");
        (registry, conn, Arc::new(BufferPool::new()))
    }

    #[tokio::test]
    async fn test_relay_copies_both_directions_in_order() {
        let (_registry, conn, pool) = setup();
        let (mut client, local_end) = duplex(64 * 1024);
        let (remote_end, mut server) = duplex(64 * 1024);

        spawn_relay(conn, local_end, remote_end, pool, RELAY_CHUNK_SIZE);

        let request: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let writer = {
            let request = request.clone();
            tokio::spawn(async move {
                client.write_all(&request).await.unwrap();
                client
            })
        };

        let mut received = vec![0u8; request.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, request);

        let mut client = writer.await.unwrap();
        server.write_all(b"response").await.unwrap();
        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"response");
    }

    #[tokio::test]
    async fn test_relay_full_duplex_under_backpressure() {
        let (_registry, conn, pool) = setup();
        let (client, local_end) = duplex(4 * 1024);
        let (remote_end, server) = duplex(4 * 1024);

        spawn_relay(conn, local_end, remote_end, pool, 8 * 1024);

        // 远端回显：上下行同时有数据在途
        tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(server);
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        let payload: Vec<u8> = (0..1_048_576u32).map(|i| (i % 241) as u8).collect();
        let (mut reader, mut writer) = tokio::io::split(client);
        let upload = {
            let payload = payload.clone();
            tokio::spawn(async move {
                writer.write_all(&payload).await.unwrap();
                writer
            })
        };

        let mut echoed = vec![0u8; payload.len()];
        timeout(Duration::from_secs(10), reader.read_exact(&mut echoed))
            .await
            .expect("echo stalled")
            .unwrap();
        assert_eq!(echoed, payload);
        upload.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_close_tears_down_local() {
        let (registry, conn, pool) = setup();
        let (mut client, local_end) = duplex(1024);
        let (remote_end, server) = duplex(1024);

        spawn_relay(conn.clone(), local_end, remote_end, pool.clone(), 1024);
        drop(server);

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .expect("local end should observe close")
            .unwrap_or(0);
        assert_eq!(n, 0);

        timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
        assert!(registry.is_empty());

        // 两个方向的缓冲区都已归还
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.idle(1024), 2);
    }

    #[tokio::test]
    async fn test_external_close_stops_relay() {
        let (registry, conn, pool) = setup();
        let (mut client, local_end) = duplex(1024);
        let (remote_end, mut server) = duplex(1024);

        spawn_relay(conn, local_end, remote_end, pool, 1024);
        assert_eq!(registry.drain(), 1);

        let mut buf = [0u8; 16];
        let local = timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .expect("local end closed");
        assert!(matches!(local, Ok(0) | Err(_)));
        let remote = timeout(Duration::from_secs(1), server.read(&mut buf))
            .await
            .expect("remote end closed");
        assert!(matches!(remote, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_invalid_chunk_size_closes_connection() {
        let (registry, conn, pool) = setup();
        let (_client, local_end) = duplex(16);
        let (remote_end, _server) = duplex(16);

        spawn_relay(conn.clone(), local_end, remote_end, pool, 0);
        timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
        assert!(registry.is_empty());
    }
}
