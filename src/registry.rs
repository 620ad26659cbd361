/// 活跃连接注册表
///
/// 每条中继连接在开始转发前登记，任一端关闭时注销；引擎关闭时整体清空并关闭
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::debug;

/// 连接标识：隧道序号 + 隧道内单调递增的连接编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub tunnel: usize,
    pub id: u64,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tunnel, self.id)
    }
}

/// 隧道内的连接编号分配器，从 1 开始，溢出后回到 1
#[derive(Debug)]
pub struct ConnectionIds {
    next: AtomicU64,
}

impl ConnectionIds {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
        }
    }

    /// 分配下一个编号
    pub fn next_id(&self) -> u64 {
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.checked_add(1).unwrap_or(1))
            })
            .unwrap_or(1)
    }
}

impl Default for ConnectionIds {
    fn default() -> Self {
        Self::new()
    }
}

type Entries = Mutex<HashMap<ConnectionKey, RelayedConnection>>;

/// 连接注册表（可克隆，共享同一张表）
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    entries: Arc<Entries>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一条连接，返回其关闭句柄
    pub fn register(&self, key: ConnectionKey, label: impl Into<String>) -> RelayedConnection {
        let (closed_tx, _) = watch::channel(false);
        let conn = RelayedConnection {
            inner: Arc::new(ConnectionInner {
                key,
                label: label.into(),
                closed_tx,
                entries: Arc::downgrade(&self.entries),
            }),
        };
        self.entries.lock().insert(key, conn.clone());
        conn
    }

    /// 关闭并移除所有连接，返回关闭的数量
    pub fn drain(&self) -> usize {
        let drained: Vec<RelayedConnection> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, conn)| conn).collect()
        };
        for conn in &drained {
            conn.close();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, key: &ConnectionKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// 当前登记的连接标识（已排序）
    pub fn keys(&self) -> Vec<ConnectionKey> {
        let mut keys: Vec<_> = self.entries.lock().keys().copied().collect();
        keys.sort();
        keys
    }
}

struct ConnectionInner {
    key: ConnectionKey,
    label: String,
    closed_tx: watch::Sender<bool>,
    entries: Weak<Entries>,
}

/// 一条已登记的中继连接
///
/// 关闭是幂等的：第一次 `close()` 通知两个拷贝方向退出并从注册表注销，之后的调用无效果。
#[derive(Clone)]
pub struct RelayedConnection {
    inner: Arc<ConnectionInner>,
}

impl RelayedConnection {
    pub fn key(&self) -> ConnectionKey {
        self.inner.key
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// 关闭连接，返回本次调用是否真正执行了关闭
    pub fn close(&self) -> bool {
        let first = self.inner.closed_tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });

        if first {
            if let Some(entries) = self.inner.entries.upgrade() {
                entries.lock().remove(&self.inner.key);
            }
            debug!("Connection {} ({}) closed", self.inner.key, self.inner.label);
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }

    /// 等待连接被关闭
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        // Sender 由自身持有，wait_for 不会因发送端消失而出错
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for RelayedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayedConnection")
            .field("key", &self.inner.key)
            .field("label", &self.inner.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}
