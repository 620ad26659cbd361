//! 测试用的会话实现：dial 直接建立本地 TCP 连接，listen 直接在本地监听

use super::{BoxedStream, Connector, CredentialProvider, RemoteListener, Session};
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

pub struct MockConnector {
    password: String,
    connects: AtomicUsize,
    transient_failures: AtomicUsize,
    fail_dial: Arc<AtomicBool>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    listen_addrs: Arc<Mutex<Vec<SocketAddr>>>,
}

impl MockConnector {
    pub fn new(password: &str) -> Arc<Self> {
        Arc::new(Self {
            password: password.to_string(),
            connects: AtomicUsize::new(0),
            transient_failures: AtomicUsize::new(0),
            fail_dial: Arc::new(AtomicBool::new(false)),
            sessions: Mutex::new(Vec::new()),
            listen_addrs: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// 所有会话（包括之后创建的）的 dial 都失败
    pub fn set_fail_dial(&self, fail: bool) {
        self.fail_dial.store(fail, Ordering::SeqCst);
    }

    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().last().cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().clone()
    }

    /// 远端监听实际绑定的地址
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listen_addrs.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _user: &str, credential: &str) -> Result<Arc<dyn Session>> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures
                .store(remaining.saturating_sub(1), Ordering::SeqCst);
            return Err(TunnelError::transport("connection refused"));
        }

        if credential != self.password {
            return Err(TunnelError::auth_failed("invalid user or password"));
        }

        let session = Arc::new(MockSession {
            closed: CancellationToken::new(),
            closes: AtomicUsize::new(0),
            fail_ping: AtomicBool::new(false),
            fail_dial: self.fail_dial.clone(),
            active: Arc::new(AtomicUsize::new(0)),
            listen_addrs: self.listen_addrs.clone(),
        });
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}

pub struct MockSession {
    closed: CancellationToken,
    closes: AtomicUsize,
    fail_ping: AtomicBool,
    fail_dial: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    listen_addrs: Arc<Mutex<Vec<SocketAddr>>>,
}

impl MockSession {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn set_fail_ping(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }

    /// 模拟仍在会话上中继的通道数
    pub fn set_active_channels(&self, n: usize) {
        self.active.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Session for MockSession {
    async fn dial(&self, target: &str) -> Result<BoxedStream> {
        if self.closed.is_cancelled() {
            return Err(TunnelError::SessionClosed);
        }
        if self.fail_dial.load(Ordering::SeqCst) {
            return Err(TunnelError::Rejected(format!("dial {} refused", target)));
        }
        let stream = TcpStream::connect(target)
            .await
            .map_err(|e| TunnelError::connection_failed(target, e))?;
        Ok(Box::pin(stream))
    }

    async fn listen(&self, bind: &str) -> Result<Box<dyn RemoteListener>> {
        if self.closed.is_cancelled() {
            return Err(TunnelError::SessionClosed);
        }
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| TunnelError::connection_failed(bind, e))?;
        self.listen_addrs.lock().push(listener.local_addr()?);
        Ok(Box::new(MockListener {
            listener,
            closed: self.closed.clone(),
        }))
    }

    async fn ping(&self) -> Result<()> {
        if self.closed.is_cancelled() || self.fail_ping.load(Ordering::SeqCst) {
            return Err(TunnelError::SessionClosed);
        }
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn active_channels(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

struct MockListener {
    listener: TcpListener,
    closed: CancellationToken,
}

#[async_trait]
impl RemoteListener for MockListener {
    async fn accept(&mut self) -> Result<(BoxedStream, String)> {
        tokio::select! {
            accepted = self.listener.accept() => {
                let (stream, peer) = accepted?;
                Ok((Box::pin(stream), peer.to_string()))
            }
            _ = self.closed.cancelled() => Err(TunnelError::SessionClosed),
        }
    }
}

/// 计数的凭据提供者
pub struct CountingPrompt {
    secret: String,
    calls: AtomicUsize,
    cancel: bool,
}

impl CountingPrompt {
    pub fn new(secret: &str) -> Arc<Self> {
        Arc::new(Self {
            secret: secret.to_string(),
            calls: AtomicUsize::new(0),
            cancel: false,
        })
    }

    /// 每次提示都像用户按下 Ctrl+C 一样失败
    pub fn cancelling() -> Arc<Self> {
        Arc::new(Self {
            secret: String::new(),
            calls: AtomicUsize::new(0),
            cancel: true,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CredentialProvider for CountingPrompt {
    fn prompt(&self, _user: &str, _address: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.cancel {
            return Err(super::PromptCancelled.into());
        }
        Ok(self.secret.clone())
    }
}
