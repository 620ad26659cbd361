use super::{
    same_session, Connector, CredentialProvider, PromptCancelled, Session, SessionState,
};
use crate::config::{DialFailurePolicy, HostConfig};
use crate::error::{Result, TunnelError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 检查旧会话是否已无活跃通道的间隔
const RETIRED_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// 会话管理器配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 网关地址
    pub address: String,
    pub user: String,
    /// 当前凭据，认证失败时被清除并重新获取
    pub credential: Option<String>,
    /// 连接与认证的超时
    pub connect_timeout: Duration,
    /// 瞬时故障后的重试间隔
    pub retry_delay: Duration,
    /// 心跳间隔，`None` 表示不发心跳
    pub keepalive: Option<Duration>,
    pub dial_failure: DialFailurePolicy,
}

impl SessionConfig {
    pub fn from_host(host: &HostConfig) -> Self {
        Self {
            address: host.address.clone(),
            user: host.user.clone(),
            credential: host.password.clone().filter(|p| !p.is_empty()),
            connect_timeout: host.connect_timeout(),
            retry_delay: host.retry_delay(),
            keepalive: host.keepalive(),
            dial_failure: host.dial_failure,
        }
    }
}

/// 一个远端主机的会话管理器
///
/// 会话只通过 [`get_session`](Self::get_session) 获取；重连由内部的异步锁串行化，
/// 同一时刻最多只有一个重连过程。失效通过 [`invalidate`](Self::invalidate) 按指针比较，
/// 迟到的失效请求不会影响已经替换上来的新会话。
pub struct SessionManager {
    address: String,
    user: String,
    connect_timeout: Duration,
    retry_delay: Duration,
    keepalive: Option<Duration>,
    dial_failure: DialFailurePolicy,
    credential: Mutex<Option<String>>,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    current: tokio::sync::Mutex<Option<Arc<dyn Session>>>,
    /// 当前会话的失效信号，与 `current` 在同一把锁下更新
    live: Mutex<Option<(Arc<dyn Session>, CancellationToken)>>,
    /// 已失效但仍承载中继的旧会话
    retired: Arc<Mutex<Vec<Arc<dyn Session>>>>,
    /// 每次安装或失效会话时递增，心跳任务据此判断自己是否过期
    generation: AtomicU64,
    state_tx: watch::Sender<SessionState>,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Arc::new(Self {
            address: config.address,
            user: config.user,
            connect_timeout: config.connect_timeout,
            retry_delay: config.retry_delay,
            keepalive: config.keepalive,
            dial_failure: config.dial_failure,
            credential: Mutex::new(config.credential),
            connector,
            credentials,
            current: tokio::sync::Mutex::new(None),
            live: Mutex::new(None),
            retired: Arc::new(Mutex::new(Vec::new())),
            generation: AtomicU64::new(0),
            state_tx,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn has_credential(&self) -> bool {
        self.credential.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_if_modified(|current| {
            // Closed 是终态
            if *current == state || *current == SessionState::Closed {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// 没有凭据时向提供者获取一次
    pub async fn ensure_credential(&self) -> Result<()> {
        if self.has_credential() {
            return Ok(());
        }
        let secret = self.prompt_credential().await?;
        *self.credential.lock() = Some(secret);
        Ok(())
    }

    async fn prompt_credential(&self) -> Result<String> {
        let provider = self.credentials.clone();
        let user = self.user.clone();
        let address = self.address.clone();

        let prompt = tokio::task::spawn_blocking(move || provider.prompt(&user, &address));
        tokio::select! {
            joined = prompt => match joined {
                Ok(Ok(secret)) => Ok(secret),
                Ok(Err(e)) if e.is::<PromptCancelled>() => {
                    info!("Credential input for {}@{} cancelled, closing", self.user, self.address);
                    self.shutdown.cancel();
                    Err(TunnelError::Shutdown)
                }
                Ok(Err(e)) => Err(TunnelError::Other(e)),
                Err(e) => Err(TunnelError::Other(anyhow::anyhow!("Credential prompt panicked: {}", e))),
            },
            _ = self.shutdown.cancelled() => Err(TunnelError::Shutdown),
        }
    }

    /// 等待重试间隔，关闭时返回 `false`
    pub async fn backoff(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.retry_delay) => true,
            _ = self.shutdown.cancelled() => false,
        }
    }

    /// 获取当前会话，必要时（重新）连接
    ///
    /// 只有管理器关闭时才返回错误；认证失败与网络故障都在内部无限重试。
    pub async fn get_session(self: &Arc<Self>) -> Result<Arc<dyn Session>> {
        let mut current = tokio::select! {
            guard = self.current.lock() => guard,
            _ = self.shutdown.cancelled() => return Err(TunnelError::Shutdown),
        };

        loop {
            if self.shutdown.is_cancelled() {
                return Err(TunnelError::Shutdown);
            }

            if let Some(session) = current.as_ref() {
                if !session.is_closed() {
                    return Ok(session.clone());
                }
                warn!("Session to {} lost", self.address);
                if let Some(dead) = current.take() {
                    self.generation.fetch_add(1, Ordering::Relaxed);
                    self.retire(dead);
                }
                self.set_state(SessionState::Disconnected);
            }

            let stored = self.credential.lock().clone();
            let credential = match stored {
                Some(credential) => credential,
                None => match self.prompt_credential().await {
                    Ok(secret) => {
                        *self.credential.lock() = Some(secret.clone());
                        secret
                    }
                    Err(TunnelError::Shutdown) => return Err(TunnelError::Shutdown),
                    Err(e) => {
                        error!(
                            "Failed to obtain credential for {}@{}: {}",
                            self.user, self.address, e
                        );
                        self.set_state(SessionState::FailedTransient);
                        if !self.backoff().await {
                            return Err(TunnelError::Shutdown);
                        }
                        continue;
                    }
                },
            };

            self.set_state(SessionState::Connecting);
            info!("Connecting to {} as {}", self.address, self.user);

            let attempt = tokio::select! {
                result = tokio::time::timeout(
                    self.connect_timeout,
                    self.connector.connect(&self.user, &credential),
                ) => result.unwrap_or_else(|_| Err(TunnelError::timeout(self.connect_timeout))),
                _ = self.shutdown.cancelled() => return Err(TunnelError::Shutdown),
            };

            match attempt {
                Ok(session) => {
                    info!("Session to {} established", self.address);
                    self.generation.fetch_add(1, Ordering::Relaxed);
                    *current = Some(session.clone());
                    *self.live.lock() = Some((session.clone(), CancellationToken::new()));
                    self.set_state(SessionState::Authenticated);
                    self.spawn_heartbeat(session.clone());
                    return Ok(session);
                }
                Err(e) if e.is_auth_failed() => {
                    warn!("Authentication to {} as {} failed: {}", self.address, self.user, e);
                    self.set_state(SessionState::FailedAuth);
                    // 清除旧凭据，下一轮循环重新获取
                    *self.credential.lock() = None;
                }
                Err(e) => {
                    warn!(
                        "Failed to connect to {}: {}, retrying in {:?}",
                        self.address, e, self.retry_delay
                    );
                    self.set_state(SessionState::FailedTransient);
                    if !self.backoff().await {
                        return Err(TunnelError::Shutdown);
                    }
                }
            }
        }
    }

    /// 使会话失效，下次 `get_session` 将重新连接
    ///
    /// 仅当 `stale` 仍是当前会话时生效；不关闭会话，已有的中继继续使用它。
    pub async fn invalidate(&self, stale: &Arc<dyn Session>) -> bool {
        let mut current = tokio::select! {
            guard = self.current.lock() => guard,
            _ = self.shutdown.cancelled() => return false,
        };

        let matches = current
            .as_ref()
            .is_some_and(|session| same_session(session, stale));
        if !matches {
            return false;
        }

        if let Some(session) = current.take() {
            self.generation.fetch_add(1, Ordering::Relaxed);
            self.retire(session);
        }
        self.set_state(SessionState::Disconnected);
        info!("Session to {} invalidated", self.address);
        true
    }

    /// 报告一次 dial / listen 失败，按策略决定是否使会话失效
    pub async fn report_failure(&self, session: &Arc<dyn Session>, err: &TunnelError) {
        if session.is_closed() {
            self.invalidate(session).await;
            return;
        }

        match self.dial_failure {
            DialFailurePolicy::Invalidate => {
                self.invalidate(session).await;
            }
            DialFailurePolicy::Ping => {
                match tokio::time::timeout(self.connect_timeout, session.ping()).await {
                    Ok(Ok(())) => {
                        debug!(
                            "Session to {} is alive despite failure ({}), keeping it",
                            self.address, err
                        );
                    }
                    Ok(Err(e)) => {
                        warn!("Ping of session to {} failed: {}", self.address, e);
                        self.invalidate(session).await;
                    }
                    Err(_) => {
                        warn!("Ping of session to {} timed out", self.address);
                        self.invalidate(session).await;
                    }
                }
            }
        }
    }

    /// 会话不再是当前会话（失效、被替换或管理器关闭）时触发的信号
    ///
    /// `session` 已不是当前会话时返回已触发的信号。
    pub fn retired_signal(&self, session: &Arc<dyn Session>) -> CancellationToken {
        match &*self.live.lock() {
            Some((live, signal)) if same_session(live, session) => signal.clone(),
            _ => {
                let signal = CancellationToken::new();
                signal.cancel();
                signal
            }
        }
    }

    /// 移出当前会话：通知其使用者，空闲后关闭
    fn retire(&self, session: Arc<dyn Session>) {
        let signal = {
            let mut live = self.live.lock();
            match live.take() {
                Some((current, signal)) if same_session(&current, &session) => Some(signal),
                other => {
                    *live = other;
                    None
                }
            }
        };
        if let Some(signal) = signal {
            signal.cancel();
        }

        if session.is_closed() {
            return;
        }
        self.retired.lock().push(session.clone());

        let retired = self.retired.clone();
        let shutdown = self.shutdown.clone();
        let address = self.address.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETIRED_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    // 关闭时由 close() 统一处理
                    _ = shutdown.cancelled() => return,
                }
                if session.is_closed() {
                    break;
                }
                if session.active_channels() == 0 {
                    debug!("Closing idle retired session to {}", address);
                    session.close().await;
                    break;
                }
            }
            retired.lock().retain(|s| !same_session(s, &session));
        });
    }

    fn spawn_heartbeat(self: &Arc<Self>, session: Arc<dyn Session>) {
        let Some(interval) = self.keepalive else {
            return;
        };
        let generation = self.generation.load(Ordering::Relaxed);
        let manager: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.cancelled() => break,
                }

                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if manager.generation.load(Ordering::Relaxed) != generation {
                    break;
                }

                let outcome = tokio::time::timeout(manager.connect_timeout, session.ping()).await;
                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some("no response".to_string()),
                };

                if let Some(reason) = failure {
                    warn!("Heartbeat to {} failed: {}", manager.address, reason);
                    manager.invalidate(&session).await;
                    break;
                }
                debug!("Heartbeat to {} ok", manager.address);
            }
        });
    }

    /// 关闭管理器：之后的 `get_session` 立即失败，当前与旧会话全部关闭
    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Some((_, signal)) = self.live.lock().take() {
            signal.cancel();
        }

        // get_session 对锁的等待和连接过程都会因 shutdown 退出
        let current = self.current.lock().await.take();
        if let Some(session) = current {
            session.close().await;
        }

        let retired: Vec<_> = std::mem::take(&mut *self.retired.lock());
        for session in retired {
            session.close().await;
        }

        self.state_tx.send_replace(SessionState::Closed);
        info!("Session manager for {} closed", self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::{CountingPrompt, MockConnector};

    fn config(credential: Option<&str>) -> SessionConfig {
        SessionConfig {
            address: "gateway:7443".to_string(),
            user: "alice".to_string(),
            credential: credential.map(str::to_string),
            connect_timeout: Duration::from_secs(1),
            retry_delay: Duration::from_millis(20),
            keepalive: None,
            dial_failure: DialFailurePolicy::Invalidate,
        }
    }

    #[tokio::test]
    async fn test_get_session_reuses_live_session() {
        let connector = MockConnector::new("secret");
        let prompt = CountingPrompt::new("secret");
        let manager = SessionManager::new(config(Some("secret")), connector.clone(), prompt.clone());

        let a = manager.get_session().await.unwrap();
        let b = manager.get_session().await.unwrap();
        assert!(same_session(&a, &b));
        assert_eq!(connector.connects(), 1);
        assert_eq!(prompt.calls(), 0);
        assert_eq!(manager.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_auth_failure_prompts_once_then_succeeds() {
        let connector = MockConnector::new("secret");
        let prompt = CountingPrompt::new("secret");
        let manager = SessionManager::new(config(Some("wrong")), connector.clone(), prompt.clone());
        let mut states = manager.subscribe();

        manager.get_session().await.unwrap();
        assert_eq!(prompt.calls(), 1);
        assert_eq!(connector.connects(), 2);
        assert_eq!(*states.borrow_and_update(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn test_cancelled_prompt_closes_manager() {
        let connector = MockConnector::new("secret");
        let prompt = CountingPrompt::cancelling();
        let manager = SessionManager::new(config(Some("wrong")), connector.clone(), prompt.clone());

        let result = tokio::time::timeout(Duration::from_secs(2), manager.get_session())
            .await
            .unwrap();
        assert!(matches!(result, Err(TunnelError::Shutdown)));
        assert_eq!(prompt.calls(), 1);
        assert_eq!(connector.connects(), 1);
        assert!(manager.is_closed());

        // 不再提示，也不再连接
        assert!(manager.get_session().await.is_err());
        assert_eq!(prompt.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_until_success() {
        let connector = MockConnector::new("secret");
        connector.fail_next_connects(3);
        let manager = SessionManager::new(
            config(Some("secret")),
            connector.clone(),
            CountingPrompt::new("secret"),
        );

        manager.get_session().await.unwrap();
        assert_eq!(connector.connects(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_reconnect() {
        let connector = MockConnector::new("secret");
        connector.fail_next_connects(2);
        let manager = SessionManager::new(
            config(Some("secret")),
            connector.clone(),
            CountingPrompt::new("secret"),
        );

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_session().await.unwrap() })
            })
            .collect();

        let mut sessions = Vec::new();
        for task in tasks {
            sessions.push(task.await.unwrap());
        }
        assert!(sessions.iter().all(|s| same_session(s, &sessions[0])));
        assert_eq!(connector.connects(), 3);
    }

    #[tokio::test]
    async fn test_invalidate_is_compare_and_swap() {
        let connector = MockConnector::new("secret");
        let manager = SessionManager::new(
            config(Some("secret")),
            connector.clone(),
            CountingPrompt::new("secret"),
        );

        let first = manager.get_session().await.unwrap();
        assert!(manager.invalidate(&first).await);
        assert_eq!(manager.state(), SessionState::Disconnected);

        let second = manager.get_session().await.unwrap();
        assert!(!same_session(&first, &second));

        // 迟到的失效请求不影响新会话
        assert!(!manager.invalidate(&first).await);
        let third = manager.get_session().await.unwrap();
        assert!(same_session(&second, &third));
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_dead_session_is_replaced() {
        let connector = MockConnector::new("secret");
        let manager = SessionManager::new(
            config(Some("secret")),
            connector.clone(),
            CountingPrompt::new("secret"),
        );

        let first = manager.get_session().await.unwrap();
        first.close().await;
        let second = manager.get_session().await.unwrap();
        assert!(!same_session(&first, &second));
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_ping_policy_keeps_healthy_session() {
        let connector = MockConnector::new("secret");
        let mut cfg = config(Some("secret"));
        cfg.dial_failure = DialFailurePolicy::Ping;
        let manager = SessionManager::new(cfg, connector.clone(), CountingPrompt::new("secret"));

        let session = manager.get_session().await.unwrap();
        manager
            .report_failure(&session, &TunnelError::Rejected("refused".into()))
            .await;
        let again = manager.get_session().await.unwrap();
        assert!(same_session(&session, &again));

        connector.last_session().unwrap().set_fail_ping(true);
        manager
            .report_failure(&session, &TunnelError::Rejected("refused".into()))
            .await;
        let replaced = manager.get_session().await.unwrap();
        assert!(!same_session(&session, &replaced));
    }

    #[tokio::test]
    async fn test_heartbeat_failure_invalidates() {
        let connector = MockConnector::new("secret");
        let mut cfg = config(Some("secret"));
        cfg.keepalive = Some(Duration::from_millis(20));
        let manager = SessionManager::new(cfg, connector.clone(), CountingPrompt::new("secret"));

        manager.get_session().await.unwrap();
        connector.last_session().unwrap().set_fail_ping(true);

        let mut states = manager.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| *s == SessionState::Disconnected),
        )
        .await
        .expect("heartbeat should invalidate the session")
        .unwrap();
    }

    #[tokio::test]
    async fn test_idle_retired_session_is_closed() {
        let connector = MockConnector::new("secret");
        let manager = SessionManager::new(
            config(Some("secret")),
            connector.clone(),
            CountingPrompt::new("secret"),
        );

        let first = manager.get_session().await.unwrap();
        let mock = connector.last_session().unwrap();
        manager.invalidate(&first).await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while mock.closes() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("idle retired session should be closed");
    }

    #[tokio::test]
    async fn test_retired_signal_fires_on_invalidate() {
        let connector = MockConnector::new("secret");
        let manager = SessionManager::new(
            config(Some("secret")),
            connector.clone(),
            CountingPrompt::new("secret"),
        );

        let first = manager.get_session().await.unwrap();
        let signal = manager.retired_signal(&first);
        assert!(!signal.is_cancelled());

        // 仍有通道的旧会话不会立即关闭
        let mock = connector.last_session().unwrap();
        mock.set_active_channels(2);
        manager.invalidate(&first).await;
        assert!(signal.is_cancelled());
        assert!(manager.retired_signal(&first).is_cancelled());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mock.closes(), 0);

        mock.set_active_channels(0);
        tokio::time::timeout(Duration::from_secs(3), async {
            while mock.closes() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("retired session should close once idle");

        let second = manager.get_session().await.unwrap();
        let signal = manager.retired_signal(&second);
        manager.close().await;
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_close_aborts_pending_reconnect() {
        let connector = MockConnector::new("secret");
        connector.fail_next_connects(usize::MAX);
        let manager = SessionManager::new(
            config(Some("secret")),
            connector.clone(),
            CountingPrompt::new("secret"),
        );

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_session().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        manager.close().await;
        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("get_session should return after close")
            .unwrap();
        assert!(matches!(result, Err(TunnelError::Shutdown)));
        assert_eq!(manager.state(), SessionState::Closed);
        assert!(manager.get_session().await.is_err());
    }

    #[tokio::test]
    async fn test_close_closes_current_session_once() {
        let connector = MockConnector::new("secret");
        let manager = SessionManager::new(
            config(Some("secret")),
            connector.clone(),
            CountingPrompt::new("secret"),
        );

        manager.get_session().await.unwrap();
        manager.close().await;
        assert_eq!(connector.last_session().unwrap().closes(), 1);
    }
}
