//! 传输会话
//!
//! 会话是到一个远端网关的、已认证的多路复用连接，可以：
//! - 经网关向远端地址打开出站逻辑通道（dial）
//! - 在网关侧监听并接收入站逻辑通道（remote listen）
//!
//! [`SessionManager`] 是会话的唯一持有者，负责连接、认证、失效与重连。

mod credential;
mod manager;
#[cfg(test)]
pub(crate) mod mock;
mod yamux_session;

pub use credential::{
    CredentialProvider, NoPrompt, PromptCancelled, StaticCredentials, TerminalPrompt,
};
pub use manager::{SessionConfig, SessionManager};
pub use yamux_session::{YamuxConnector, YamuxSession};

use crate::error::Result;
use crate::transport::BoxedTransport;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// 会话上的一条逻辑通道
pub type BoxedStream = BoxedTransport;

/// 会话管理器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 尚无可用会话
    Disconnected,
    /// 正在连接与认证
    Connecting,
    /// 会话可用
    Authenticated,
    /// 认证失败，等待新凭据
    FailedAuth,
    /// 网络故障，等待重试
    FailedTransient,
    /// 管理器已关闭（终态）
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Authenticated => "authenticated",
            SessionState::FailedAuth => "failed-auth",
            SessionState::FailedTransient => "failed-transient",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// 已认证的多路复用会话
///
/// 实现必须允许多个任务并发地打开逻辑通道。
#[async_trait]
pub trait Session: Send + Sync {
    /// 经会话连接远端地址
    async fn dial(&self, target: &str) -> Result<BoxedStream>;

    /// 在远端监听地址，返回入站通道的接收器
    async fn listen(&self, bind: &str) -> Result<Box<dyn RemoteListener>>;

    /// 心跳
    async fn ping(&self) -> Result<()>;

    /// 关闭会话（幂等）
    async fn close(&self);

    /// 会话是否已经断开
    fn is_closed(&self) -> bool;

    /// 仍在使用中的逻辑通道数
    fn active_channels(&self) -> usize;
}

/// 远端监听器
#[async_trait]
pub trait RemoteListener: Send {
    /// 接收下一条入站通道，返回通道与远端对端地址
    ///
    /// 返回错误表示监听器已失效，需要重新建立。
    async fn accept(&mut self) -> Result<(BoxedStream, String)>;
}

/// 会话工厂：建立传输并完成认证
#[async_trait]
pub trait Connector: Send + Sync {
    /// 认证被拒绝时必须返回 [`TunnelError::AuthenticationFailed`](crate::TunnelError::AuthenticationFailed)，
    /// 以便与瞬时故障区分
    async fn connect(&self, user: &str, credential: &str) -> Result<Arc<dyn Session>>;
}

/// 比较两个会话句柄是否指向同一会话
pub(crate) fn same_session(a: &Arc<dyn Session>, b: &Arc<dyn Session>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
