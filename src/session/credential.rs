/// 凭据提供者
///
/// 配置中没有密码、或密码被网关拒绝时调用。调用是阻塞的，会话管理器在
/// `spawn_blocking` 中执行。
use anyhow::{bail, Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use parking_lot::Mutex;
use std::io::Write;
use tokio_util::sync::CancellationToken;

/// 用户放弃输入（Ctrl+C / Ctrl+D / Esc）
///
/// 会话管理器收到该错误后停止重试并关闭。
#[derive(Debug, thiserror::Error)]
#[error("Password input cancelled")]
pub struct PromptCancelled;

/// 获取用户凭据
pub trait CredentialProvider: Send + Sync {
    /// 为 `user@address` 获取新的凭据（阻塞调用）
    fn prompt(&self, user: &str, address: &str) -> Result<String>;
}

/// 终端交互式密码输入
///
/// 多个主机共享同一个实例，提示不会交错出现。raw 模式下 Ctrl+C 不产生 SIGINT，
/// 输入被取消时触发 [`interrupted`](Self::interrupted)，之后的提示直接失败。
#[derive(Default)]
pub struct TerminalPrompt {
    lock: Mutex<()>,
    interrupted: CancellationToken,
}

impl TerminalPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用户在提示中取消输入时触发
    pub fn interrupted(&self) -> CancellationToken {
        self.interrupted.clone()
    }
}

impl CredentialProvider for TerminalPrompt {
    fn prompt(&self, user: &str, address: &str) -> Result<String> {
        let _guard = self.lock.lock();
        if self.interrupted.is_cancelled() {
            return Err(PromptCancelled.into());
        }

        let mut stderr = std::io::stderr();
        write!(stderr, "Password for {}@{}: ", user, address)?;
        stderr.flush()?;

        terminal::enable_raw_mode().context("Failed to enable raw terminal mode")?;
        let result = read_secret();
        // 无论成功与否都恢复终端
        let restored = terminal::disable_raw_mode();

        // raw 模式下回车不换行
        let _ = writeln!(stderr, "\r");
        restored.context("Failed to restore terminal mode")?;
        if result.as_ref().is_err_and(|e| e.is::<PromptCancelled>()) {
            self.interrupted.cancel();
        }
        result
    }
}

fn read_secret() -> Result<String> {
    let mut secret = String::new();
    loop {
        let Event::Key(KeyEvent {
            code,
            modifiers,
            kind,
            ..
        }) = event::read().context("Failed to read from terminal")?
        else {
            continue;
        };

        if kind != KeyEventKind::Press {
            continue;
        }

        match code {
            KeyCode::Enter => return Ok(secret),
            KeyCode::Char('c') | KeyCode::Char('d') if modifiers.contains(KeyModifiers::CONTROL) => {
                return Err(PromptCancelled.into());
            }
            KeyCode::Esc => return Err(PromptCancelled.into()),
            KeyCode::Backspace => {
                secret.pop();
            }
            KeyCode::Char(c) => secret.push(c),
            _ => {}
        }
    }
}

/// 固定凭据（非交互环境使用）
pub struct StaticCredentials {
    secret: String,
}

impl StaticCredentials {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn prompt(&self, _user: &str, _address: &str) -> Result<String> {
        Ok(self.secret.clone())
    }
}

/// 没有终端时使用，总是失败
pub struct NoPrompt;

impl CredentialProvider for NoPrompt {
    fn prompt(&self, user: &str, address: &str) -> Result<String> {
        bail!(
            "No password configured for {}@{} and no terminal available to ask for one",
            user,
            address
        )
    }
}
