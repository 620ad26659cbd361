// 配置管理模块

mod validator;

pub use validator::ConfigValidator;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::relay::RELAY_CHUNK_SIZE;

/// 隧道方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// 本地监听，经会话连接远端
    Forward,
    /// 经会话在远端监听，连接本地
    Reverse,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Forward => write!(f, "forward"),
            Direction::Reverse => write!(f, "reverse"),
        }
    }
}

/// 单条隧道定义（加载后不可变）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub direction: Direction,
    /// 本地地址（forward: 监听地址；reverse: 连接目标）
    pub local: String,
    /// 远端地址（forward: 连接目标；reverse: 网关侧监听地址）
    pub remote: String,
}

impl TunnelSpec {
    pub fn forward(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            direction: Direction::Forward,
            local: local.into(),
            remote: remote.into(),
        }
    }

    pub fn reverse(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            direction: Direction::Reverse,
            local: local.into(),
            remote: remote.into(),
        }
    }

    /// 日志中使用的描述
    pub fn describe(&self) -> String {
        match self.direction {
            Direction::Forward => format!("{} => {}", self.local, self.remote),
            Direction::Reverse => format!("{} <= {}", self.local, self.remote),
        }
    }
}

/// 拨号失败时的会话失效策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DialFailurePolicy {
    /// 立即使会话失效
    #[default]
    Invalidate,
    /// 先发送一次心跳，失败才使会话失效
    Ping,
}

fn default_timeout() -> u64 {
    5
}

fn default_retry_delay() -> u64 {
    5
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_buffer_size() -> usize {
    RELAY_CHUNK_SIZE
}

/// 单个远端主机的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// 网关地址（host:port）
    pub address: String,
    /// 登录用户
    pub user: String,
    /// 登录密码（缺省时交互式输入）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// 连接与认证超时（秒）
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// TLS SNI（默认取 address 的主机部分）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// CA 证书路径（可选）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_path: Option<PathBuf>,
    /// 是否跳过证书验证（仅用于测试）
    #[serde(default)]
    pub skip_verify: bool,
    /// 重连间隔（秒）
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// 心跳间隔（秒），0 表示关闭
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
    /// 中继块大小（字节）
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// 拨号失败时的会话失效策略
    #[serde(default)]
    pub dial_failure: DialFailurePolicy,
    /// 隧道列表
    #[serde(default)]
    pub tunnels: Vec<TunnelSpec>,
}

impl HostConfig {
    /// 创建仅含必填字段的配置，其余取默认值
    pub fn new(address: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            user: user.into(),
            password: None,
            timeout: default_timeout(),
            server_name: None,
            ca_cert_path: None,
            skip_verify: false,
            retry_delay: default_retry_delay(),
            keepalive_interval: default_keepalive_interval(),
            buffer_size: default_buffer_size(),
            dial_failure: DialFailurePolicy::default(),
            tunnels: Vec::new(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }

    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_interval > 0).then(|| Duration::from_secs(self.keepalive_interval))
    }

    /// TLS 握手使用的服务器名称
    pub fn tls_server_name(&self) -> String {
        if let Some(name) = self.server_name.as_ref().filter(|n| !n.trim().is_empty()) {
            return name.clone();
        }
        let host = self
            .address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.address);
        host.trim_start_matches('[').trim_end_matches(']').to_string()
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_host(self)
    }
}

/// 客户端完整配置（多个远端主机）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

impl ClientConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_client_config(self)
    }
}

/// 网关用户
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub password: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_dial_timeout() -> u64 {
    10
}

/// 网关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// 监听地址
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 监听端口
    pub bind_port: u16,
    /// TLS 证书路径
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// TLS 私钥路径
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// 是否允许 dial 请求
    #[serde(default = "default_true")]
    pub allow_dial: bool,
    /// 是否允许 listen 请求
    #[serde(default = "default_true")]
    pub allow_listen: bool,
    /// 网关侧拨号超时（秒）
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
    /// 允许登录的用户
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

impl GatewayConfig {
    pub fn new(bind_addr: impl Into<String>, bind_port: u16) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            bind_port,
            cert_path: None,
            key_path: None,
            allow_dial: true,
            allow_listen: true,
            dial_timeout: default_dial_timeout(),
            users: Vec::new(),
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }

    /// 校验用户名与密码
    pub fn authorize(&self, user: &str, password: &str) -> bool {
        self.users
            .iter()
            .any(|u| u.name == user && u.password == password)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_gateway_config(self)
    }
}

/// 应用配置加载入口
pub struct AppConfig;

impl AppConfig {
    /// 从文件加载客户端配置
    pub fn load_client_config(path: &str) -> anyhow::Result<ClientConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path))?;
        Self::parse_client_config(&content)
    }

    /// 从字符串解析客户端配置
    pub fn parse_client_config(content: &str) -> anyhow::Result<ClientConfig> {
        let mut config: ClientConfig =
            toml::from_str(content).context("Failed to parse client configuration")?;
        for host in &mut config.hosts {
            if let Some(path) = host.ca_cert_path.take() {
                host.ca_cert_path = Some(expand_tilde(path));
            }
        }
        config
            .validate()
            .context("Configuration validation failed")?;
        Ok(config)
    }

    /// 从文件加载网关配置
    pub fn load_gateway_config(path: &str) -> anyhow::Result<GatewayConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path))?;
        Self::parse_gateway_config(&content)
    }

    /// 从字符串解析网关配置
    pub fn parse_gateway_config(content: &str) -> anyhow::Result<GatewayConfig> {
        #[derive(Deserialize)]
        struct GatewayConfigWrapper {
            gateway: GatewayConfig,
        }

        let wrapper: GatewayConfigWrapper =
            toml::from_str(content).context("Failed to parse gateway configuration")?;
        let mut gateway = wrapper.gateway;
        gateway.cert_path = gateway.cert_path.map(expand_tilde);
        gateway.key_path = gateway.key_path.map(expand_tilde);
        gateway
            .validate()
            .context("Gateway configuration validation failed")?;
        Ok(gateway)
    }
}

fn expand_tilde(path: PathBuf) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).into_owned()),
        None => path,
    }
}
