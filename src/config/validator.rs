use anyhow::{bail, Result};
use std::collections::HashSet;
use tracing::warn;

use super::{ClientConfig, Direction, GatewayConfig, HostConfig, TunnelSpec};
use crate::buffer_pool::MAX_BUFFER_SIZE;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证 host:port 形式的地址
    pub fn validate_socket_address(addr: &str, context: &str) -> Result<()> {
        Self::validate_address(addr, context)?;

        let Some((host, port)) = addr.rsplit_once(':') else {
            bail!("{}: '{}' is missing a port (expected host:port)", context, addr);
        };
        if host.trim().is_empty() {
            bail!("{}: '{}' is missing a host", context, addr);
        }
        if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
            bail!("{}: IPv6 address '{}' must be written as [addr]:port", context, addr);
        }
        if port.parse::<u16>().is_err() {
            bail!("{}: invalid port '{}' in '{}'", context, port, addr);
        }
        Ok(())
    }

    /// 验证名称不为空
    pub fn validate_name(name: &str, context: &str) -> Result<()> {
        if name.trim().is_empty() {
            bail!("{}: name cannot be empty", context);
        }
        Ok(())
    }

    /// 验证单条隧道
    pub fn validate_tunnel(tunnel: &TunnelSpec, context: &str) -> Result<()> {
        Self::validate_socket_address(&tunnel.local, &format!("{} local", context))?;
        Self::validate_socket_address(&tunnel.remote, &format!("{} remote", context))?;
        Ok(())
    }

    /// 验证单个主机配置
    pub fn validate_host(host: &HostConfig) -> Result<()> {
        Self::validate_socket_address(&host.address, "Host address")?;
        Self::validate_name(&host.user, &format!("Host '{}' user", host.address))?;

        if host.timeout == 0 {
            bail!("Host '{}': timeout must be at least 1 second", host.address);
        }

        if host.buffer_size == 0 || host.buffer_size > MAX_BUFFER_SIZE {
            bail!(
                "Host '{}': buffer_size must be between 1 and {} (got {})",
                host.address,
                MAX_BUFFER_SIZE,
                host.buffer_size
            );
        }

        if host.tunnels.is_empty() {
            bail!("Host '{}': no tunnels defined", host.address);
        }

        for (idx, tunnel) in host.tunnels.iter().enumerate() {
            let context = format!("Host '{}' tunnel #{}", host.address, idx + 1);
            Self::validate_tunnel(tunnel, &context)?;
        }

        if host.skip_verify {
            warn!(
                "Host '{}': skip_verify is enabled, the gateway certificate will not be checked",
                host.address
            );
        }

        Ok(())
    }

    /// 验证客户端完整配置
    pub fn validate_client_config(config: &ClientConfig) -> Result<()> {
        if config.hosts.is_empty() {
            bail!("No hosts defined");
        }

        let mut seen_local = HashSet::new();
        for host in &config.hosts {
            Self::validate_host(host)?;

            // forward 隧道的本地监听地址在整个文件内唯一
            for tunnel in host
                .tunnels
                .iter()
                .filter(|t| t.direction == Direction::Forward)
            {
                if !seen_local.insert(tunnel.local.as_str()) {
                    bail!(
                        "Duplicate forward listen address '{}': each forward tunnel needs its own local address",
                        tunnel.local
                    );
                }
            }
        }

        Ok(())
    }

    /// 验证网关配置
    pub fn validate_gateway_config(config: &GatewayConfig) -> Result<()> {
        Self::validate_address(&config.bind_addr, "Gateway bind_addr")?;

        match (&config.cert_path, &config.key_path) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => bail!("cert_path and key_path must both be set, or both omitted to auto-generate"),
        }

        if config.users.is_empty() {
            bail!("Gateway: at least one user must be configured");
        }

        let mut seen = HashSet::new();
        for user in &config.users {
            Self::validate_name(&user.name, "Gateway user")?;
            if !seen.insert(user.name.as_str()) {
                bail!("Duplicate gateway user '{}'", user.name);
            }
            if user.password.is_empty() {
                bail!("Gateway user '{}': password cannot be empty", user.name);
            }
        }

        if !config.allow_dial && !config.allow_listen {
            warn!("Gateway: both allow_dial and allow_listen are disabled, every tunnel will be refused");
        }

        Ok(())
    }
}
