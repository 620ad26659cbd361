use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::{AppConfig, ClientConfig, GatewayConfig};

/// 检查配置文件权限（仅Unix系统）
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &str) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = fs::metadata(config_path)
        .with_context(|| format!("Failed to read metadata for config file: {}", config_path))?;
    let mode = metadata.permissions().mode();

    // 组用户或其他用户可读（g+r = 0o040, o+r = 0o004）
    if mode & 0o044 != 0 {
        warn!(
            "⚠️  SECURITY WARNING: Config file '{}' is readable by group or others (permissions: {:o})\n\
             This file may contain passwords.\n\
             RECOMMENDATION: chmod 600 {}",
            config_path,
            mode & 0o777,
            config_path
        );
    }

    Ok(())
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &str) -> Result<()> {
    Ok(())
}

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    config_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

impl CheckResult {
    fn print(&self) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(self)?);
        Ok(())
    }
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

/// 文件中含有 [gateway] 表即视为网关配置
fn is_gateway_config(content: &str) -> bool {
    content
        .parse::<toml::Table>()
        .map(|table| table.contains_key("gateway"))
        .unwrap_or(false)
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let path = Path::new(config_path);
    let json = format == "json";

    if !path.exists() {
        if json {
            CheckResult {
                valid: false,
                config_type: "unknown".to_string(),
                warnings: vec![],
                error: Some(format!("Configuration file not found: {}", config_path)),
                details: serde_json::json!({}),
            }
            .print()?;
        } else {
            println!("✗ Configuration file not found: {}", config_path);
        }
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    if !json {
        println!("Checking configuration file: {}\n", config_path);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file: {}", config_path))?;

    let (config_type, loaded) = if is_gateway_config(&content) {
        (
            "gateway",
            AppConfig::parse_gateway_config(&content).map(|gateway| report_gateway(&gateway, json)),
        )
    } else {
        (
            "client",
            AppConfig::parse_client_config(&content).map(|client| report_client(&client, json)),
        )
    };

    match loaded {
        Ok(result) => result,
        Err(e) => {
            if json {
                CheckResult {
                    valid: false,
                    config_type: config_type.to_string(),
                    warnings: vec![],
                    error: Some(format!("{:#}", e)),
                    details: serde_json::json!({}),
                }
                .print()?;
            } else {
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{:#}", e);

                println!("\nCommon issues:");
                println!("  1. Check TOML syntax (brackets, quotes, commas)");
                println!("  2. Ensure all required fields are present");
                println!("  3. Addresses must be written as host:port ([addr]:port for IPv6)");
                println!("  4. direction must be \"forward\" or \"reverse\"");
                println!("  5. For client config: [[hosts]] with address, user and [[hosts.tunnels]]");
                println!("  6. For gateway config: [gateway] with bind_port and [[gateway.users]]");
            }
            Err(e)
        }
    }
}

fn report_client(config: &ClientConfig, json: bool) -> Result<()> {
    let mut warnings = Vec::new();
    let mut hosts = Vec::new();

    for host in &config.hosts {
        if host.password.is_none() {
            warnings.push(format!(
                "No password for {}@{}, it will be asked for at startup",
                host.user, host.address
            ));
        }
        if host.skip_verify {
            warnings.push(format!(
                "Certificate verification disabled for {}",
                host.address
            ));
        }
        if let Some(ref ca_path) = host.ca_cert_path {
            if !ca_path.exists() {
                warnings.push(format!("CA certificate file not found: {:?}", ca_path));
            }
        }

        hosts.push(serde_json::json!({
            "address": host.address,
            "user": host.user,
            "timeout": host.timeout,
            "retry_delay": host.retry_delay,
            "keepalive_interval": host.keepalive_interval,
            "dial_failure": host.dial_failure,
            "tunnels": host.tunnels,
        }));
    }

    if json {
        return CheckResult {
            valid: true,
            config_type: "client".to_string(),
            warnings,
            error: None,
            details: serde_json::json!({ "hosts": hosts }),
        }
        .print();
    }

    println!("✓ Configuration type: Client");
    println!("✓ Number of hosts: {}", config.hosts.len());
    for host in &config.hosts {
        println!("  Host {} as '{}'", host.address, host.user);
        for (idx, tunnel) in host.tunnels.iter().enumerate() {
            println!(
                "    Tunnel #{}: {} {}",
                idx + 1,
                tunnel.direction,
                tunnel.describe()
            );
        }
    }
    for warning in &warnings {
        println!("⚠ Warning: {}", warning);
    }
    println!("\n✓ Client configuration is valid!");
    Ok(())
}

fn report_gateway(config: &GatewayConfig, json: bool) -> Result<()> {
    let mut warnings = Vec::new();
    let mut details = serde_json::json!({
        "bind_addr": config.bind_addr,
        "bind_port": config.bind_port,
        "allow_dial": config.allow_dial,
        "allow_listen": config.allow_listen,
        "users": config.users.len(),
    });

    match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => {
            details["cert_path"] = serde_json::json!(cert);
            details["key_path"] = serde_json::json!(key);
            if !cert.exists() {
                warnings.push(format!("Certificate file not found: {:?}", cert));
            }
            if !key.exists() {
                warnings.push(format!("Key file not found: {:?}", key));
            }
        }
        _ => {
            details["cert_mode"] = serde_json::json!("auto-generate");
        }
    }

    if json {
        return CheckResult {
            valid: true,
            config_type: "gateway".to_string(),
            warnings,
            error: None,
            details,
        }
        .print();
    }

    println!("✓ Configuration type: Gateway");
    println!("✓ Bind address: {}:{}", config.bind_addr, config.bind_port);
    println!("✓ Dial allowed: {}", config.allow_dial);
    println!("✓ Listen allowed: {}", config.allow_listen);
    println!("✓ Users: {}", config.users.len());
    if config.cert_path.is_none() {
        println!("✓ Certificate/Key: will be auto-generated at runtime");
    }
    for warning in &warnings {
        println!("⚠ Warning: {}", warning);
    }
    println!("\n✓ Gateway configuration is valid!");
    Ok(())
}
