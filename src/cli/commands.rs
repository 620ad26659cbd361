use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::engine::Engine;
use crate::gateway::Gateway;
use crate::session::{CredentialProvider, NoPrompt, TerminalPrompt};

use super::cert;
use super::config::{check_config, check_config_file_permissions, expand_path};
use super::template;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Template {
            template_type,
            output,
        } => {
            template::generate_config_template(template_type, output.as_deref())?;
        }
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            cert::generate_certificate(cert_out, key_out, common_name, alt_names)?;
        }
        Commands::Run { config } => {
            run_tunnels(config).await?;
        }
        Commands::Gateway { config } => {
            run_gateway(config).await?;
        }
    }

    Ok(())
}

/// 标准输入是终端时交互式输入密码
///
/// 返回的令牌在用户于提示中按下 Ctrl+C 时触发。
fn credential_provider() -> (Arc<dyn CredentialProvider>, CancellationToken) {
    use std::io::IsTerminal;

    if std::io::stdin().is_terminal() {
        let prompt = TerminalPrompt::new();
        let interrupted = prompt.interrupted();
        (Arc::new(prompt), interrupted)
    } else {
        (Arc::new(NoPrompt), CancellationToken::new())
    }
}

/// Run all configured tunnels until Ctrl+C
async fn run_tunnels(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;

    // 检查配置文件权限
    check_config_file_permissions(&config_path)?;

    info!("Loading configuration from: {}", config_path);
    let client_config = AppConfig::load_client_config(&config_path)?;

    let (credentials, interrupted) = credential_provider();
    let mut engines = Vec::new();
    for host in client_config.hosts {
        engines.push(Engine::from_config(host, credentials.clone())?);
    }

    // 凭据提示串行进行，依次启动
    for engine in &engines {
        if let Err(e) = engine.start().await {
            for engine in &engines {
                engine.close().await;
            }
            if interrupted.is_cancelled() {
                info!("Password input cancelled, stopped");
                return Ok(());
            }
            error!("Failed to start tunnels via {}: {}", engine.address(), e);
            return Err(e.into());
        }
    }

    info!("All tunnels started (Press Ctrl+C to stop)");
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Received shutdown signal, closing tunnels...");
        }
        _ = interrupted.cancelled() => {
            info!("Password input cancelled, closing tunnels...");
        }
    }

    futures::future::join_all(engines.iter().map(|engine| engine.close())).await;

    info!("Stopped gracefully");
    Ok(())
}

/// Run the gateway until Ctrl+C
async fn run_gateway(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;

    // 检查配置文件权限
    check_config_file_permissions(&config_path)?;

    info!("Loading gateway configuration from: {}", config_path);
    let gateway_config = AppConfig::load_gateway_config(&config_path)?;

    let gateway = Gateway::from_config(gateway_config).await?;
    let shutdown = gateway.shutdown_token();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal, stopping gateway..."),
            Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
        }
        shutdown.cancel();
    });

    gateway.run().await
}
