use anyhow::Result;
use clap::Parser;
use tracing::info;
use tunnel_relay::cli::{execute_command, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 运行类命令默认 info，其余命令默认静默；RUST_LOG 优先
    let default_level = match (cli.verbose, &cli.command) {
        (0, Commands::Run { .. } | Commands::Gateway { .. }) => "info",
        (0, _) => "off",
        (1, _) => "info",
        (2, _) => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("Tunnel Relay v{}", env!("CARGO_PKG_VERSION"));

    execute_command(&cli).await
}
