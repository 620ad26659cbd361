use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tunnel-relay")]
#[command(author, version, about = "Forward and reverse TCP tunnels over one multiplexed TLS session per host", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志详细程度（-v info, -vv debug, -vvv trace）
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 按配置运行所有隧道
    Run {
        /// 配置文件路径
        #[arg(short, long, default_value = "client.toml")]
        config: String,
    },
    /// 运行网关
    Gateway {
        /// 配置文件路径
        #[arg(short, long, default_value = "gateway.toml")]
        config: String,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,

        /// 输出格式
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 生成配置模板
    Template {
        /// 模板类型
        #[arg(value_parser = ["client", "gateway"])]
        template_type: String,

        /// 输出文件路径（默认输出到标准输出）
        #[arg(short, long)]
        output: Option<String>,
    },
    /// 生成自签名证书
    Cert {
        /// 证书输出路径
        #[arg(long, default_value = "cert.pem")]
        cert_out: String,

        /// 私钥输出路径
        #[arg(long, default_value = "key.pem")]
        key_out: String,

        /// 证书的 Common Name
        #[arg(long, default_value = "localhost")]
        common_name: String,

        /// 证书的 SubjectAltName（用逗号分隔多个）
        #[arg(long, value_delimiter = ',', value_name = "DNS,...")]
        alt_names: Vec<String>,
    },
}
