mod config;
mod connection;
mod launcher;
mod server;

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "privd privilege broker daemon")]
struct Args {
    /// Unix socket to listen on (overrides config file).
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Directory for persistent broker state (overrides config file).
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Uid of the trusted manager application (overrides config file).
    #[arg(long)]
    manager_uid: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "privd_server=info,libprivd=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = config::ServerConfig::load()?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(manager_uid) = args.manager_uid {
        config.manager_uid = manager_uid;
    }

    server::run(config).await
}
