use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::Notify;
use tracing::{error, info};

use libprivd::{AutoApprove, PrivdService, SqliteConfigStore};

use crate::config::ServerConfig;
use crate::connection;
use crate::launcher::ProcessLauncher;

/// Process-wide broker handle, owned by the entry point and shared with
/// connection tasks. There is deliberately no global instance.
pub struct ServerState {
    pub service: PrivdService,
    shutdown: Notify,
}

impl ServerState {
    pub fn begin_shutdown(&self) {
        self.shutdown.notify_one();
    }
}

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    // Clean up stale socket
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
    }

    // Ensure parent directory exists
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Write PID file
    let pid_path = privd_protocol::paths::pid_file_path();
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&pid_path, std::process::id().to_string())?;

    let listener = UnixListener::bind(&config.socket_path)?;
    info!(
        socket = %config.socket_path.display(),
        pid = std::process::id(),
        manager_uid = config.manager_uid,
        "privd broker started"
    );

    let store = Arc::new(SqliteConfigStore::open(
        Some(&config.data_dir),
        config.manager_uid,
    ));
    let state = Arc::new(ServerState {
        service: PrivdService::new(
            store,
            Box::new(ProcessLauncher),
            Box::new(AutoApprove),
            config.manager_uid,
        ),
        shutdown: Notify::new(),
    });

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        connection::handle_client(stream, state).await;
                    });
                }
                Err(e) => {
                    error!("accept error: {e}");
                }
            },
            _ = state.shutdown.notified() => {
                info!("shutting down on manager request...");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down...");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(&config.socket_path);
    let _ = std::fs::remove_file(&pid_path);
    Ok(())
}
