use std::sync::{Arc, Mutex};

use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use libprivd::{DisconnectObserver, EndpointHandle, PrivdError, RemoteEndpoint, SessionLauncher};
use privd_protocol::ServiceDescriptor;

/// Liveness handle for a spawned worker process: the endpoint goes
/// disconnected when the child exits, and `close` kills it.
struct ProcessEndpoint {
    handle: Arc<EndpointHandle>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl RemoteEndpoint for ProcessEndpoint {
    fn watch_disconnect(&self, observer: DisconnectObserver) {
        self.handle.watch_disconnect(observer);
    }

    fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    fn close(&self) {
        if let Some(tx) = self.kill_tx.lock().expect("kill channel lock").take() {
            let _ = tx.send(());
        }
    }
}

/// Spawns worker processes for the user-session manager. Must be used
/// from within a tokio runtime; the exit watcher runs as a spawned task.
pub struct ProcessLauncher;

impl SessionLauncher for ProcessLauncher {
    fn launch(
        &self,
        uid: u32,
        descriptor: &ServiceDescriptor,
    ) -> Result<Arc<dyn RemoteEndpoint>, PrivdError> {
        let mut child = Command::new(&descriptor.exec)
            .args(&descriptor.args)
            .spawn()
            .map_err(|e| PrivdError::Launch(format!("{}: {e}", descriptor.exec)))?;

        let handle = EndpointHandle::new();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let watcher = Arc::clone(&handle);
        let exec = descriptor.exec.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    debug!(uid, exec = %exec, ?status, "user service exited");
                }
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!(uid, exec = %exec, %e, "failed to kill user service");
                    }
                    let _ = child.wait().await;
                    debug!(uid, exec = %exec, "user service killed");
                }
            }
            watcher.mark_disconnected();
        });

        Ok(Arc::new(ProcessEndpoint {
            handle,
            kill_tx: Mutex::new(Some(kill_tx)),
        }))
    }
}
