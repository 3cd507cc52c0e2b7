use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use privd_protocol::ServiceDescriptor;

use crate::endpoint::RemoteEndpoint;
use crate::error::PrivdError;

/// The one capability the manager needs from its host: turning a
/// descriptor into a running worker whose liveness can be observed.
pub trait SessionLauncher: Send + Sync {
    fn launch(
        &self,
        uid: u32,
        descriptor: &ServiceDescriptor,
    ) -> Result<Arc<dyn RemoteEndpoint>, PrivdError>;
}

/// One worker session running on a principal's behalf.
pub struct UserSessionRecord {
    pub token: String,
    pub uid: u32,
    pub descriptor: ServiceDescriptor,
    pub endpoint: Arc<dyn RemoteEndpoint>,
}

type SessionTable = Arc<Mutex<Vec<Arc<UserSessionRecord>>>>;

/// Registry of auxiliary worker sessions, keyed by (uid, descriptor).
///
/// Same lifecycle pattern as the client registry — append under the lock,
/// liveness observer removes — but its sessions are processes rather than
/// IPC endpoints, and a second `start` with an equal descriptor from the
/// same principal reuses the running session instead of spawning twice.
pub struct UserSessionManager {
    records: SessionTable,
    launcher: Box<dyn SessionLauncher>,
}

impl UserSessionManager {
    pub fn new(launcher: Box<dyn SessionLauncher>) -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            launcher,
        }
    }

    /// Start a worker for `uid`, or return the token of an existing one
    /// with an equal descriptor.
    pub fn start(&self, uid: u32, descriptor: &ServiceDescriptor) -> Result<String, PrivdError> {
        if let Some(existing) = self.find_by_descriptor(uid, descriptor) {
            debug!(uid, token = %existing.token, "reusing running user service");
            return Ok(existing.token.clone());
        }

        let endpoint = self.launcher.launch(uid, descriptor)?;
        let record = Arc::new(UserSessionRecord {
            token: uuid::Uuid::new_v4().to_string(),
            uid,
            descriptor: descriptor.clone(),
            endpoint: Arc::clone(&endpoint),
        });

        {
            let mut records = self.records.lock().expect("user service table lock");
            // A concurrent start may have won the race while we were
            // launching; keep its session and fold ours.
            if let Some(existing) = records
                .iter()
                .find(|r| r.uid == uid && r.descriptor == *descriptor)
            {
                let token = existing.token.clone();
                drop(records);
                endpoint.close();
                debug!(uid, %token, "concurrent start won, folding duplicate worker");
                return Ok(token);
            }
            records.push(Arc::clone(&record));
        }

        // Same ordering discipline as client attach: the observer goes in
        // after the record, so a worker that dies instantly still gets
        // cleaned out of the table.
        let table = Arc::clone(&self.records);
        let target = Arc::downgrade(&record);
        endpoint.watch_disconnect(Box::new(move || {
            if let Some(target) = target.upgrade() {
                let mut records = table.lock().expect("user service table lock");
                let before = records.len();
                records.retain(|r| !Arc::ptr_eq(r, &target));
                if records.len() != before {
                    debug!(
                        uid = target.uid,
                        token = %target.token,
                        "user service removed after exit"
                    );
                }
            }
        }));

        info!(uid, token = %record.token, exec = %descriptor.exec, "user service started");
        Ok(record.token.clone())
    }

    /// Stop the worker identified by `token` and drop its record.
    pub fn stop(&self, token: &str) -> Result<(), PrivdError> {
        let record = {
            let mut records = self.records.lock().expect("user service table lock");
            match records.iter().position(|r| r.token == token) {
                Some(pos) => records.remove(pos),
                None => return Err(PrivdError::SessionNotFound(token.to_string())),
            }
        };

        // Termination runs outside the lock; its disconnect observer will
        // find nothing left to remove.
        record.endpoint.close();
        info!(uid = record.uid, %token, "user service stopped");
        Ok(())
    }

    /// All worker sessions for a principal, snapshot semantics.
    pub fn find(&self, uid: u32) -> Vec<Arc<UserSessionRecord>> {
        self.records
            .lock()
            .expect("user service table lock")
            .iter()
            .filter(|r| r.uid == uid)
            .cloned()
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.records.lock().expect("user service table lock").len()
    }

    fn find_by_descriptor(
        &self,
        uid: u32,
        descriptor: &ServiceDescriptor,
    ) -> Option<Arc<UserSessionRecord>> {
        self.records
            .lock()
            .expect("user service table lock")
            .iter()
            .find(|r| r.uid == uid && r.descriptor == *descriptor)
            .cloned()
    }
}
