use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use privd_protocol::PrincipalIdentity;

use crate::endpoint::RemoteEndpoint;
use crate::error::PrivdError;
use crate::store::PermissionStore;

/// One attached client session, bound to a caller process id.
///
/// `allowed` caches the store's ALLOWED bit at attach time; it is not
/// re-synchronized automatically afterwards. Confirmation results and
/// flag updates flip it through the registry, everything else re-queries
/// the broker.
pub struct ClientRecord {
    pub uid: u32,
    pub pid: i32,
    pub package_name: Option<String>,
    pub api_version: i32,
    allowed: AtomicBool,
    pub endpoint: Arc<dyn RemoteEndpoint>,
}

impl ClientRecord {
    pub fn is_allowed(&self) -> bool {
        self.allowed.load(Ordering::Acquire)
    }

    pub fn set_allowed(&self, allowed: bool) {
        self.allowed.store(allowed, Ordering::Release);
    }
}

type ClientTable = Arc<Mutex<Vec<Arc<ClientRecord>>>>;

/// In-memory table of attached client sessions.
///
/// Attach appends, the liveness observer removes; both mutations and all
/// reads go through one lock. The lock is never held while the observer
/// itself is being installed, so an endpoint that dies mid-attach can
/// re-enter and still find the record it has to remove.
pub struct ClientRegistry {
    records: ClientTable,
    store: Arc<dyn PermissionStore>,
}

impl ClientRegistry {
    pub fn new(store: Arc<dyn PermissionStore>) -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            store,
        }
    }

    /// Register a session for `identity`. Duplicate (uid, pid) pairs are
    /// appended as-is; a stale duplicate disappears when its endpoint dies.
    pub fn add_client(
        &self,
        identity: &PrincipalIdentity,
        pid: i32,
        endpoint: Arc<dyn RemoteEndpoint>,
        api_version: i32,
    ) -> Arc<ClientRecord> {
        let allowed = self
            .store
            .find(identity.uid)
            .map(|entry| entry.is_allowed())
            .unwrap_or(false);

        let record = Arc::new(ClientRecord {
            uid: identity.uid,
            pid,
            package_name: identity.package_name.clone(),
            api_version,
            allowed: AtomicBool::new(allowed),
            endpoint: Arc::clone(&endpoint),
        });

        {
            let mut records = self.records.lock().expect("client table lock");
            records.push(Arc::clone(&record));
        }

        // Observer installed only after the record is in the table; if the
        // endpoint is already dead this fires right here and removes it.
        let table = Arc::clone(&self.records);
        let target = Arc::downgrade(&record);
        endpoint.watch_disconnect(Box::new(move || {
            if let Some(target) = target.upgrade() {
                let mut records = table.lock().expect("client table lock");
                let before = records.len();
                records.retain(|r| !Arc::ptr_eq(r, &target));
                if records.len() != before {
                    debug!(
                        uid = target.uid,
                        pid = target.pid,
                        "client removed after endpoint disconnect"
                    );
                }
            }
        }));

        debug!(
            uid = identity.uid,
            pid,
            package = ?identity.package_name,
            allowed,
            "client attached"
        );
        record
    }

    /// All sessions for a principal. Snapshot semantics: concurrent
    /// attach/remove does not corrupt the result.
    pub fn find_clients(&self, uid: u32) -> Vec<Arc<ClientRecord>> {
        self.records
            .lock()
            .expect("client table lock")
            .iter()
            .filter(|r| r.uid == uid)
            .cloned()
            .collect()
    }

    /// Exact (uid, pid) match. With duplicates, the oldest wins.
    pub fn find_client(&self, uid: u32, pid: i32) -> Option<Arc<ClientRecord>> {
        self.records
            .lock()
            .expect("client table lock")
            .iter()
            .find(|r| r.uid == uid && r.pid == pid)
            .cloned()
    }

    /// The single gate every privileged broker method passes through.
    pub fn require_client(
        &self,
        uid: u32,
        pid: i32,
        requires_permission: bool,
    ) -> Result<Arc<ClientRecord>, PrivdError> {
        let Some(record) = self.find_client(uid, pid) else {
            warn!(uid, pid, "caller is not an attached client");
            return Err(PrivdError::NotAttached { uid, pid });
        };
        if requires_permission && !record.is_allowed() {
            return Err(PrivdError::PermissionDenied { uid, pid });
        }
        Ok(record)
    }

    /// Balance detach. Removes the oldest (uid, pid) record, if any.
    pub fn remove_client(&self, uid: u32, pid: i32) -> bool {
        let removed = {
            let mut records = self.records.lock().expect("client table lock");
            match records.iter().position(|r| r.uid == uid && r.pid == pid) {
                Some(pos) => {
                    records.remove(pos);
                    true
                }
                None => false,
            }
        };
        if removed {
            debug!(uid, pid, "client detached");
        }
        removed
    }

    /// Flip the cached `allowed` bit on every session of a principal, so
    /// permission checks reflect a new decision without re-attach.
    pub fn refresh_allowed(&self, uid: u32, allowed: bool) {
        let records = self.records.lock().expect("client table lock");
        for record in records.iter().filter(|r| r.uid == uid) {
            record.set_allowed(allowed);
        }
    }

    /// Whether any attached session currently holds a granted permission.
    pub fn any_allowed(&self) -> bool {
        self.records
            .lock()
            .expect("client table lock")
            .iter()
            .any(|r| r.is_allowed())
    }

    /// Snapshot of every attached session, across principals.
    pub fn snapshot(&self) -> Vec<Arc<ClientRecord>> {
        self.records.lock().expect("client table lock").clone()
    }

    pub fn client_count(&self) -> usize {
        self.records.lock().expect("client table lock").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointHandle;
    use crate::store::SqliteConfigStore;
    use privd_protocol::FLAG_ALLOWED;

    const MANAGER_UID: u32 = 1000;

    fn registry() -> ClientRegistry {
        ClientRegistry::new(Arc::new(SqliteConfigStore::open(None, MANAGER_UID)))
    }

    fn attach(registry: &ClientRegistry, uid: u32, pid: i32) -> (Arc<ClientRecord>, Arc<EndpointHandle>) {
        let endpoint = EndpointHandle::new();
        let record = registry.add_client(
            &PrincipalIdentity::new(uid),
            pid,
            endpoint.clone(),
            13,
        );
        (record, endpoint)
    }

    #[test]
    fn attach_seeds_allowed_from_store() {
        let store = Arc::new(SqliteConfigStore::open(None, MANAGER_UID));
        store
            .update(42, Some(&["com.example".to_string()]), FLAG_ALLOWED, FLAG_ALLOWED)
            .unwrap();
        let registry = ClientRegistry::new(store);

        let endpoint = EndpointHandle::new();
        let record = registry.add_client(&PrincipalIdentity::new(42), 7, endpoint, 13);
        assert!(record.is_allowed());

        let endpoint = EndpointHandle::new();
        let record = registry.add_client(&PrincipalIdentity::new(43), 8, endpoint, 13);
        assert!(!record.is_allowed());
    }

    #[test]
    fn liveness_loss_removes_the_session() {
        let registry = registry();
        let (_record, endpoint) = attach(&registry, 42, 7);
        assert!(registry.find_client(42, 7).is_some());

        endpoint.mark_disconnected();
        assert!(registry.find_client(42, 7).is_none());
        assert_eq!(registry.client_count(), 0);
    }

    #[test]
    fn attach_to_already_dead_endpoint_leaves_no_record() {
        let registry = registry();
        let endpoint = EndpointHandle::new();
        endpoint.mark_disconnected();

        registry.add_client(&PrincipalIdentity::new(42), 7, endpoint, 13);
        assert!(registry.find_client(42, 7).is_none());
    }

    #[test]
    fn duplicate_attach_yields_two_entries() {
        // Duplicates per (uid, pid) are intended until one endpoint dies;
        // attach never replaces in place.
        let registry = registry();
        let (_r1, e1) = attach(&registry, 42, 7);
        let (_r2, _e2) = attach(&registry, 42, 7);

        assert_eq!(registry.find_clients(42).len(), 2);

        e1.mark_disconnected();
        assert_eq!(registry.find_clients(42).len(), 1);
        assert!(registry.find_client(42, 7).is_some());
    }

    #[test]
    fn require_client_distinguishes_missing_from_denied() {
        let registry = registry();

        let err = match registry.require_client(42, 7, true) {
            Ok(_) => panic!("expected require_client error"),
            Err(e) => e,
        };
        assert!(matches!(err, PrivdError::NotAttached { uid: 42, pid: 7 }));

        let (record, _endpoint) = attach(&registry, 42, 7);
        let err = match registry.require_client(42, 7, true) {
            Ok(_) => panic!("expected require_client error"),
            Err(e) => e,
        };
        assert!(matches!(err, PrivdError::PermissionDenied { uid: 42, pid: 7 }));

        // Without the permission requirement the gate passes.
        assert!(registry.require_client(42, 7, false).is_ok());

        record.set_allowed(true);
        assert!(registry.require_client(42, 7, true).is_ok());
    }

    #[test]
    fn refresh_allowed_flips_every_session_of_the_uid() {
        let registry = registry();
        let (r1, _e1) = attach(&registry, 42, 7);
        let (r2, _e2) = attach(&registry, 42, 8);
        let (other, _e3) = attach(&registry, 99, 9);

        registry.refresh_allowed(42, true);
        assert!(r1.is_allowed());
        assert!(r2.is_allowed());
        assert!(!other.is_allowed());
        assert!(registry.any_allowed());

        registry.refresh_allowed(42, false);
        assert!(!r1.is_allowed());
        assert!(!registry.any_allowed());
    }

    #[test]
    fn concurrent_attach_and_disconnect_keep_the_table_consistent() {
        let registry = Arc::new(registry());
        let mut handles = Vec::new();
        for i in 0..4 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                for j in 0..50 {
                    let endpoint = EndpointHandle::new();
                    registry.add_client(
                        &PrincipalIdentity::new(42),
                        i * 1000 + j,
                        endpoint.clone(),
                        13,
                    );
                    endpoint.mark_disconnected();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.client_count(), 0);
    }
}
