use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use privd_protocol::{
    ClientInfo, PrincipalIdentity, ServiceDescriptor, FLAG_ALLOWED, FLAG_DENIED, MASK_PERMISSION,
};

use crate::client::{ClientRecord, ClientRegistry};
use crate::endpoint::RemoteEndpoint;
use crate::error::PrivdError;
use crate::store::PermissionStore;
use crate::user_service::{SessionLauncher, UserSessionManager};

/// A pending grant request relayed to the confirmation collaborator.
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub uid: u32,
    pub pid: i32,
    pub request_code: i32,
    pub package_name: Option<String>,
}

/// The decision produced for a confirmation request. A one-time grant
/// updates attached sessions but is not persisted.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationDecision {
    pub allowed: bool,
    pub onetime: bool,
}

/// External confirmation collaborator.
///
/// A synchronous collaborator returns `Some(decision)` and the broker
/// applies it immediately. An interactive one returns `None` and later
/// feeds the user's choice back through
/// [`PrivdService::dispatch_permission_confirmation_result`].
pub trait ConfirmationPrompt: Send + Sync {
    fn decide(&self, request: &ConfirmationRequest) -> Option<ConfirmationDecision>;
}

/// Default confirmation collaborator: approves every request on the spot.
/// Stands in where no interactive confirmation surface is wired up.
pub struct AutoApprove;

impl ConfirmationPrompt for AutoApprove {
    fn decide(&self, request: &ConfirmationRequest) -> Option<ConfirmationDecision> {
        debug!(
            uid = request.uid,
            pid = request.pid,
            "auto-approving permission request"
        );
        Some(ConfirmationDecision {
            allowed: true,
            onetime: false,
        })
    }
}

/// The broker core: orchestrates attach/detach, permission queries,
/// grant requests and flag updates. Collaborators are injected; there is
/// no ambient global instance — the entry point owns the handle.
pub struct PrivdService {
    registry: ClientRegistry,
    store: Arc<dyn PermissionStore>,
    user_services: UserSessionManager,
    prompt: Box<dyn ConfirmationPrompt>,
    manager_uid: u32,
    /// Outstanding grant requests, keyed by (uid, pid, request code).
    /// Confirmation results that match nothing here are dropped.
    pending: Mutex<HashSet<(u32, i32, i32)>>,
}

impl PrivdService {
    pub fn new(
        store: Arc<dyn PermissionStore>,
        launcher: Box<dyn SessionLauncher>,
        prompt: Box<dyn ConfirmationPrompt>,
        manager_uid: u32,
    ) -> Self {
        Self {
            registry: ClientRegistry::new(Arc::clone(&store)),
            store,
            user_services: UserSessionManager::new(launcher),
            prompt,
            manager_uid,
            pending: Mutex::new(HashSet::new()),
        }
    }

    pub fn manager_uid(&self) -> u32 {
        self.manager_uid
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn user_services(&self) -> &UserSessionManager {
        &self.user_services
    }

    /// Register a session for the calling principal. The manager
    /// application self-authorizes here: its session is marked allowed
    /// and the decision persisted without a confirmation round-trip.
    pub fn attach_application(
        &self,
        identity: PrincipalIdentity,
        pid: i32,
        endpoint: Arc<dyn RemoteEndpoint>,
        api_version: i32,
    ) -> Arc<ClientRecord> {
        let record = self
            .registry
            .add_client(&identity, pid, endpoint, api_version);

        if identity.uid == self.manager_uid {
            record.set_allowed(true);
            let packages: Vec<String> = identity.package_name.iter().cloned().collect();
            if let Err(e) =
                self.store
                    .update(identity.uid, Some(&packages), MASK_PERMISSION, FLAG_ALLOWED)
            {
                warn!(uid = identity.uid, %e, "failed to persist manager grant");
            }
            info!(uid = identity.uid, pid, "manager application attached");
        }

        record
    }

    /// Balance detach for a session. Idempotent; liveness-loss performs
    /// the same removal when a caller never detaches.
    pub fn detach_application(&self, uid: u32, pid: i32) {
        self.registry.remove_client(uid, pid);
    }

    /// Whether the caller currently holds the permission. Never raises:
    /// a missing session or an undetermined decision reads as false.
    pub fn check_permission(&self, uid: u32, pid: i32) -> bool {
        if uid == self.manager_uid {
            return true;
        }
        self.registry
            .find_client(uid, pid)
            .map(|record| record.is_allowed())
            .unwrap_or(false)
    }

    /// Ask for the permission on behalf of an attached caller. The
    /// request parks in the pending set until the confirmation
    /// collaborator produces a decision; the default collaborator
    /// decides synchronously before this returns.
    pub fn request_permission(
        &self,
        uid: u32,
        pid: i32,
        request_code: i32,
    ) -> Result<(), PrivdError> {
        let record = self.registry.require_client(uid, pid, false)?;

        if self.check_permission(uid, pid) {
            debug!(uid, pid, "permission already granted, nothing to request");
            return Ok(());
        }
        if self.store.find(uid).is_some_and(|entry| entry.is_denied()) {
            // A recorded denial stands until explicitly revoked; don't
            // re-prompt on every request.
            info!(uid, pid, "permission request suppressed by recorded denial");
            return Ok(());
        }

        {
            let mut pending = self.pending.lock().expect("pending set lock");
            pending.insert((uid, pid, request_code));
        }
        info!(uid, pid, request_code, "permission requested");

        let request = ConfirmationRequest {
            uid,
            pid,
            request_code,
            package_name: record.package_name.clone(),
        };
        if let Some(decision) = self.prompt.decide(&request) {
            self.dispatch_permission_confirmation_result(uid, pid, request_code, decision)?;
        }
        Ok(())
    }

    /// Apply a decision from the confirmation collaborator. Results that
    /// match no outstanding request are dropped, never applied to an
    /// unrelated session.
    pub fn dispatch_permission_confirmation_result(
        &self,
        request_uid: u32,
        request_pid: i32,
        request_code: i32,
        decision: ConfirmationDecision,
    ) -> Result<(), PrivdError> {
        {
            let mut pending = self.pending.lock().expect("pending set lock");
            if !pending.remove(&(request_uid, request_pid, request_code)) {
                warn!(
                    uid = request_uid,
                    pid = request_pid,
                    request_code,
                    "dropping confirmation result with no matching request"
                );
                return Ok(());
            }
        }

        if !decision.onetime {
            let packages: Vec<String> = self
                .registry
                .find_clients(request_uid)
                .iter()
                .filter_map(|r| r.package_name.clone())
                .collect();
            let value = if decision.allowed {
                FLAG_ALLOWED
            } else {
                FLAG_DENIED
            };
            self.store
                .update(request_uid, Some(&packages), MASK_PERMISSION, value)?;
        }

        // Attached sessions see the decision without re-attaching.
        self.registry.refresh_allowed(request_uid, decision.allowed);
        info!(
            uid = request_uid,
            pid = request_pid,
            request_code,
            allowed = decision.allowed,
            onetime = decision.onetime,
            "permission confirmation applied"
        );
        Ok(())
    }

    /// Flags for a uid, masked: the owner gets the full mask, a uid with
    /// an allowed attached session gets the mask, everyone else zero.
    /// Read-only.
    pub fn get_flags_for_uid(&self, uid: u32, mask: u32) -> u32 {
        if uid == self.manager_uid {
            return mask;
        }
        if self
            .registry
            .find_clients(uid)
            .iter()
            .any(|r| r.is_allowed())
        {
            return mask;
        }
        0
    }

    /// Administrative flag override, manager-only. Writes straight
    /// through to the store and refreshes attached sessions.
    pub fn update_flags_for_uid(
        &self,
        caller_uid: u32,
        uid: u32,
        mask: u32,
        value: u32,
    ) -> Result<(), PrivdError> {
        self.check_caller_manager_permission("update_flags_for_uid", caller_uid)?;

        let mask = mask & MASK_PERMISSION;
        self.store.update(uid, None, mask, value & mask)?;

        if mask & FLAG_ALLOWED != 0 {
            self.registry
                .refresh_allowed(uid, value & FLAG_ALLOWED != 0);
        } else if mask & FLAG_DENIED != 0 && value & FLAG_DENIED != 0 {
            self.registry.refresh_allowed(uid, false);
        }
        info!(caller_uid, uid, mask, value, "flags updated");
        Ok(())
    }

    /// Drop a principal's persisted decision, returning it to
    /// undetermined. Attached sessions lose their cached grant.
    pub fn remove_uid_config(&self, caller_uid: u32, uid: u32) -> Result<(), PrivdError> {
        self.check_caller_manager_permission("remove_uid_config", caller_uid)?;
        self.store.remove(uid)?;
        self.registry.refresh_allowed(uid, false);
        info!(caller_uid, uid, "persisted decision removed");
        Ok(())
    }

    /// Whether the granted permission is in active use: true only when
    /// at least one attached session holds a granted decision. A running
    /// broker with no allowed clients reports false.
    pub fn is_permission_active(&self) -> bool {
        self.registry.any_allowed()
    }

    /// Manager-gated introspection over attached sessions.
    pub fn list_clients(&self, caller_uid: u32) -> Result<Vec<ClientInfo>, PrivdError> {
        self.check_caller_manager_permission("list_clients", caller_uid)?;
        Ok(self
            .registry
            .snapshot()
            .iter()
            .map(|r| ClientInfo {
                uid: r.uid,
                pid: r.pid,
                package_name: r.package_name.clone(),
                api_version: r.api_version,
                allowed: r.is_allowed(),
            })
            .collect())
    }

    /// Start a worker session on the caller's behalf. Requires an
    /// attached, authorized session.
    pub fn user_service_start(
        &self,
        uid: u32,
        pid: i32,
        descriptor: &ServiceDescriptor,
    ) -> Result<String, PrivdError> {
        self.registry.require_client(uid, pid, true)?;
        self.user_services.start(uid, descriptor)
    }

    /// Stop a worker session previously started by the caller.
    pub fn user_service_stop(&self, uid: u32, pid: i32, token: &str) -> Result<(), PrivdError> {
        self.registry.require_client(uid, pid, true)?;
        self.user_services.stop(token)
    }

    /// Gate for administrative operations: only the manager uid passes.
    pub fn check_caller_manager_permission(
        &self,
        func: &str,
        caller_uid: u32,
    ) -> Result<(), PrivdError> {
        if caller_uid == self.manager_uid {
            return Ok(());
        }
        warn!(caller_uid, func, "manager-only operation rejected");
        Err(PrivdError::ManagerOnly(func.to_string()))
    }
}
