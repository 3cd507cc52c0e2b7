//! End-to-end broker scenarios against an in-memory store and test
//! endpoints, exercising the full attach → request → confirm → check
//! lifecycle the way a transport would drive it.

use std::sync::Arc;

use libprivd::{
    AutoApprove, ConfirmationDecision, ConfirmationPrompt, ConfirmationRequest, EndpointHandle,
    PrivdError, PrivdService, RemoteEndpoint, SessionLauncher, SqliteConfigStore,
};
use privd_protocol::{PrincipalIdentity, ServiceDescriptor, FLAG_ALLOWED, MASK_PERMISSION};

const MANAGER_UID: u32 = 1000;

struct TestLauncher;

impl SessionLauncher for TestLauncher {
    fn launch(
        &self,
        _uid: u32,
        _descriptor: &ServiceDescriptor,
    ) -> Result<Arc<dyn RemoteEndpoint>, PrivdError> {
        Ok(EndpointHandle::new())
    }
}

struct DeferredPrompt;

impl ConfirmationPrompt for DeferredPrompt {
    fn decide(&self, _request: &ConfirmationRequest) -> Option<ConfirmationDecision> {
        None
    }
}

fn new_service(prompt: Box<dyn ConfirmationPrompt>) -> PrivdService {
    PrivdService::new(
        Arc::new(SqliteConfigStore::open(None, MANAGER_UID)),
        Box::new(TestLauncher),
        prompt,
        MANAGER_UID,
    )
}

fn attach(service: &PrivdService, uid: u32, pid: i32) -> Arc<EndpointHandle> {
    let endpoint = EndpointHandle::new();
    service.attach_application(
        PrincipalIdentity::with_package(uid, format!("com.example.u{uid}")),
        pid,
        endpoint.clone(),
        13,
    );
    endpoint
}

#[test]
fn owner_bootstrap_needs_no_confirmation() {
    let service = new_service(Box::new(DeferredPrompt));

    attach(&service, MANAGER_UID, 41);
    assert!(service.check_permission(MANAGER_UID, 41));
    assert_eq!(
        service.get_flags_for_uid(MANAGER_UID, MASK_PERMISSION),
        MASK_PERMISSION
    );
}

#[test]
fn non_owner_goes_through_the_grant_flow() {
    let service = new_service(Box::new(DeferredPrompt));

    attach(&service, 2000, 7);
    assert!(!service.check_permission(2000, 7));

    service.request_permission(2000, 7, 100).unwrap();
    service
        .dispatch_permission_confirmation_result(
            2000,
            7,
            100,
            ConfirmationDecision {
                allowed: true,
                onetime: false,
            },
        )
        .unwrap();

    assert!(service.check_permission(2000, 7));
}

#[test]
fn liveness_loss_reclaims_the_session() {
    let service = new_service(Box::new(AutoApprove));

    let endpoint = attach(&service, 42, 7);
    assert!(service.registry().find_client(42, 7).is_some());

    endpoint.mark_disconnected();
    assert!(service.registry().find_client(42, 7).is_none());
    // A permission check after reclaim is a plain false, not an error.
    assert!(!service.check_permission(42, 7));
}

#[test]
fn grant_survives_broker_restart() {
    let tmp = tempfile::TempDir::new().unwrap();

    {
        let service = PrivdService::new(
            Arc::new(SqliteConfigStore::open(Some(tmp.path()), MANAGER_UID)),
            Box::new(TestLauncher),
            Box::new(AutoApprove),
            MANAGER_UID,
        );
        attach(&service, 2000, 7);
        service.request_permission(2000, 7, 1).unwrap();
        assert!(service.check_permission(2000, 7));
    }

    // Same data dir, fresh broker: the decision is already on disk, so a
    // re-attaching client is seeded allowed with no new round-trip.
    let service = PrivdService::new(
        Arc::new(SqliteConfigStore::open(Some(tmp.path()), MANAGER_UID)),
        Box::new(TestLauncher),
        Box::new(DeferredPrompt),
        MANAGER_UID,
    );
    attach(&service, 2000, 9);
    assert!(service.check_permission(2000, 9));
}

#[test]
fn duplicate_sessions_coexist_until_one_dies() {
    let service = new_service(Box::new(AutoApprove));

    let first = attach(&service, 42, 7);
    let _second = attach(&service, 42, 7);
    assert_eq!(service.registry().find_clients(42).len(), 2);

    first.mark_disconnected();
    assert_eq!(service.registry().find_clients(42).len(), 1);
    assert!(service.registry().find_client(42, 7).is_some());
}

#[test]
fn confirmation_for_a_dead_request_is_ignored() {
    let service = new_service(Box::new(DeferredPrompt));
    attach(&service, 2000, 7);
    service.request_permission(2000, 7, 5).unwrap();

    // Wrong request code: stale, dropped.
    service
        .dispatch_permission_confirmation_result(
            2000,
            7,
            6,
            ConfirmationDecision {
                allowed: true,
                onetime: false,
            },
        )
        .unwrap();
    assert!(!service.check_permission(2000, 7));

    // The real one still resolves.
    service
        .dispatch_permission_confirmation_result(
            2000,
            7,
            5,
            ConfirmationDecision {
                allowed: true,
                onetime: false,
            },
        )
        .unwrap();
    assert!(service.check_permission(2000, 7));

    // Replaying it is now stale as well; revoke then replay must not grant.
    service.remove_uid_config(MANAGER_UID, 2000).unwrap();
    service
        .dispatch_permission_confirmation_result(
            2000,
            7,
            5,
            ConfirmationDecision {
                allowed: true,
                onetime: false,
            },
        )
        .unwrap();
    assert!(!service.check_permission(2000, 7));
}

#[test]
fn concurrent_attaches_from_one_principal_are_all_registered() {
    let service = Arc::new(new_service(Box::new(AutoApprove)));

    let mut handles = Vec::new();
    for pid in 0..16 {
        let service = Arc::clone(&service);
        handles.push(std::thread::spawn(move || {
            attach(&service, 2000, pid);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(service.registry().find_clients(2000).len(), 16);
}

#[test]
fn worker_sessions_dedup_and_follow_their_principal() {
    let service = new_service(Box::new(AutoApprove));
    attach(&service, 2000, 7);
    service.request_permission(2000, 7, 1).unwrap();

    let descriptor = ServiceDescriptor {
        exec: "/usr/libexec/sync-worker".to_string(),
        args: vec!["--once".to_string()],
        tag: Some("sync".to_string()),
    };

    let token = service.user_service_start(2000, 7, &descriptor).unwrap();
    let again = service.user_service_start(2000, 7, &descriptor).unwrap();
    assert_eq!(token, again);
    assert_eq!(service.user_services().session_count(), 1);

    service.user_service_stop(2000, 7, &token).unwrap();
    assert_eq!(service.user_services().session_count(), 0);
    assert!(matches!(
        service.user_service_stop(2000, 7, &token),
        Err(PrivdError::SessionNotFound(_))
    ));
}

#[test]
fn flags_seed_new_sessions_after_admin_update() {
    let service = new_service(Box::new(DeferredPrompt));

    service
        .update_flags_for_uid(MANAGER_UID, 2000, MASK_PERMISSION, FLAG_ALLOWED)
        .unwrap();

    // No session yet: flags query sees nothing attached.
    assert_eq!(service.get_flags_for_uid(2000, MASK_PERMISSION), 0);

    // But a new session seeds its cached grant from the store.
    attach(&service, 2000, 7);
    assert!(service.check_permission(2000, 7));
    assert_eq!(
        service.get_flags_for_uid(2000, MASK_PERMISSION),
        MASK_PERMISSION
    );
}
