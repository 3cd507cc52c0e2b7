use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, error, info, warn};

use libprivd::{ConfirmationDecision, EndpointHandle, PrivdError, RemoteEndpoint};
use privd_protocol::{ErrorCode, PrincipalIdentity, Request, Response};

use crate::server::ServerState;

/// Handle a single client connection. The caller's (uid, pid) comes from
/// the socket's peer credentials, never from the payload.
pub async fn handle_client(stream: UnixStream, state: Arc<ServerState>) {
    let creds = match stream.peer_cred() {
        Ok(creds) => creds,
        Err(e) => {
            error!("failed to read peer credentials: {e}");
            return;
        }
    };
    let uid = creds.uid();
    let Some(pid) = creds.pid() else {
        warn!(uid, "peer credentials carry no pid, dropping connection");
        return;
    };

    // One liveness handle per connection; every session attached over it
    // dies with it.
    let endpoint = EndpointHandle::new();

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    debug!(uid, pid, "client connected");

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(uid, pid, "client disconnected");
                break;
            }
            Err(e) => {
                error!(uid, pid, "read error: {e}");
                break;
            }
        };

        let request: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let resp = Response::Error {
                    message: format!("invalid request: {e}"),
                    code: ErrorCode::InvalidRequest,
                };
                if write_response(&mut writer, &resp).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let response = handle_request(request, uid, pid, &endpoint, &state);

        if let Err(e) = write_response(&mut writer, &response).await {
            error!(uid, pid, "write error: {e}");
            break;
        }
    }

    // Fires every liveness observer registered on this connection.
    endpoint.mark_disconnected();
}

fn handle_request(
    request: Request,
    uid: u32,
    pid: i32,
    endpoint: &Arc<EndpointHandle>,
    state: &Arc<ServerState>,
) -> Response {
    let service = &state.service;

    match request {
        Request::Attach {
            package_name,
            api_version,
        } => {
            let identity = match package_name {
                Some(package) => PrincipalIdentity::with_package(uid, package),
                None => PrincipalIdentity::new(uid),
            };
            let record = service.attach_application(
                identity,
                pid,
                Arc::clone(endpoint) as Arc<dyn RemoteEndpoint>,
                api_version,
            );
            Response::ok(Some(serde_json::json!({ "allowed": record.is_allowed() })))
        }

        Request::Detach => {
            service.detach_application(uid, pid);
            Response::ok(None)
        }

        Request::CheckPermission => Response::ok(Some(serde_json::json!({
            "allowed": service.check_permission(uid, pid),
        }))),

        Request::RequestPermission { request_code } => {
            result_response(service.request_permission(uid, pid, request_code))
        }

        Request::DispatchConfirmationResult {
            request_uid,
            request_pid,
            request_code,
            allowed,
            onetime,
        } => {
            // Only the manager application hosts the confirmation surface.
            if let Err(e) =
                service.check_caller_manager_permission("dispatch_confirmation_result", uid)
            {
                return error_response(e);
            }
            result_response(service.dispatch_permission_confirmation_result(
                request_uid,
                request_pid,
                request_code,
                ConfirmationDecision { allowed, onetime },
            ))
        }

        Request::IsPermissionActive => Response::ok(Some(serde_json::json!({
            "active": service.is_permission_active(),
        }))),

        Request::GetFlagsForUid { uid: target, mask } => Response::ok(Some(serde_json::json!({
            "flags": service.get_flags_for_uid(target, mask),
        }))),

        Request::UpdateFlagsForUid {
            uid: target,
            mask,
            value,
        } => result_response(service.update_flags_for_uid(uid, target, mask, value)),

        Request::RemoveUidConfig { uid: target } => {
            result_response(service.remove_uid_config(uid, target))
        }

        Request::UserServiceStart { descriptor } => {
            match service.user_service_start(uid, pid, &descriptor) {
                Ok(token) => Response::ok(Some(serde_json::json!({ "token": token }))),
                Err(e) => error_response(e),
            }
        }

        Request::UserServiceStop { token } => {
            result_response(service.user_service_stop(uid, pid, &token))
        }

        Request::ListClients => match service.list_clients(uid) {
            Ok(clients) => Response::ok(serde_json::to_value(&clients).ok()),
            Err(e) => error_response(e),
        },

        Request::Exit => {
            if let Err(e) = service.check_caller_manager_permission("exit", uid) {
                return error_response(e);
            }
            info!(uid, pid, "exit requested by manager");
            state.begin_shutdown();
            Response::ok(None)
        }
    }
}

fn result_response(result: Result<(), PrivdError>) -> Response {
    match result {
        Ok(()) => Response::ok(None),
        Err(e) => error_response(e),
    }
}

fn error_response(e: PrivdError) -> Response {
    let (code, message) = e.to_error_code();
    Response::Error { message, code }
}

async fn write_response(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: &Response,
) -> Result<(), std::io::Error> {
    let json = serde_json::to_string(response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
