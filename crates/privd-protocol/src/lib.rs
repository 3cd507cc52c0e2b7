pub mod paths;

use serde::{Deserialize, Serialize};

/// Permission flag: the principal has been granted access.
pub const FLAG_ALLOWED: u32 = 1 << 1;
/// Permission flag: the principal has been explicitly refused access.
pub const FLAG_DENIED: u32 = 1 << 2;
/// All permission bits. ALLOWED and DENIED are mutually exclusive in a
/// stored value; a record carrying both is treated as corrupt.
pub const MASK_PERMISSION: u32 = FLAG_ALLOWED | FLAG_DENIED;

/// A uid-identified caller, optionally scoped to a package name.
/// Stable across broker restarts, unlike a session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrincipalIdentity {
    pub uid: u32,
    #[serde(default)]
    pub package_name: Option<String>,
}

impl PrincipalIdentity {
    pub fn new(uid: u32) -> Self {
        Self {
            uid,
            package_name: None,
        }
    }

    pub fn with_package(uid: u32, package_name: impl Into<String>) -> Self {
        Self {
            uid,
            package_name: Some(package_name.into()),
        }
    }
}

/// Command descriptor for a worker session launched on a principal's behalf.
/// Equality over all fields is the deduplication key: starting an equal
/// descriptor twice reuses the running session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceDescriptor {
    pub exec: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

/// Client-to-broker requests sent as JSON-lines over the Unix socket.
/// The caller's (uid, pid) never travels in the payload; the transport
/// derives it from the connection's peer credentials.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    // Session lifecycle
    Attach {
        #[serde(default)]
        package_name: Option<String>,
        #[serde(default)]
        api_version: i32,
    },
    Detach,

    // Permission queries and grants
    CheckPermission,
    RequestPermission {
        request_code: i32,
    },
    DispatchConfirmationResult {
        request_uid: u32,
        request_pid: i32,
        request_code: i32,
        allowed: bool,
        #[serde(default)]
        onetime: bool,
    },
    IsPermissionActive,

    // Flag administration
    GetFlagsForUid {
        uid: u32,
        mask: u32,
    },
    UpdateFlagsForUid {
        uid: u32,
        mask: u32,
        value: u32,
    },
    RemoveUidConfig {
        uid: u32,
    },

    // Worker sessions
    UserServiceStart {
        descriptor: ServiceDescriptor,
    },
    UserServiceStop {
        token: String,
    },

    // Manager-side introspection and control
    ListClients,
    Exit,
}

/// Broker-to-client responses.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
}

impl Response {
    pub fn ok(data: Option<serde_json::Value>) -> Self {
        Response::Ok { data }
    }
}

/// Error codes for structured rejection handling. `NotAttached` and
/// `PermissionDenied` are distinct so a client can tell "attach again"
/// apart from "ask for permission".
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotAttached,
    PermissionDenied,
    ManagerOnly,
    InvalidRequest,
    ServerError,
}

/// Summary of one attached client, returned by `ListClients`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientInfo {
    pub uid: u32,
    pub pid: i32,
    pub package_name: Option<String>,
    pub api_version: i32,
    pub allowed: bool,
}
