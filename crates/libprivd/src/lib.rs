pub mod client;
pub mod endpoint;
pub mod error;
pub mod service;
pub mod store;
pub mod user_service;

pub use client::{ClientRecord, ClientRegistry};
pub use endpoint::{DisconnectObserver, EndpointHandle, RemoteEndpoint};
pub use error::PrivdError;
pub use service::{
    AutoApprove, ConfirmationDecision, ConfirmationPrompt, ConfirmationRequest, PrivdService,
};
pub use store::{PermissionEntry, PermissionStore, SqliteConfigStore};
pub use user_service::{SessionLauncher, UserSessionManager, UserSessionRecord};
