use std::sync::Arc;

use tracing::info;

use super::principal::{Identity, Role};
use super::session::{SessionContextStore, SessionId};
use crate::error::PortalResult;
use crate::security::CredentialVerifier;
use crate::storage::IdentityStore;

#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub role: Role,
    pub external_id: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginResponse {
    /// Freshly issued id; the caller must hand this back to the client.
    pub session_id: SessionId,
    pub identity: Identity,
}

/// Login and registration against the local identity store. A successful call always
/// replaces the caller's session with a new one bound to the identity; a failed call leaves
/// the current session untouched (and therefore unauthenticated).
pub struct LocalAuthProvider<S> {
    verifier: CredentialVerifier<S>,
    sessions: Arc<SessionContextStore>,
}

impl<S> Clone for LocalAuthProvider<S> {
    fn clone(&self) -> Self { Self { verifier: self.verifier.clone(), sessions: self.sessions.clone() } }
}

impl<S: IdentityStore> LocalAuthProvider<S> {
    pub fn new(verifier: CredentialVerifier<S>, sessions: Arc<SessionContextStore>) -> Self {
        Self { verifier, sessions }
    }

    pub async fn login(&self, current: Option<&str>, req: &LoginRequest) -> PortalResult<LoginResponse> {
        let identity = self.verifier.verify(req.role, &req.external_id, &req.password).await?;
        Ok(self.start_session(current, identity, "auth.login"))
    }

    pub async fn register(&self, current: Option<&str>, req: &LoginRequest) -> PortalResult<LoginResponse> {
        let identity = self.verifier.register(req.role, &req.external_id, &req.password).await?;
        Ok(self.start_session(current, identity, "auth.register"))
    }

    fn start_session(&self, current: Option<&str>, identity: Identity, event: &'static str) -> LoginResponse {
        let session_id = self.sessions.regenerate(current);
        self.sessions.bind_identity(&session_id, identity.clone());
        info!(role = %identity.role(), id = %identity.external_id(), "{}", event);
        LoginResponse { session_id, identity }
    }
}
