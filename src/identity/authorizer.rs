use std::sync::Arc;

use super::principal::{Identity, Role};
use super::session::SessionContextStore;
use crate::error::AuthError;

/// Gate every protected operation runs through before touching a data collaborator.
#[derive(Clone)]
pub struct AuthorizationGate {
    sessions: Arc<SessionContextStore>,
}

impl AuthorizationGate {
    pub fn new(sessions: Arc<SessionContextStore>) -> Self { Self { sessions } }

    /// Identity bound to `session_id`, provided it holds `role`. No side effects beyond
    /// the session store's idle-time refresh; an unknown id is never allocated a session.
    pub fn require(&self, session_id: &str, role: Role) -> Result<Identity, AuthError> {
        match self.sessions.identity(session_id) {
            Some(identity) if identity.role() == role => Ok(identity),
            Some(identity) => {
                tracing::debug!(session = %session_id, have = %identity.role(), want = %role, "gate.role_mismatch");
                Err(AuthError::Unauthenticated)
            }
            None => Err(AuthError::Unauthenticated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> (Arc<SessionContextStore>, AuthorizationGate) {
        let store = Arc::new(SessionContextStore::default());
        (store.clone(), AuthorizationGate::new(store))
    }

    #[test]
    fn unbound_session_is_rejected_for_every_role() {
        let (store, gate) = gate();
        let sid = store.issue();
        for role in Role::ALL {
            assert_eq!(gate.require(&sid, role), Err(AuthError::Unauthenticated));
        }
        assert_eq!(gate.require("never-issued", Role::Student), Err(AuthError::Unauthenticated));
    }

    #[test]
    fn role_mismatch_is_rejected() {
        let (store, gate) = gate();
        let sid = store.issue();
        store.bind_identity(&sid, Identity::new(Role::Student, "1001"));
        assert_eq!(gate.require(&sid, Role::Teacher), Err(AuthError::Unauthenticated));
        assert_eq!(gate.require(&sid, Role::Student), Ok(Identity::new(Role::Student, "1001")));
    }

    #[test]
    fn rejecting_unknown_ids_leaves_store_untouched() {
        let (store, gate) = gate();
        for i in 0..1000 {
            assert_eq!(gate.require(&format!("junk{i}"), Role::Student), Err(AuthError::Unauthenticated));
        }
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn destroyed_session_loses_access() {
        let (store, gate) = gate();
        let sid = store.issue();
        store.bind_identity(&sid, Identity::new(Role::Teacher, "T9"));
        store.destroy(&sid);
        assert_eq!(gate.require(&sid, Role::Teacher), Err(AuthError::Unauthenticated));
    }
}
