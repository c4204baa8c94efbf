//! Identity, session and authorization for the two portal roles.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod session;
mod provider;
mod authorizer;

pub use principal::{CredentialRecord, Identity, Role};
pub use session::{
    NavigationContext, Selection, SelectionField, SelectionLease, Session, SessionContextStore, SessionId,
};
pub use provider::{LocalAuthProvider, LoginRequest, LoginResponse};
pub use authorizer::AuthorizationGate;
