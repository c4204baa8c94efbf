//! Registration and login against the in-memory identity store: credential checks,
//! session regeneration and role separation.

use std::sync::Arc;

use anyhow::Result;

// Argon2 for generating PHC hashes in tests
use argon2::{Argon2, PasswordHasher};
use password_hash::SaltString;

use classgate::error::{AuthError, PortalError, ValidationError};
use classgate::identity::{AuthorizationGate, Identity, LocalAuthProvider, LoginRequest, Role, SessionContextStore};
use classgate::security::{low_cost_params, CredentialVerifier};
use classgate::storage::{IdentityStore, MemoryStore};

struct Harness {
    store: Arc<MemoryStore>,
    sessions: Arc<SessionContextStore>,
    provider: LocalAuthProvider<MemoryStore>,
    gate: AuthorizationGate,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let sessions = Arc::new(SessionContextStore::default());
    let verifier = CredentialVerifier::with_params(store.clone(), low_cost_params());
    Harness {
        provider: LocalAuthProvider::new(verifier, sessions.clone()),
        gate: AuthorizationGate::new(sessions.clone()),
        store,
        sessions,
    }
}

fn req(role: Role, id: &str, pw: &str) -> LoginRequest {
    LoginRequest { role, external_id: id.to_string(), password: pw.to_string() }
}

#[tokio::test]
async fn student_register_then_login_scenario() -> Result<()> {
    let h = harness();
    let reg = h.provider.register(None, &req(Role::Student, "1001", "pw1")).await?;
    assert_eq!(reg.identity, Identity::new(Role::Student, "1001"));

    let anon = h.sessions.issue();
    let ok = h.provider.login(Some(&anon), &req(Role::Student, "1001", "pw1")).await?;
    assert_eq!(h.gate.require(&ok.session_id, Role::Student)?, Identity::new(Role::Student, "1001"));
    assert!(!h.sessions.contains(&anon));

    let anon2 = h.sessions.issue();
    let err = h.provider.login(Some(&anon2), &req(Role::Student, "1001", "wrong")).await.unwrap_err();
    assert_eq!(err, PortalError::Auth(AuthError::BadCredential));
    assert_eq!(h.gate.require(&anon2, Role::Student), Err(AuthError::Unauthenticated));
    Ok(())
}

#[tokio::test]
async fn duplicate_registration_keeps_original_hash() -> Result<()> {
    let h = harness();
    h.provider.register(None, &req(Role::Teacher, "T100", "first")).await?;
    let before = h.store.credential_hash(Role::Teacher, "T100");
    let err = h.provider.register(None, &req(Role::Teacher, "T100", "second")).await.unwrap_err();
    assert_eq!(err, PortalError::Auth(AuthError::AlreadyRegistered));
    assert_eq!(h.store.credential_hash(Role::Teacher, "T100"), before);
    h.provider.login(None, &req(Role::Teacher, "T100", "first")).await?;
    Ok(())
}

#[tokio::test]
async fn unknown_id_is_not_found() {
    let h = harness();
    let err = h.provider.login(None, &req(Role::Student, "9999", "pw")).await.unwrap_err();
    assert_eq!(err, PortalError::Auth(AuthError::NotFound));
}

#[tokio::test]
async fn roles_are_separate_namespaces() -> Result<()> {
    let h = harness();
    h.provider.register(None, &req(Role::Student, "42", "student-pw")).await?;
    let err = h.provider.login(None, &req(Role::Teacher, "42", "student-pw")).await.unwrap_err();
    assert_eq!(err, PortalError::Auth(AuthError::NotFound));

    let resp = h.provider.register(None, &req(Role::Teacher, "42", "teacher-pw")).await?;
    assert_eq!(h.gate.require(&resp.session_id, Role::Student), Err(AuthError::Unauthenticated));
    assert!(h.gate.require(&resp.session_id, Role::Teacher).is_ok());
    Ok(())
}

#[tokio::test]
async fn blank_input_is_rejected_before_storage() {
    let h = harness();
    let err = h.provider.register(None, &req(Role::Student, "  ", "pw")).await.unwrap_err();
    assert_eq!(err, PortalError::Validation(ValidationError::BlankIdentifier));
    let err = h.provider.register(None, &req(Role::Student, "1001", "")).await.unwrap_err();
    assert_eq!(err, PortalError::Validation(ValidationError::BlankPassword));
    assert!(h.store.credential_hash(Role::Student, "1001").is_none());
}

#[tokio::test]
async fn hashes_from_default_params_verify() -> Result<()> {
    // A record hashed elsewhere with argon2 defaults must still verify: cost travels in the PHC string.
    let h = harness();
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).expect("salt");
    let salt = SaltString::encode_b64(&salt_bytes).expect("salt b64");
    let phc = Argon2::default().hash_password(b"imported", &salt).unwrap().to_string();
    h.store.insert(Role::Student, "2001", &phc).await?;

    let resp = h.provider.login(None, &req(Role::Student, "2001", "imported")).await?;
    assert_eq!(resp.identity.external_id(), "2001");
    Ok(())
}
