//! Credential registration and verification.
//!
//! Passwords are stored as argon2id PHC strings with a fresh 16-byte salt. Hashing and
//! verification are CPU-bound, so both run on tokio's blocking pool and the request task
//! simply awaits the result.

use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, PasswordHasher, PasswordVerifier, Version};
use password_hash::{PasswordHash, SaltString};
use tracing::{debug, error};

use crate::error::{AuthError, PortalError, PortalResult, StorageError, ValidationError};
use crate::identity::{Identity, Role};
use crate::storage::IdentityStore;

fn hasher(params: &Params) -> Argon2<'static> {
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params.clone())
}

pub fn hash_password(params: &Params, password: &str) -> Result<String, StorageError> {
    let mut salt_bytes = [0u8; 16];
    getrandom::getrandom(&mut salt_bytes).map_err(|e| StorageError::Permanent(format!("salt: {e}")))?;
    let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| StorageError::Permanent(format!("salt: {e}")))?;
    let phc = hasher(params)
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| StorageError::Permanent(format!("hash: {e}")))?
        .to_string();
    Ok(phc)
}

/// Ok(true) on match, Ok(false) on mismatch. A hash that cannot be parsed is an error,
/// never a pass. Cost parameters are read from the PHC string itself.
pub fn verify_password(hash: &str, password: &str) -> Result<bool, StorageError> {
    let parsed = PasswordHash::new(hash).map_err(|e| StorageError::Permanent(format!("stored hash unreadable: {e}")))?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(password_hash::Error::Password) => Ok(false),
        Err(e) => Err(StorageError::Permanent(format!("verify: {e}"))),
    }
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> Result<T, StorageError> + Send + 'static) -> Result<T, StorageError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Permanent(format!("hash worker: {e}")))?
}

fn check_input(external_id: &str, plaintext: &str) -> Result<(), ValidationError> {
    if external_id.trim().is_empty() { return Err(ValidationError::BlankIdentifier); }
    if plaintext.is_empty() { return Err(ValidationError::BlankPassword); }
    Ok(())
}

pub struct CredentialVerifier<S> {
    store: Arc<S>,
    params: Params,
}

impl<S> Clone for CredentialVerifier<S> {
    fn clone(&self) -> Self { Self { store: self.store.clone(), params: self.params.clone() } }
}

impl<S: IdentityStore> CredentialVerifier<S> {
    /// Verifier using argon2's default cost.
    pub fn new(store: Arc<S>) -> Self { Self::with_params(store, Params::default()) }

    pub fn with_params(store: Arc<S>, params: Params) -> Self { Self { store, params } }

    pub async fn register(&self, role: Role, external_id: &str, plaintext: &str) -> PortalResult<Identity> {
        check_input(external_id, plaintext)?;
        let external_id = external_id.trim();
        if self.store.find(role, external_id).await?.is_some() {
            return Err(AuthError::AlreadyRegistered.into());
        }
        let params = self.params.clone();
        let plaintext = plaintext.to_string();
        let hash = blocking(move || hash_password(&params, &plaintext)).await?;
        match self.store.insert(role, external_id, &hash).await {
            Ok(identity) => {
                debug!(role = %role, id = %external_id, "credential.registered");
                Ok(identity)
            }
            // Lost a race with a concurrent registration of the same key.
            Err(StorageError::Conflict) => Err(AuthError::AlreadyRegistered.into()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn verify(&self, role: Role, external_id: &str, plaintext: &str) -> PortalResult<Identity> {
        let external_id = external_id.trim();
        let Some(record) = self.store.find(role, external_id).await? else {
            return Err(AuthError::NotFound.into());
        };
        let hash = record.credential_hash;
        let plaintext = plaintext.to_string();
        match blocking(move || verify_password(&hash, &plaintext)).await {
            Ok(true) => Ok(record.identity),
            Ok(false) => Err(AuthError::BadCredential.into()),
            Err(e) => {
                error!(role = %role, id = %external_id, "credential check failed: {}", e);
                Err(PortalError::Storage(e))
            }
        }
    }
}

/// Cheap argon2 cost for tests and local demos.
pub fn low_cost_params() -> Params {
    // 1 MiB, one pass, one lane; always valid.
    Params::new(1024, 1, 1, None).unwrap_or_default()
}
