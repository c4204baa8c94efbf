//! Unified portal error model.
//! Each layer raises one of the narrow taxonomy enums below; `PortalError` wraps them
//! so the HTTP boundary can decide between recovering (redirect / re-prompt) and failing.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no identity registered under that id")]
    NotFound,
    #[error("credential does not match")]
    BadCredential,
    #[error("identity already registered")]
    AlreadyRegistered,
    #[error("session is not authenticated for this role")]
    Unauthenticated,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("no selection has been made for this view")]
    MissingSelection,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown test column: {0}")]
    UnknownTestColumn(String),
    #[error("class name must not be blank")]
    BlankClassName,
    #[error("identifier must not be blank")]
    BlankIdentifier,
    #[error("password must not be blank")]
    BlankPassword,
    #[error("announcement needs a title")]
    BlankAnnouncementTitle,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("storage failure: {0}")]
    Permanent(String),
    /// Unique-key violation on insert.
    #[error("record already exists")]
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortalError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type PortalResult<T> = Result<T, PortalError>;

impl PortalError {
    pub fn code_str(&self) -> &'static str {
        match self {
            PortalError::Auth(AuthError::NotFound) => "not_found",
            PortalError::Auth(AuthError::BadCredential) => "bad_credential",
            PortalError::Auth(AuthError::AlreadyRegistered) => "already_registered",
            PortalError::Auth(AuthError::Unauthenticated) => "unauthenticated",
            PortalError::Context(ContextError::MissingSelection) => "missing_selection",
            PortalError::Validation(ValidationError::UnknownTestColumn(_)) => "unknown_test_column",
            PortalError::Validation(_) => "bad_input",
            PortalError::Storage(StorageError::Transient(_)) => "storage_unavailable",
            PortalError::Storage(StorageError::Permanent(_)) => "storage_error",
            PortalError::Storage(StorageError::Conflict) => "conflict",
        }
    }

    /// Status used when the error is not recovered by a redirect.
    pub fn http_status(&self) -> u16 {
        match self {
            PortalError::Auth(AuthError::Unauthenticated) => 401,
            PortalError::Auth(AuthError::NotFound) | PortalError::Auth(AuthError::BadCredential) => 401,
            PortalError::Auth(AuthError::AlreadyRegistered) => 409,
            PortalError::Context(_) => 409,
            PortalError::Validation(_) => 400,
            PortalError::Storage(StorageError::Transient(_)) => 503,
            PortalError::Storage(StorageError::Conflict) => 409,
            PortalError::Storage(StorageError::Permanent(_)) => 500,
        }
    }

    /// True for errors the boundary turns into a redirect instead of a failure page.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PortalError::Auth(_) | PortalError::Context(_))
    }
}
