//!
//! classgate storage seams
//! ------------------------
//! The portal core never talks to a database directly. It calls two narrow interfaces:
//!
//! - `IdentityStore`: `(role, external id) -> credential hash` plus display profile lookup.
//! - `DataStore`: class lists, attendance, results and announcements, and the batch
//!   attendance increment which must commit all-or-nothing.
//!
//! Two backends are provided: `MemoryStore` (process-local, used for demos and tests) and
//! `PgStore` (tokio-postgres against the school schema). Anything implementing both traits
//! is a `PortalStore` and can back the HTTP server.

use std::collections::BTreeSet;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::identity::{CredentialRecord, Identity, Role};
use crate::navigation::TestColumn;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub type ClassId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub class_name: String,
    pub attendance_count: u32,
    pub total_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassScore {
    pub class_name: String,
    /// `None` when no mark has been entered for this test yet.
    pub score: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub admnno: String,
    pub first_name: String,
    pub last_name: String,
    pub attendance_count: u32,
    pub total_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRoster {
    pub class_id: ClassId,
    pub class_name: String,
    pub students: Vec<RosterEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentScore {
    pub admnno: String,
    pub first_name: String,
    pub last_name: String,
    pub score: Option<i32>,
}

pub trait IdentityStore: Send + Sync + 'static {
    fn find(&self, role: Role, external_id: &str) -> impl Future<Output = Result<Option<CredentialRecord>, StorageError>> + Send;

    /// Persist a new credential. Fails with `StorageError::Conflict` if the key exists;
    /// an existing hash is never replaced.
    fn insert(&self, role: Role, external_id: &str, credential_hash: &str) -> impl Future<Output = Result<Identity, StorageError>> + Send;

    /// "First Last" from the profile tables, if a profile exists.
    fn display_name(&self, identity: &Identity) -> impl Future<Output = Result<Option<String>, StorageError>> + Send;
}

pub trait DataStore: Send + Sync + 'static {
    /// Classes the identity is enrolled in (student) or teaches (teacher), by class id ascending.
    fn classes_for(&self, identity: &Identity) -> impl Future<Output = Result<Vec<String>, StorageError>> + Send;

    fn attendance_for(&self, admnno: &str) -> impl Future<Output = Result<Vec<AttendanceRecord>, StorageError>> + Send;

    fn results_for(&self, admnno: &str, test: TestColumn) -> impl Future<Output = Result<Vec<ClassScore>, StorageError>> + Send;

    /// `None` when no class has that name.
    fn announcements_for(&self, class_name: &str) -> impl Future<Output = Result<Option<Vec<Announcement>>, StorageError>> + Send;

    fn append_announcement(&self, class_name: &str, title: &str, body: &str) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn class_roster(&self, class_name: &str) -> impl Future<Output = Result<Option<ClassRoster>, StorageError>> + Send;

    fn class_results(&self, class_name: &str, test: TestColumn) -> impl Future<Output = Result<Option<Vec<StudentScore>>, StorageError>> + Send;

    /// Add one to each listed student's attendance in `class_id` and one to the class day
    /// counter, as a single unit: either every row changes or none does.
    fn increment_attendance(&self, class_id: ClassId, student_ids: &BTreeSet<String>) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// Everything the HTTP server needs from a backend.
pub trait PortalStore: IdentityStore + DataStore {}

impl<T: IdentityStore + DataStore> PortalStore for T {}
