use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The two fixed identity classes of the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Student, Role::Teacher];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
        }
    }

    /// Name of the external identifier for this role, as shown on login forms.
    pub fn id_label(&self) -> &'static str {
        match self {
            Role::Student => "admnno",
            Role::Teacher => "employee_id",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(Role::Student),
            "teacher" => Ok(Role::Teacher),
            _ => Err(()),
        }
    }
}

/// A registered principal. Keyed by `(role, external id)`; never carries the credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Identity {
    Student { admnno: String },
    Teacher { employee_id: String },
}

impl Identity {
    pub fn new(role: Role, external_id: impl Into<String>) -> Self {
        match role {
            Role::Student => Identity::Student { admnno: external_id.into() },
            Role::Teacher => Identity::Teacher { employee_id: external_id.into() },
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Identity::Student { .. } => Role::Student,
            Identity::Teacher { .. } => Role::Teacher,
        }
    }

    /// Admission number for students, employee id for teachers.
    pub fn external_id(&self) -> &str {
        match self {
            Identity::Student { admnno } => admnno,
            Identity::Teacher { employee_id } => employee_id,
        }
    }
}

/// Stored credential for one identity, as returned by the identity store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub identity: Identity,
    /// PHC-formatted argon2 hash.
    pub credential_hash: String,
}
