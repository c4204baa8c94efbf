//! tokio-postgres backend over the school schema.
//!
//! Reads share one client. Writes that must be atomic (the attendance batch) go through a
//! second, mutex-guarded client so that a transaction never interleaves with unrelated reads
//! on the same connection. Either client is reopened from the stored URL once its connection
//! has closed, so a dropped connection costs one failed attempt rather than the process.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, warn};

use super::{
    Announcement, AttendanceRecord, ClassId, ClassRoster, ClassScore, DataStore, IdentityStore, RosterEntry,
    StudentScore,
};
use crate::error::StorageError;
use crate::identity::{CredentialRecord, Identity, Role};
use crate::navigation::TestColumn;

/// Tables the store expects. Applied idempotently by `ensure_schema`.
pub const SCHEMA_DDL: &str = "
CREATE TABLE IF NOT EXISTS student_users (admnno TEXT PRIMARY KEY, password TEXT NOT NULL);
CREATE TABLE IF NOT EXISTS faculty_users (employee_id TEXT PRIMARY KEY, password TEXT NOT NULL);
CREATE TABLE IF NOT EXISTS student (id BIGSERIAL UNIQUE, admnno TEXT PRIMARY KEY, fname TEXT NOT NULL, lname TEXT NOT NULL);
CREATE TABLE IF NOT EXISTS teacher (employee_id TEXT PRIMARY KEY, fname TEXT NOT NULL, lname TEXT NOT NULL);
CREATE TABLE IF NOT EXISTS class (id BIGSERIAL PRIMARY KEY, name TEXT UNIQUE NOT NULL, total_days INTEGER NOT NULL DEFAULT 0);
CREATE TABLE IF NOT EXISTS announcement (id BIGSERIAL PRIMARY KEY, class_id BIGINT NOT NULL REFERENCES class(id), title TEXT NOT NULL, body TEXT NOT NULL);
CREATE TABLE IF NOT EXISTS staff (teacher_id TEXT NOT NULL REFERENCES teacher(employee_id), class_id BIGINT NOT NULL REFERENCES class(id), PRIMARY KEY (teacher_id, class_id));
CREATE TABLE IF NOT EXISTS enrollment (
    student_admnno TEXT NOT NULL REFERENCES student(admnno),
    class_id BIGINT NOT NULL REFERENCES class(id),
    attendance INTEGER NOT NULL DEFAULT 0,
    unit_test_1 INTEGER, unit_test_2 INTEGER, mid_term INTEGER, end_term INTEGER,
    PRIMARY KEY (student_admnno, class_id)
);
";

fn map_pg(e: tokio_postgres::Error) -> StorageError {
    match e.code() {
        Some(c) if *c == SqlState::UNIQUE_VIOLATION => StorageError::Conflict,
        Some(c) if *c == SqlState::T_R_SERIALIZATION_FAILURE || *c == SqlState::T_R_DEADLOCK_DETECTED => {
            StorageError::Transient(e.to_string())
        }
        _ if e.is_closed() => StorageError::Transient(e.to_string()),
        _ => StorageError::Permanent(e.to_string()),
    }
}

/// A client whose underlying connection can be observed to have gone away.
pub(crate) trait Liveness {
    fn is_closed(&self) -> bool;
}

impl Liveness for Client {
    fn is_closed(&self) -> bool { Client::is_closed(self) }
}

/// Shared handle to the current client, swapped for a fresh one when its connection closes.
pub(crate) struct ClientCell<C> {
    current: RwLock<Arc<C>>,
}

impl<C: Liveness> ClientCell<C> {
    pub(crate) fn new(client: C) -> Self { Self { current: RwLock::new(Arc::new(client)) } }

    /// The current client, reopened first if its connection has closed.
    pub(crate) async fn live<O, OFut>(&self, label: &'static str, open: O) -> Result<Arc<C>, StorageError>
    where
        O: FnOnce() -> OFut,
        OFut: Future<Output = Result<C, StorageError>>,
    {
        let client = self.current.read().clone();
        if !client.is_closed() {
            return Ok(client);
        }
        warn!(connection = label, "postgres connection closed; reconnecting");
        let fresh = open().await?;
        let mut cur = self.current.write();
        // Another task may have reconnected while we were opening; keep theirs.
        if Arc::ptr_eq(&*cur, &client) {
            *cur = Arc::new(fresh);
        }
        Ok(cur.clone())
    }
}

/// Run a read once more if it failed transiently, on a reopened client when the
/// connection was lost.
async fn retry_once<C, T, O, OFut, F, Fut>(what: &'static str, cell: &ClientCell<C>, open: O, op: F) -> Result<T, StorageError>
where
    C: Liveness,
    O: Fn() -> OFut,
    OFut: Future<Output = Result<C, StorageError>>,
    F: Fn(Arc<C>) -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    match op(cell.live("reader", &open).await?).await {
        Err(StorageError::Transient(msg)) => {
            warn!(query = what, error = %msg, "transient storage error; retrying once");
            op(cell.live("reader", &open).await?).await
        }
        other => other,
    }
}

fn count(row: &Row, idx: usize) -> Result<u32, StorageError> {
    let v: i32 = row.try_get(idx).map_err(map_pg)?;
    Ok(u32::try_from(v).unwrap_or(0))
}

#[derive(Clone)]
pub struct PgStore {
    url: Arc<str>,
    reader: Arc<ClientCell<Client>>,
    writer: Arc<tokio::sync::Mutex<Client>>,
}

impl PgStore {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let reader = Self::open(url, "reader").await?;
        let writer = Self::open(url, "writer").await?;
        Ok(Self {
            url: Arc::from(url),
            reader: Arc::new(ClientCell::new(reader)),
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
        })
    }

    async fn open(url: &str, label: &'static str) -> Result<Client, StorageError> {
        let (client, connection) = tokio_postgres::connect(url, NoTls).await.map_err(map_pg)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(connection = label, "postgres connection error: {}", e);
            }
        });
        Ok(client)
    }

    async fn reader(&self) -> Result<Arc<Client>, StorageError> {
        self.reader.live("reader", || Self::open(&self.url, "reader")).await
    }

    /// Run a read against the reader, retrying once on a transient failure.
    async fn read<T, F, Fut>(&self, what: &'static str, op: F) -> Result<T, StorageError>
    where
        F: Fn(Arc<Client>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        retry_once(what, &self.reader, || Self::open(&self.url, "reader"), op).await
    }

    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        self.reader().await?.batch_execute(SCHEMA_DDL).await.map_err(map_pg)
    }

    async fn class_id(&self, class_name: &str) -> Result<Option<(ClassId, u32)>, StorageError> {
        let row = self
            .read("class_id", move |c| async move {
                c.query_opt("SELECT id, total_days FROM class WHERE name = $1", &[&class_name]).await.map_err(map_pg)
            })
            .await?;
        match row {
            Some(r) => Ok(Some((r.try_get(0).map_err(map_pg)?, count(&r, 1)?))),
            None => Ok(None),
        }
    }

    async fn query(&self, what: &'static str, sql: &str, id: &str) -> Result<Vec<Row>, StorageError> {
        self.read(what, move |c| async move { c.query(sql, &[&id]).await.map_err(map_pg) }).await
    }
}

impl IdentityStore for PgStore {
    async fn find(&self, role: Role, external_id: &str) -> Result<Option<CredentialRecord>, StorageError> {
        let sql = match role {
            Role::Student => "SELECT password FROM student_users WHERE admnno = $1",
            Role::Teacher => "SELECT password FROM faculty_users WHERE employee_id = $1",
        };
        let rows = self.query("find_credential", sql, external_id).await?;
        match rows.first() {
            Some(r) => Ok(Some(CredentialRecord {
                identity: Identity::new(role, external_id),
                credential_hash: r.try_get(0).map_err(map_pg)?,
            })),
            None => Ok(None),
        }
    }

    async fn insert(&self, role: Role, external_id: &str, credential_hash: &str) -> Result<Identity, StorageError> {
        let sql = match role {
            Role::Student => "INSERT INTO student_users (admnno, password) VALUES ($1, $2)",
            Role::Teacher => "INSERT INTO faculty_users (employee_id, password) VALUES ($1, $2)",
        };
        self.reader().await?.execute(sql, &[&external_id, &credential_hash]).await.map_err(map_pg)?;
        Ok(Identity::new(role, external_id))
    }

    async fn display_name(&self, identity: &Identity) -> Result<Option<String>, StorageError> {
        let sql = match identity.role() {
            Role::Student => "SELECT fname, lname FROM student WHERE admnno = $1",
            Role::Teacher => "SELECT fname, lname FROM teacher WHERE employee_id = $1",
        };
        let rows = self.query("display_name", sql, identity.external_id()).await?;
        match rows.first() {
            Some(r) => {
                let first: String = r.try_get(0).map_err(map_pg)?;
                let last: String = r.try_get(1).map_err(map_pg)?;
                Ok(Some(format!("{first} {last}")))
            }
            None => Ok(None),
        }
    }
}

impl DataStore for PgStore {
    async fn classes_for(&self, identity: &Identity) -> Result<Vec<String>, StorageError> {
        let sql = match identity.role() {
            Role::Student => "SELECT c.name FROM enrollment e JOIN class c ON c.id = e.class_id WHERE e.student_admnno = $1 ORDER BY c.id ASC",
            Role::Teacher => "SELECT c.name FROM staff s JOIN class c ON c.id = s.class_id WHERE s.teacher_id = $1 ORDER BY c.id ASC",
        };
        self.query("classes_for", sql, identity.external_id())
            .await?
            .iter()
            .map(|r| r.try_get(0).map_err(map_pg))
            .collect()
    }

    async fn attendance_for(&self, admnno: &str) -> Result<Vec<AttendanceRecord>, StorageError> {
        let sql = "SELECT c.name, e.attendance, c.total_days FROM enrollment e JOIN class c ON e.class_id = c.id \
                   WHERE e.student_admnno = $1 ORDER BY c.id ASC";
        self.query("attendance_for", sql, admnno)
            .await?
            .iter()
            .map(|r| {
                Ok(AttendanceRecord { class_name: r.try_get(0).map_err(map_pg)?, attendance_count: count(r, 1)?, total_days: count(r, 2)? })
            })
            .collect()
    }

    async fn results_for(&self, admnno: &str, test: TestColumn) -> Result<Vec<ClassScore>, StorageError> {
        // Column comes from the allow-list, never from request text.
        let sql = format!(
            "SELECT c.name, e.{col} FROM enrollment e JOIN class c ON e.class_id = c.id \
             WHERE e.student_admnno = $1 ORDER BY c.id ASC",
            col = test.column_name()
        );
        self.query("results_for", &sql, admnno)
            .await?
            .iter()
            .map(|r| Ok(ClassScore { class_name: r.try_get(0).map_err(map_pg)?, score: r.try_get(1).map_err(map_pg)? }))
            .collect()
    }

    async fn announcements_for(&self, class_name: &str) -> Result<Option<Vec<Announcement>>, StorageError> {
        let Some((class_id, _)) = self.class_id(class_name).await? else { return Ok(None) };
        let rows = self
            .read("announcements_for", move |c| async move {
                c.query("SELECT title, body FROM announcement WHERE class_id = $1 ORDER BY id ASC", &[&class_id])
                    .await
                    .map_err(map_pg)
            })
            .await?;
        rows.iter()
            .map(|r| Ok(Announcement { title: r.try_get(0).map_err(map_pg)?, body: r.try_get(1).map_err(map_pg)? }))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    async fn append_announcement(&self, class_name: &str, title: &str, body: &str) -> Result<(), StorageError> {
        let n = self
            .reader()
            .await?
            .execute(
                "INSERT INTO announcement (class_id, title, body) SELECT id, $2, $3 FROM class WHERE name = $1",
                &[&class_name, &title, &body],
            )
            .await
            .map_err(map_pg)?;
        if n == 0 {
            return Err(StorageError::Permanent(format!("no class named {class_name}")));
        }
        Ok(())
    }

    async fn class_roster(&self, class_name: &str) -> Result<Option<ClassRoster>, StorageError> {
        let Some((class_id, total_days)) = self.class_id(class_name).await? else { return Ok(None) };
        let rows = self
            .read("class_roster", move |c| async move {
                c.query(
                    "SELECT s.admnno, s.fname, s.lname, e.attendance FROM enrollment e \
                     JOIN student s ON s.admnno = e.student_admnno WHERE e.class_id = $1 ORDER BY s.id ASC",
                    &[&class_id],
                )
                .await
                .map_err(map_pg)
            })
            .await?;
        let students = rows
            .iter()
            .map(|r| {
                Ok(RosterEntry {
                    admnno: r.try_get(0).map_err(map_pg)?,
                    first_name: r.try_get(1).map_err(map_pg)?,
                    last_name: r.try_get(2).map_err(map_pg)?,
                    attendance_count: count(r, 3)?,
                    total_days,
                })
            })
            .collect::<Result<Vec<_>, StorageError>>()?;
        Ok(Some(ClassRoster { class_id, class_name: class_name.to_string(), students }))
    }

    async fn class_results(&self, class_name: &str, test: TestColumn) -> Result<Option<Vec<StudentScore>>, StorageError> {
        let Some((class_id, _)) = self.class_id(class_name).await? else { return Ok(None) };
        let sql = format!(
            "SELECT s.admnno, s.fname, s.lname, e.{col} FROM enrollment e \
             JOIN student s ON s.admnno = e.student_admnno WHERE e.class_id = $1 ORDER BY s.id ASC",
            col = test.column_name()
        );
        let sql = sql.as_str();
        let rows = self
            .read("class_results", move |c| async move { c.query(sql, &[&class_id]).await.map_err(map_pg) })
            .await?;
        rows.iter()
            .map(|r| {
                Ok(StudentScore {
                    admnno: r.try_get(0).map_err(map_pg)?,
                    first_name: r.try_get(1).map_err(map_pg)?,
                    last_name: r.try_get(2).map_err(map_pg)?,
                    score: r.try_get(3).map_err(map_pg)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    async fn increment_attendance(&self, class_id: ClassId, student_ids: &BTreeSet<String>) -> Result<(), StorageError> {
        let ids: Vec<&str> = student_ids.iter().map(String::as_str).collect();
        let mut writer = self.writer.lock().await;
        // Reopen a dead writer up front; the batch itself is never retried.
        if writer.is_closed() {
            warn!(connection = "writer", "postgres connection closed; reconnecting");
            *writer = Self::open(&self.url, "writer").await?;
        }
        let tx = writer.transaction().await.map_err(map_pg)?;
        let updated = tx
            .execute(
                "UPDATE enrollment SET attendance = attendance + 1 WHERE class_id = $1 AND student_admnno = ANY($2)",
                &[&class_id, &ids],
            )
            .await
            .map_err(map_pg)?;
        if updated as usize != ids.len() {
            // Dropping `tx` rolls back.
            return Err(StorageError::Permanent(format!(
                "attendance batch matched {updated} of {} students in class {class_id}",
                ids.len()
            )));
        }
        let days = tx
            .execute("UPDATE class SET total_days = total_days + 1 WHERE id = $1", &[&class_id])
            .await
            .map_err(map_pg)?;
        if days != 1 {
            return Err(StorageError::Permanent(format!("no class with id {class_id}")));
        }
        tx.commit().await.map_err(map_pg)?;
        debug!(class_id, students = ids.len(), "attendance.batch committed");
        Ok(())
    }
}
