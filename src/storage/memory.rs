//! Process-local store. All state sits behind one mutex, so every trait call is atomic;
//! the attendance batch is additionally staged on a copy and swapped in only on success.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::{
    Announcement, AttendanceRecord, ClassId, ClassRoster, ClassScore, DataStore, IdentityStore, RosterEntry,
    StudentScore,
};
use crate::error::StorageError;
use crate::identity::{CredentialRecord, Identity, Role};
use crate::navigation::TestColumn;

#[derive(Debug, Clone)]
struct Profile {
    first_name: String,
    last_name: String,
}

#[derive(Debug, Clone)]
struct ClassRow {
    name: String,
    announcements: Vec<Announcement>,
    total_days: u32,
}

#[derive(Debug, Clone)]
struct EnrollmentRow {
    attendance: u32,
    scores: HashMap<TestColumn, i32>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    credentials: HashMap<(Role, String), String>,
    /// Insertion order doubles as the profile id used for roster ordering.
    students: Vec<(String, Profile)>,
    teachers: HashMap<String, Profile>,
    classes: BTreeMap<ClassId, ClassRow>,
    /// (admnno, class id)
    enrollment: BTreeMap<(String, ClassId), EnrollmentRow>,
    /// (employee id, class id)
    staff: BTreeSet<(String, ClassId)>,
    next_class_id: ClassId,
}

impl MemoryState {
    fn class_by_name(&self, name: &str) -> Option<(ClassId, &ClassRow)> {
        self.classes.iter().find(|(_, c)| c.name == name).map(|(id, c)| (*id, c))
    }

    fn student_profile(&self, admnno: &str) -> Option<&Profile> {
        self.students.iter().find(|(id, _)| id == admnno).map(|(_, p)| p)
    }

    /// Students of `class_id` in profile order.
    fn members(&self, class_id: ClassId) -> Vec<(&String, &Profile, &EnrollmentRow)> {
        self.students
            .iter()
            .filter_map(|(admnno, p)| self.enrollment.get(&(admnno.clone(), class_id)).map(|e| (admnno, p, e)))
            .collect()
    }
}

#[derive(Debug, Default)]
struct Faults {
    /// Fail the attendance batch once this many student rows have been staged.
    fail_increment_after: Option<usize>,
    read_delay: Option<Duration>,
    fail_reads: Option<StorageError>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<Mutex<Faults>>,
    results_calls: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn add_student(&self, admnno: &str, first_name: &str, last_name: &str) {
        let mut st = self.state.lock();
        st.students.retain(|(id, _)| id != admnno);
        st.students.push((admnno.to_string(), Profile { first_name: first_name.into(), last_name: last_name.into() }));
    }

    pub fn add_teacher(&self, employee_id: &str, first_name: &str, last_name: &str) {
        self.state
            .lock()
            .teachers
            .insert(employee_id.to_string(), Profile { first_name: first_name.into(), last_name: last_name.into() });
    }

    pub fn add_class(&self, name: &str) -> ClassId {
        let mut st = self.state.lock();
        if let Some((id, _)) = st.class_by_name(name) { return id; }
        st.next_class_id += 1;
        let id = st.next_class_id;
        st.classes.insert(id, ClassRow { name: name.to_string(), announcements: Vec::new(), total_days: 0 });
        id
    }

    pub fn enroll(&self, admnno: &str, class_id: ClassId) {
        self.state
            .lock()
            .enrollment
            .entry((admnno.to_string(), class_id))
            .or_insert_with(|| EnrollmentRow { attendance: 0, scores: HashMap::new() });
    }

    pub fn assign_teacher(&self, employee_id: &str, class_id: ClassId) {
        self.state.lock().staff.insert((employee_id.to_string(), class_id));
    }

    pub fn set_score(&self, admnno: &str, class_id: ClassId, test: TestColumn, score: i32) {
        if let Some(row) = self.state.lock().enrollment.get_mut(&(admnno.to_string(), class_id)) {
            row.scores.insert(test, score);
        }
    }

    pub fn attendance_count(&self, admnno: &str, class_id: ClassId) -> Option<u32> {
        self.state.lock().enrollment.get(&(admnno.to_string(), class_id)).map(|e| e.attendance)
    }

    pub fn total_days(&self, class_id: ClassId) -> Option<u32> {
        self.state.lock().classes.get(&class_id).map(|c| c.total_days)
    }

    pub fn credential_hash(&self, role: Role, external_id: &str) -> Option<String> {
        self.state.lock().credentials.get(&(role, external_id.to_string())).cloned()
    }

    pub fn fail_increment_after(&self, staged_rows: Option<usize>) {
        self.faults.lock().fail_increment_after = staged_rows;
    }

    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.faults.lock().read_delay = delay;
    }

    pub fn fail_reads_with(&self, err: Option<StorageError>) {
        self.faults.lock().fail_reads = err;
    }

    /// How many times `results_for` / `class_results` have been called.
    pub fn results_calls(&self) -> usize { self.results_calls.load(Ordering::SeqCst) }

    async fn before_read(&self) -> Result<(), StorageError> {
        let (delay, fail) = {
            let f = self.faults.lock();
            (f.read_delay, f.fail_reads.clone())
        };
        if let Some(d) = delay { tokio::time::sleep(d).await; }
        match fail {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Small school used when the server runs without a database.
    pub fn seed_demo(&self) {
        let c10a = self.add_class("10A");
        let c10b = self.add_class("10B");
        let c11a = self.add_class("11A");
        for (admnno, first, last) in [("1001", "Asha", "Rao"), ("1002", "Bilal", "Khan"), ("1003", "Chen", "Li"), ("1004", "Dara", "Okafor")] {
            self.add_student(admnno, first, last);
        }
        self.add_teacher("T100", "Meera", "Iyer");
        self.add_teacher("T200", "Jonas", "Berg");
        for admnno in ["1001", "1002", "1003"] { self.enroll(admnno, c10a); }
        for admnno in ["1001", "1004"] { self.enroll(admnno, c10b); }
        self.enroll("1004", c11a);
        self.assign_teacher("T100", c10a);
        self.assign_teacher("T100", c10b);
        self.assign_teacher("T200", c11a);
        for (i, admnno) in ["1001", "1002", "1003"].into_iter().enumerate() {
            self.set_score(admnno, c10a, TestColumn::UnitTest1, 70 + 5 * i as i32);
            self.set_score(admnno, c10a, TestColumn::MidTerm, 60 + 10 * i as i32);
        }
        let mut st = self.state.lock();
        if let Some(c) = st.classes.get_mut(&c10a) {
            c.announcements.push(Announcement { title: "Welcome".into(), body: "Term starts Monday.".into() });
            c.announcements.push(Announcement { title: "Field trip".into(), body: "Permission slips due Friday.".into() });
        }
    }
}

impl IdentityStore for MemoryStore {
    async fn find(&self, role: Role, external_id: &str) -> Result<Option<CredentialRecord>, StorageError> {
        self.before_read().await?;
        let st = self.state.lock();
        Ok(st.credentials.get(&(role, external_id.to_string())).map(|h| CredentialRecord {
            identity: Identity::new(role, external_id),
            credential_hash: h.clone(),
        }))
    }

    async fn insert(&self, role: Role, external_id: &str, credential_hash: &str) -> Result<Identity, StorageError> {
        let mut st = self.state.lock();
        let key = (role, external_id.to_string());
        if st.credentials.contains_key(&key) {
            return Err(StorageError::Conflict);
        }
        st.credentials.insert(key, credential_hash.to_string());
        Ok(Identity::new(role, external_id))
    }

    async fn display_name(&self, identity: &Identity) -> Result<Option<String>, StorageError> {
        self.before_read().await?;
        let st = self.state.lock();
        let profile = match identity {
            Identity::Student { admnno } => st.student_profile(admnno),
            Identity::Teacher { employee_id } => st.teachers.get(employee_id),
        };
        Ok(profile.map(|p| format!("{} {}", p.first_name, p.last_name)))
    }
}

impl DataStore for MemoryStore {
    async fn classes_for(&self, identity: &Identity) -> Result<Vec<String>, StorageError> {
        self.before_read().await?;
        let st = self.state.lock();
        // BTreeMap iteration keeps class id order.
        let names = st
            .classes
            .iter()
            .filter(|(id, _)| match identity {
                Identity::Student { admnno } => st.enrollment.contains_key(&(admnno.clone(), **id)),
                Identity::Teacher { employee_id } => st.staff.contains(&(employee_id.clone(), **id)),
            })
            .map(|(_, c)| c.name.clone())
            .collect();
        Ok(names)
    }

    async fn attendance_for(&self, admnno: &str) -> Result<Vec<AttendanceRecord>, StorageError> {
        self.before_read().await?;
        let st = self.state.lock();
        Ok(st
            .classes
            .iter()
            .filter_map(|(id, c)| {
                st.enrollment.get(&(admnno.to_string(), *id)).map(|e| AttendanceRecord {
                    class_name: c.name.clone(),
                    attendance_count: e.attendance,
                    total_days: c.total_days,
                })
            })
            .collect())
    }

    async fn results_for(&self, admnno: &str, test: TestColumn) -> Result<Vec<ClassScore>, StorageError> {
        self.results_calls.fetch_add(1, Ordering::SeqCst);
        self.before_read().await?;
        let st = self.state.lock();
        Ok(st
            .classes
            .iter()
            .filter_map(|(id, c)| {
                st.enrollment.get(&(admnno.to_string(), *id)).map(|e| ClassScore {
                    class_name: c.name.clone(),
                    score: e.scores.get(&test).copied(),
                })
            })
            .collect())
    }

    async fn announcements_for(&self, class_name: &str) -> Result<Option<Vec<Announcement>>, StorageError> {
        self.before_read().await?;
        let st = self.state.lock();
        Ok(st.class_by_name(class_name).map(|(_, c)| c.announcements.clone()))
    }

    async fn append_announcement(&self, class_name: &str, title: &str, body: &str) -> Result<(), StorageError> {
        let mut st = self.state.lock();
        let Some((id, _)) = st.class_by_name(class_name) else {
            return Err(StorageError::Permanent(format!("no class named {class_name}")));
        };
        if let Some(c) = st.classes.get_mut(&id) {
            c.announcements.push(Announcement { title: title.to_string(), body: body.to_string() });
        }
        Ok(())
    }

    async fn class_roster(&self, class_name: &str) -> Result<Option<ClassRoster>, StorageError> {
        self.before_read().await?;
        let st = self.state.lock();
        let Some((class_id, class)) = st.class_by_name(class_name) else { return Ok(None) };
        let students = st
            .members(class_id)
            .into_iter()
            .map(|(admnno, p, e)| RosterEntry {
                admnno: admnno.clone(),
                first_name: p.first_name.clone(),
                last_name: p.last_name.clone(),
                attendance_count: e.attendance,
                total_days: class.total_days,
            })
            .collect();
        Ok(Some(ClassRoster { class_id, class_name: class.name.clone(), students }))
    }

    async fn class_results(&self, class_name: &str, test: TestColumn) -> Result<Option<Vec<StudentScore>>, StorageError> {
        self.results_calls.fetch_add(1, Ordering::SeqCst);
        self.before_read().await?;
        let st = self.state.lock();
        let Some((class_id, _)) = st.class_by_name(class_name) else { return Ok(None) };
        Ok(Some(
            st.members(class_id)
                .into_iter()
                .map(|(admnno, p, e)| StudentScore {
                    admnno: admnno.clone(),
                    first_name: p.first_name.clone(),
                    last_name: p.last_name.clone(),
                    score: e.scores.get(&test).copied(),
                })
                .collect(),
        ))
    }

    async fn increment_attendance(&self, class_id: ClassId, student_ids: &BTreeSet<String>) -> Result<(), StorageError> {
        let fail_after = self.faults.lock().fail_increment_after;
        let mut st = self.state.lock();
        if !st.classes.contains_key(&class_id) {
            return Err(StorageError::Permanent(format!("no class with id {class_id}")));
        }
        let mut staged: Vec<((String, ClassId), u32)> = Vec::with_capacity(student_ids.len());
        for (n, admnno) in student_ids.iter().enumerate() {
            if fail_after == Some(n) {
                return Err(StorageError::Transient("injected failure mid-batch".into()));
            }
            let key = (admnno.clone(), class_id);
            let Some(row) = st.enrollment.get(&key) else {
                return Err(StorageError::Permanent(format!("student {admnno} is not enrolled in class {class_id}")));
            };
            staged.push((key, row.attendance + 1));
        }
        if fail_after == Some(student_ids.len()) {
            return Err(StorageError::Transient("injected failure before day counter".into()));
        }
        // Commit: nothing above touched the live state.
        for (key, attendance) in staged {
            if let Some(row) = st.enrollment.get_mut(&key) { row.attendance = attendance; }
        }
        if let Some(c) = st.classes.get_mut(&class_id) { c.total_days += 1; }
        debug!(class_id, students = student_ids.len(), "attendance.batch committed");
        Ok(())
    }
}
