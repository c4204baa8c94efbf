//! Drill-down navigation over the demo school: class selection, one-shot selections
//! under concurrency, and attendance batches.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use classgate::error::{ContextError, PortalError, StorageError};
use classgate::identity::{Identity, Role, SessionContextStore};
use classgate::navigation::{DetailKind, NavState, NavigationStateMachine, TestColumn};
use classgate::storage::{DataStore, MemoryStore};

fn demo() -> (Arc<SessionContextStore>, Arc<MemoryStore>, NavigationStateMachine<MemoryStore>) {
    let sessions = Arc::new(SessionContextStore::default());
    let store = Arc::new(MemoryStore::new());
    store.seed_demo();
    let nav = NavigationStateMachine::new(sessions.clone(), store.clone(), Duration::from_secs(1));
    (sessions, store, nav)
}

fn signed_in(sessions: &SessionContextStore, role: Role, id: &str) -> String {
    let sid = sessions.issue();
    sessions.bind_identity(&sid, Identity::new(role, id));
    sid
}

#[tokio::test]
async fn teacher_attendance_then_results_without_test() {
    let (sessions, _store, nav) = demo();
    let sid = signed_in(&sessions, Role::Teacher, "T100");

    let listing = nav.class_listing(&sid, Role::Teacher, DetailKind::Attendance).await.unwrap();
    assert_eq!(listing.classes, vec!["10A".to_string(), "10B".to_string()]);

    nav.select_class(&sid, Role::Teacher, "10A").unwrap();
    let roster = nav.class_roster(&sid).await.unwrap();
    assert_eq!(roster.class_name, "10A");
    let ids: Vec<_> = roster.students.iter().map(|s| s.admnno.as_str()).collect();
    assert_eq!(ids, ["1001", "1002", "1003"]);
    assert_eq!(nav.state(&sid), NavState::ClassDetail(DetailKind::Attendance));

    let results = nav.class_results(&sid).await.unwrap();
    assert_eq!(results.class_name, "10A");
    assert_eq!(results.test, None);
    assert_eq!(results.students, None);
}

#[tokio::test]
async fn unknown_class_in_session_redirects_to_listing() {
    let (sessions, _store, nav) = demo();
    let sid = signed_in(&sessions, Role::Teacher, "T100");
    nav.select_class(&sid, Role::Teacher, "99Z").unwrap();
    assert_eq!(nav.class_roster(&sid).await, Err(ContextError::MissingSelection.into()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_announcement_reads_deliver_once() {
    let (sessions, store, nav) = demo();
    let sid = signed_in(&sessions, Role::Student, "1001");
    nav.select_class(&sid, Role::Student, "10A").unwrap();
    store.set_read_delay(Some(Duration::from_millis(20)));

    for _ in 0..10 {
        nav.select_announcement(&sid, Role::Student, 1).unwrap();
        let (a, b) = futures::join!(nav.announcement(&sid, Role::Student), nav.announcement(&sid, Role::Student));
        let delivered: Vec<_> = [a, b].into_iter().filter_map(Result::ok).collect();
        assert_eq!(delivered.len(), 1, "exactly one reader gets the selection");
        assert_eq!(delivered[0].announcement.title, "Field trip");
    }
}

#[tokio::test]
async fn failed_fetch_keeps_test_selection() {
    let (sessions, store, nav) = demo();
    let sid = signed_in(&sessions, Role::Student, "1002");
    nav.select_test(&sid, Role::Student, "unit_test_1").unwrap();

    store.fail_reads_with(Some(StorageError::Transient("connection reset".into())));
    let err = nav.student_results(&sid).await.unwrap_err();
    assert_eq!(err, PortalError::Storage(StorageError::Transient("connection reset".into())));

    store.fail_reads_with(None);
    let view = nav.student_results(&sid).await.unwrap();
    assert_eq!(view.test, Some(TestColumn::UnitTest1));
    let grades = view.grades.unwrap();
    assert_eq!(grades.iter().find(|g| g.class_name == "10A").and_then(|g| g.score), Some(75));
}

#[tokio::test]
async fn attendance_batches_accumulate() {
    let (sessions, store, nav) = demo();
    let sid = signed_in(&sessions, Role::Teacher, "T100");
    nav.select_class(&sid, Role::Teacher, "10A").unwrap();
    let class_id = store.class_roster("10A").await.unwrap().unwrap().class_id;

    let day1: BTreeSet<String> = ["1001", "1003"].into_iter().map(String::from).collect();
    let day2: BTreeSet<String> = BTreeSet::new();
    nav.record_attendance(&sid, &day1).await.unwrap();
    nav.record_attendance(&sid, &day2).await.unwrap();

    let student = signed_in(&sessions, Role::Student, "1001");
    let records = nav.student_attendance(&student).await.unwrap();
    let ten_a = records.iter().find(|r| r.class_name == "10A").unwrap();
    assert_eq!((ten_a.attendance_count, ten_a.total_days), (1, 2));
    assert_eq!(store.attendance_count("1002", class_id), Some(0));
}

#[tokio::test]
async fn batch_with_unenrolled_student_changes_nothing() {
    let (sessions, store, nav) = demo();
    let sid = signed_in(&sessions, Role::Teacher, "T100");
    nav.select_class(&sid, Role::Teacher, "10A").unwrap();
    let class_id = store.class_roster("10A").await.unwrap().unwrap().class_id;

    let present: BTreeSet<String> = ["1001", "1004"].into_iter().map(String::from).collect();
    let err = nav.record_attendance(&sid, &present).await.unwrap_err();
    assert!(matches!(err, PortalError::Storage(StorageError::Permanent(_))));
    assert_eq!(store.attendance_count("1001", class_id), Some(0));
    assert_eq!(store.total_days(class_id), Some(0));
}
