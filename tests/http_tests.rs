//! End-to-end tests of the HTTP surface, driven in-process through the axum router.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use classgate::config::PortalConfig;
use classgate::security::{low_cost_params, CredentialVerifier};
use classgate::server::{router, AppState, MAX_BODY_BYTES, SESSION_COOKIE};
use classgate::storage::{DataStore, MemoryStore};

fn app_state() -> (Arc<MemoryStore>, AppState<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    store.seed_demo();
    let cfg = PortalConfig { secure_cookies: false, ..Default::default() };
    let verifier = CredentialVerifier::with_params(store.clone(), low_cost_params());
    (store.clone(), AppState::with_verifier(store, verifier, &cfg))
}

fn app() -> (Arc<MemoryStore>, Router) {
    let (store, state) = app_state();
    (store, router(state))
}

/// Minimal cookie-carrying client.
struct Client {
    app: Router,
    cookie: Option<String>,
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

impl Reply {
    fn location(&self) -> Option<&str> {
        self.headers.get(header::LOCATION).and_then(|v| v.to_str().ok())
    }
}

impl Client {
    fn new(app: &Router) -> Self { Self { app: app.clone(), cookie: None } }

    async fn send(&mut self, method: Method, uri: &str, body: Option<Value>) -> Reply {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(c) = &self.cookie {
            req = req.header(header::COOKIE, format!("{}={}", SESSION_COOKIE, c));
        }
        let req = match body {
            Some(v) => req.header(header::CONTENT_TYPE, "application/json").body(Body::from(v.to_string())).unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let resp = self.app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        if let Some(set) = headers.get(header::SET_COOKIE).and_then(|v| v.to_str().ok()) {
            let value = set.split(';').next().and_then(|kv| kv.split_once('=')).map(|(_, v)| v.to_string());
            self.cookie = value.filter(|v| v != "deleted");
        }
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        Reply { status, headers, body }
    }

    async fn get(&mut self, uri: &str) -> Reply { self.send(Method::GET, uri, None).await }

    async fn post(&mut self, uri: &str, body: Value) -> Reply { self.send(Method::POST, uri, Some(body)).await }

    async fn register(&mut self, role: &str, id: &str, password: &str) -> Reply {
        self.post(&format!("/register/{role}"), json!({"id": id, "password": password})).await
    }
}

#[tokio::test]
async fn register_lands_on_home_with_fresh_session() {
    let (_store, app) = app();
    let mut c = Client::new(&app);
    let form = c.get("/login/student").await;
    assert_eq!(form.status, StatusCode::OK);
    assert_eq!(form.body["view"]["id_field"], "admnno");
    assert!(form.headers.get(header::SET_COOKIE).is_none());

    // A stale cookie from an earlier visit is replaced, not adopted.
    c.cookie = Some("stale-id".into());
    let r = c.register("student", "1001", "pw1").await;
    assert_eq!(r.status, StatusCode::SEE_OTHER);
    assert_eq!(r.location(), Some("/student/home"));
    assert!(c.cookie.as_deref().is_some_and(|sid| sid != "stale-id"));

    let home = c.get("/student/home").await;
    assert_eq!(home.status, StatusCode::OK);
    assert_eq!(home.body["view"]["display_name"], "Asha Rao");
    assert_eq!(home.body["view"]["classes"], json!(["10A", "10B"]));
}

#[tokio::test]
async fn anonymous_traffic_does_not_grow_session_table() {
    let (_store, state) = app_state();
    let sessions = state.sessions.clone();
    let app = router(state);
    for i in 0..500 {
        let mut c = Client::new(&app);
        assert_eq!(c.get("/login/student").await.status, StatusCode::OK);
        assert_eq!(c.get("/register/teacher").await.status, StatusCode::OK);
        c.cookie = Some(format!("junk{i}"));
        assert_eq!(c.get("/student/home").await.location(), Some("/login/student"));
        c.post("/login/student", json!({"admnno": "1001", "password": "nope"})).await;
    }
    assert_eq!(sessions.len(), 0);

    let mut c = Client::new(&app);
    c.register("student", "1001", "pw1").await;
    assert_eq!(sessions.len(), 1);
    c.get("/logout/student").await;
    assert_eq!(sessions.len(), 0);
}

#[tokio::test]
async fn protected_routes_redirect_to_login() {
    let (_store, app) = app();
    let mut c = Client::new(&app);
    let r = c.get("/teacher/class/attendance").await;
    assert_eq!(r.status, StatusCode::SEE_OTHER);
    assert_eq!(r.location(), Some("/login/teacher"));

    // A forged id is never adopted.
    c.cookie = Some("forged-session-id".into());
    let r = c.get("/student/home").await;
    assert_eq!(r.location(), Some("/login/student"));
}

#[tokio::test]
async fn bad_password_reprompts_and_stays_anonymous() {
    let (_store, app) = app();
    let mut c = Client::new(&app);
    c.register("student", "1001", "pw1").await;
    c.get("/logout/student").await;
    assert!(c.cookie.is_none());

    c.get("/login/student").await;
    let r = c.post("/login/student", json!({"admnno": "1001", "password": "wrong"})).await;
    assert_eq!(r.location(), Some("/login/student"));
    let r = c.get("/student/home").await;
    assert_eq!(r.location(), Some("/login/student"));

    let r = c.post("/login/student", json!({"admnno": "1001", "password": "pw1"})).await;
    assert_eq!(r.location(), Some("/student/home"));
    assert_eq!(c.get("/student/home").await.status, StatusCode::OK);
}

#[tokio::test]
async fn duplicate_registration_redirects_to_login() {
    let (_store, app) = app();
    let mut a = Client::new(&app);
    a.register("teacher", "T100", "pw").await;
    let mut b = Client::new(&app);
    let r = b.register("teacher", "T100", "other").await;
    assert_eq!(r.location(), Some("/login/teacher"));
}

#[tokio::test]
async fn student_session_cannot_use_teacher_routes() {
    let (_store, app) = app();
    let mut c = Client::new(&app);
    c.register("student", "1001", "pw1").await;
    let r = c.get("/teacher/home").await;
    assert_eq!(r.location(), Some("/login/teacher"));
}

#[tokio::test]
async fn teacher_drill_down_and_attendance() {
    let (store, app) = app();
    let mut c = Client::new(&app);
    c.register("teacher", "T100", "pw").await;

    let r = c.get("/teacher/class/attendance").await;
    assert_eq!(r.location(), Some("/teacher/classes?view=attendance"));
    let listing = c.get("/teacher/classes?view=attendance").await;
    assert_eq!(listing.body["view"]["classes"], json!(["10A", "10B"]));

    let r = c.post("/teacher/class", json!({"class_name": "10A", "view": "attendance"})).await;
    assert_eq!(r.location(), Some("/teacher/class/attendance"));
    let roster = c.get("/teacher/class/attendance").await;
    assert_eq!(roster.status, StatusCode::OK);
    assert_eq!(roster.body["view"]["students"].as_array().map(Vec::len), Some(3));

    let results = c.get("/teacher/class/results").await;
    assert_eq!(results.status, StatusCode::OK);
    assert_eq!(results.body["view"]["students"], Value::Null);

    let r = c.post("/teacher/class/attendance", json!({"present": ["1001", "1002", "1001"]})).await;
    assert_eq!(r.status, StatusCode::OK);
    assert_eq!(r.body["view"]["marked"], 2);
    let class_id = store.class_roster("10A").await.unwrap().unwrap().class_id;
    assert_eq!(store.attendance_count("1001", class_id), Some(1));
    assert_eq!(store.attendance_count("1003", class_id), Some(0));
    assert_eq!(store.total_days(class_id), Some(1));
}

#[tokio::test]
async fn unknown_test_is_rejected_before_storage() {
    let (store, app) = app();
    let mut c = Client::new(&app);
    c.register("student", "1001", "pw1").await;
    let r = c.post("/student/test", json!({"test": "mid_term; DROP TABLE student"})).await;
    assert_eq!(r.status, StatusCode::BAD_REQUEST);
    assert_eq!(r.body["code"], "unknown_test_column");
    let view = c.get("/student/results").await;
    assert_eq!(view.body["view"]["grades"], Value::Null);
    assert_eq!(store.results_calls(), 0);

    let r = c.post("/student/test", json!({"test": "Mid_Term"})).await;
    assert_eq!(r.location(), Some("/student/results"));
    let view = c.get("/student/results").await;
    assert_eq!(view.body["view"]["test"], "mid_term");
    assert_eq!(view.body["view"]["grades"][0]["score"], 60);
    assert_eq!(store.results_calls(), 1);
}

#[tokio::test]
async fn announcement_index_is_one_shot() {
    let (_store, app) = app();
    let mut c = Client::new(&app);
    c.register("student", "1001", "pw1").await;
    c.post("/student/class", json!({"class_name": "10A"})).await;
    let list = c.get("/student/class/announcements").await;
    assert_eq!(list.body["view"]["announcements"].as_array().map(Vec::len), Some(2));

    let r = c.post("/student/announcement", json!({"index": 1})).await;
    assert_eq!(r.location(), Some("/student/announcement"));
    let a = c.get("/student/announcement").await;
    assert_eq!(a.body["view"]["announcement"]["title"], "Field trip");
    let again = c.get("/student/announcement").await;
    assert_eq!(again.location(), Some("/student/class/announcements"));
}

#[tokio::test]
async fn teacher_posts_announcement() {
    let (store, app) = app();
    let mut c = Client::new(&app);
    c.register("teacher", "T200", "pw").await;
    c.post("/teacher/class", json!({"class_name": "11A", "view": "announcements"})).await;
    let r = c.post("/teacher/class/announcements", json!({"title": "Lab", "body": "Bring goggles"})).await;
    assert_eq!(r.location(), Some("/teacher/class/announcements"));
    let r = c.post("/teacher/class/announcements", json!({"title": "  "})).await;
    assert_eq!(r.status, StatusCode::BAD_REQUEST);
    let posted = store.announcements_for("11A").await.unwrap().unwrap();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].title, "Lab");
}

#[tokio::test]
async fn oversized_body_and_unknown_role_are_refused() {
    let (_store, app) = app();
    let mut c = Client::new(&app);
    let big = "x".repeat(MAX_BODY_BYTES + 1);
    let r = c.post("/login/student", json!({"id": "1001", "password": big})).await;
    assert_eq!(r.status, StatusCode::PAYLOAD_TOO_LARGE);
    let r = c.get("/login/admin").await;
    assert_eq!(r.status, StatusCode::NOT_FOUND);
}
