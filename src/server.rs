//!
//! classgate HTTP server
//! ----------------------
//! Axum-based JSON surface over the portal core.
//!
//! Responsibilities:
//! - Cookie transport for the session id (`classgate_session`); ids unknown to the store
//!   are never adopted.
//! - Login/registration per role, with the session regenerated on success.
//! - The student and teacher route trees, each tagged with its role, delegating every
//!   protected call to the navigation state machine.
//! - Boundary recovery: authentication and missing-selection failures become 303
//!   redirects to the right entry view; everything else maps to a status code.
//! - Background sweep of idle sessions.

use std::collections::BTreeSet;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use futures_util::FutureExt; // for catch_unwind on async blocks
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, error, info};

use crate::config::PortalConfig;
use crate::error::{ContextError, PortalError, PortalResult, StorageError};
use crate::identity::{LocalAuthProvider, LoginRequest, Role, SessionContextStore, SessionId};
use crate::navigation::{DetailKind, NavigationStateMachine};
use crate::security::CredentialVerifier;
use crate::storage::PortalStore;

pub const SESSION_COOKIE: &str = "classgate_session";
pub const MAX_BODY_BYTES: usize = 64 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SWEEP_INTERVAL_MAX: Duration = Duration::from_secs(60);

/// Shared server state injected into all handlers.
pub struct AppState<S> {
    pub sessions: Arc<SessionContextStore>,
    pub store: Arc<S>,
    pub auth: LocalAuthProvider<S>,
    pub nav: NavigationStateMachine<S>,
    pub secure_cookies: bool,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
            store: self.store.clone(),
            auth: self.auth.clone(),
            nav: self.nav.clone(),
            secure_cookies: self.secure_cookies,
        }
    }
}

impl<S: PortalStore> AppState<S> {
    pub fn new(store: Arc<S>, cfg: &PortalConfig) -> Self {
        Self::with_verifier(store.clone(), CredentialVerifier::new(store), cfg)
    }

    /// State with a caller-supplied verifier (e.g. cheaper hashing parameters).
    pub fn with_verifier(store: Arc<S>, verifier: CredentialVerifier<S>, cfg: &PortalConfig) -> Self {
        let sessions = Arc::new(SessionContextStore::new(cfg.session_ttl));
        Self {
            auth: LocalAuthProvider::new(verifier, sessions.clone()),
            nav: NavigationStateMachine::new(sessions.clone(), store.clone(), cfg.fetch_timeout),
            sessions,
            store,
            secure_cookies: cfg.secure_cookies,
        }
    }
}

/// Start the HTTP server on the configured address and serve until the listener fails.
pub async fn run_with_config<S: PortalStore>(store: Arc<S>, cfg: PortalConfig) -> anyhow::Result<()> {
    let state = AppState::new(store, &cfg);
    spawn_session_sweeper(state.sessions.clone());

    let app = router(state);
    let addr: SocketAddr = format!("{}:{}", cfg.bind_addr, cfg.http_port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cfg.bind_addr, cfg.http_port))?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("While binding {}", addr))?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Periodically drop idle sessions.
fn spawn_session_sweeper(sessions: Arc<SessionContextStore>) {
    let every = (sessions.ttl() / 2).clamp(Duration::from_secs(1), SWEEP_INTERVAL_MAX);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            let removed = sessions.sweep_expired();
            if removed > 0 { debug!(removed = removed, live = sessions.len(), "session_sweep"); }
        }
    });
}

pub fn router<S: PortalStore>(state: AppState<S>) -> Router {
    Router::new()
        .route("/", get(|| async { "classgate ok" }))
        .route("/login/{role}", get(login_form).post(login::<S>))
        .route("/register/{role}", get(register_form).post(register::<S>))
        .route("/logout/{role}", get(logout::<S>).post(logout::<S>))
        .nest("/student", role_routes::<S>(Role::Student))
        .nest("/teacher", role_routes::<S>(Role::Teacher))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, REQUEST_TIMEOUT))
}

fn role_routes<S: PortalStore>(role: Role) -> Router<AppState<S>> {
    let common = Router::new()
        .route("/home", get(home::<S>))
        .route("/classes", get(classes::<S>))
        .route("/class", post(select_class::<S>))
        .route("/announcement", get(announcement::<S>).post(select_announcement::<S>))
        .route("/test", post(select_test::<S>));
    let specific = match role {
        Role::Student => common
            .route("/class/announcements", get(class_announcements::<S>))
            .route("/attendance", get(student_attendance::<S>))
            .route("/results", get(student_results::<S>)),
        Role::Teacher => common
            .route("/class/announcements", get(class_announcements::<S>).post(post_announcement::<S>))
            .route("/class/attendance", get(class_roster::<S>).post(record_attendance::<S>))
            .route("/class/results", get(class_results::<S>)),
    };
    specific.layer(Extension(role))
}

// ---- paths ----

pub fn login_path(role: Role) -> String { format!("/login/{}", role) }

pub fn home_path(role: Role) -> String { format!("/{}/home", role) }

/// Where a session lands when a class drill-down has nothing selected.
pub fn listing_path(role: Role, kind: DetailKind) -> String {
    match role {
        Role::Student => home_path(role),
        Role::Teacher => format!("/teacher/classes?view={}", kind),
    }
}

fn class_detail_path(role: Role, kind: DetailKind) -> String {
    match role {
        Role::Student => "/student/class/announcements".to_string(),
        Role::Teacher => format!("/teacher/class/{}", kind),
    }
}

fn results_path(role: Role) -> String {
    match role {
        Role::Student => "/student/results".to_string(),
        Role::Teacher => "/teacher/class/results".to_string(),
    }
}

// ---- cookie transport ----

pub fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let s = headers.get(header::COOKIE)?.to_str().ok()?;
    for part in s.split(';') {
        let p = part.trim();
        if let Some((k, v)) = p.split_once('=') {
            if k == name { return Some(v.to_string()); }
        }
    }
    None
}

fn session_cookie(sid: &str, secure: bool) -> String {
    let secure = if secure { "; Secure" } else { "" };
    format!("{}={}; HttpOnly; SameSite=Strict; Path=/{}", SESSION_COOKIE, sid, secure)
}

fn clear_session_cookie(secure: bool) -> String {
    let secure = if secure { "; Secure" } else { "" };
    format!("{}=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; SameSite=Strict; Path=/{}", SESSION_COOKIE, secure)
}

/// The cookie's session id, provided the store knows it.
fn current_session<S>(state: &AppState<S>, headers: &HeaderMap) -> Option<SessionId> {
    parse_cookie(headers, SESSION_COOKIE).filter(|sid| state.sessions.contains(sid))
}

// ---- responses ----

#[derive(Serialize)]
struct Envelope<T> {
    status: &'static str,
    view: T,
}

fn ok_view<T: Serialize>(view: T) -> Response {
    Json(Envelope { status: "ok", view }).into_response()
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    status: &'static str,
    code: &'static str,
    message: &'a str,
}

fn error_body(status: StatusCode, code: &'static str, message: &str) -> Response {
    (status, Json(ErrorBody { status: "error", code, message })).into_response()
}

/// Map a core error onto the wire. Auth failures re-enter the login flow, a missing
/// selection goes back to `listing`, the rest become plain error responses.
fn reject(role: Role, err: PortalError, listing: &str) -> Response {
    match &err {
        PortalError::Auth(e) => {
            debug!(role = %role, error = %e, "redirecting to login");
            Redirect::to(&login_path(role)).into_response()
        }
        PortalError::Context(ContextError::MissingSelection) => Redirect::to(listing).into_response(),
        PortalError::Storage(StorageError::Permanent(msg)) => {
            error!(role = %role, "storage failure: {}", msg);
            error_body(StatusCode::INTERNAL_SERVER_ERROR, err.code_str(), "internal server error")
        }
        _ => {
            let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            error_body(status, err.code_str(), &err.to_string())
        }
    }
}

fn unauthenticated(role: Role) -> Response {
    Redirect::to(&login_path(role)).into_response()
}

/// Await a portal call, turning panics into a 500 without taking the server task down.
async fn guarded<T>(what: &'static str, fut: impl Future<Output = PortalResult<T>>) -> Result<PortalResult<T>, Response> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(res) => Ok(res),
        Err(panic_payload) => {
            let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() { *s }
                      else if let Some(s) = panic_payload.downcast_ref::<String>() { s.as_str() }
                      else { "panic" };
            error!(target: "panic", "HTTP {} panic: {}", what, msg);
            Err(error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal_panic", "internal server error"))
        }
    }
}

async fn respond<T: Serialize>(what: &'static str, role: Role, listing: &str, fut: impl Future<Output = PortalResult<T>>) -> Response {
    match guarded(what, fut).await {
        Ok(Ok(view)) => ok_view(view),
        Ok(Err(e)) => reject(role, e, listing),
        Err(resp) => resp,
    }
}

fn redirect_or_reject(role: Role, res: PortalResult<()>, next: &str, listing: &str) -> Response {
    match res {
        Ok(()) => Redirect::to(next).into_response(),
        Err(e) => reject(role, e, listing),
    }
}

fn parse_role(raw: &str) -> Result<Role, Response> {
    raw.parse::<Role>().map_err(|_| error_body(StatusCode::NOT_FOUND, "unknown_role", "no such portal"))
}

// ---- login / registration ----

#[derive(Debug, Deserialize)]
struct CredentialsPayload {
    #[serde(alias = "admnno", alias = "employee_id")]
    id: String,
    password: String,
}

#[derive(Serialize)]
struct CredentialForm {
    role: Role,
    action: String,
    id_field: &'static str,
    fields: [&'static str; 2],
}

/// The login/registration form. No session is minted here; one is issued only when
/// the credentials are accepted.
fn credential_form(role: Role, action: String) -> Response {
    ok_view(CredentialForm { role, action, id_field: role.id_label(), fields: [role.id_label(), "password"] })
}

async fn login_form(Path(role): Path<String>) -> Response {
    match parse_role(&role) {
        Ok(role) => credential_form(role, login_path(role)),
        Err(resp) => resp,
    }
}

async fn register_form(Path(role): Path<String>) -> Response {
    match parse_role(&role) {
        Ok(role) => credential_form(role, format!("/register/{}", role)),
        Err(resp) => resp,
    }
}

#[derive(Clone, Copy)]
enum CredentialAction {
    Login,
    Register,
}

async fn authenticate<S: PortalStore>(
    state: AppState<S>,
    role: String,
    headers: HeaderMap,
    payload: CredentialsPayload,
    action: CredentialAction,
) -> Response {
    let role = match parse_role(&role) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let current = current_session(&state, &headers);
    let req = LoginRequest { role, external_id: payload.id, password: payload.password };
    let fut = async {
        match action {
            CredentialAction::Login => state.auth.login(current.as_deref(), &req).await,
            CredentialAction::Register => state.auth.register(current.as_deref(), &req).await,
        }
    };
    match guarded("authenticate", fut).await {
        Ok(Ok(resp)) => (
            [(header::SET_COOKIE, session_cookie(&resp.session_id, state.secure_cookies))],
            Redirect::to(&home_path(role)),
        )
            .into_response(),
        Ok(Err(e)) => reject(role, e, &login_path(role)),
        Err(resp) => resp,
    }
}

async fn login<S: PortalStore>(
    State(state): State<AppState<S>>,
    Path(role): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<CredentialsPayload>,
) -> Response {
    authenticate(state, role, headers, payload, CredentialAction::Login).await
}

async fn register<S: PortalStore>(
    State(state): State<AppState<S>>,
    Path(role): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<CredentialsPayload>,
) -> Response {
    authenticate(state, role, headers, payload, CredentialAction::Register).await
}

async fn logout<S: PortalStore>(State(state): State<AppState<S>>, Path(role): Path<String>, headers: HeaderMap) -> Response {
    let role = match parse_role(&role) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if let Some(sid) = current_session(&state, &headers) {
        state.nav.logout(&sid);
    }
    (
        [(header::SET_COOKIE, clear_session_cookie(state.secure_cookies))],
        Redirect::to(&login_path(role)),
    )
        .into_response()
}

// ---- navigation ----

async fn home<S: PortalStore>(State(state): State<AppState<S>>, Extension(role): Extension<Role>, headers: HeaderMap) -> Response {
    let Some(sid) = current_session(&state, &headers) else { return unauthenticated(role) };
    respond("home", role, &home_path(role), state.nav.home(&sid, role, state.store.as_ref())).await
}

#[derive(Debug, Deserialize)]
struct ClassesQuery {
    view: Option<String>,
}

async fn classes<S: PortalStore>(
    State(state): State<AppState<S>>,
    Extension(role): Extension<Role>,
    headers: HeaderMap,
    Query(q): Query<ClassesQuery>,
) -> Response {
    let Some(sid) = current_session(&state, &headers) else { return unauthenticated(role) };
    let kind = match q.view.as_deref().map(str::parse::<DetailKind>) {
        None => DetailKind::Announcements,
        Some(Ok(k)) => k,
        Some(Err(())) => return error_body(StatusCode::BAD_REQUEST, "bad_input", "view must be announcements, attendance or results"),
    };
    respond("classes", role, &home_path(role), state.nav.class_listing(&sid, role, kind)).await
}

#[derive(Debug, Deserialize)]
struct SelectClassPayload {
    class_name: String,
    #[serde(default)]
    view: Option<DetailKind>,
}

async fn select_class<S: PortalStore>(
    State(state): State<AppState<S>>,
    Extension(role): Extension<Role>,
    headers: HeaderMap,
    Json(payload): Json<SelectClassPayload>,
) -> Response {
    let Some(sid) = current_session(&state, &headers) else { return unauthenticated(role) };
    let kind = payload.view.unwrap_or(DetailKind::Announcements);
    let res = state.nav.select_class(&sid, role, &payload.class_name);
    redirect_or_reject(role, res, &class_detail_path(role, kind), &listing_path(role, kind))
}

async fn class_announcements<S: PortalStore>(
    State(state): State<AppState<S>>,
    Extension(role): Extension<Role>,
    headers: HeaderMap,
) -> Response {
    let Some(sid) = current_session(&state, &headers) else { return unauthenticated(role) };
    let listing = listing_path(role, DetailKind::Announcements);
    respond("class_announcements", role, &listing, state.nav.class_announcements(&sid, role)).await
}

#[derive(Debug, Deserialize)]
struct SelectAnnouncementPayload {
    index: usize,
}

async fn select_announcement<S: PortalStore>(
    State(state): State<AppState<S>>,
    Extension(role): Extension<Role>,
    headers: HeaderMap,
    Json(payload): Json<SelectAnnouncementPayload>,
) -> Response {
    let Some(sid) = current_session(&state, &headers) else { return unauthenticated(role) };
    let res = state.nav.select_announcement(&sid, role, payload.index);
    let listing = class_detail_path(role, DetailKind::Announcements);
    redirect_or_reject(role, res, &format!("/{}/announcement", role), &listing)
}

async fn announcement<S: PortalStore>(State(state): State<AppState<S>>, Extension(role): Extension<Role>, headers: HeaderMap) -> Response {
    let Some(sid) = current_session(&state, &headers) else { return unauthenticated(role) };
    let listing = class_detail_path(role, DetailKind::Announcements);
    respond("announcement", role, &listing, state.nav.announcement(&sid, role)).await
}

#[derive(Debug, Deserialize)]
struct SelectTestPayload {
    test: String,
}

async fn select_test<S: PortalStore>(
    State(state): State<AppState<S>>,
    Extension(role): Extension<Role>,
    headers: HeaderMap,
    Json(payload): Json<SelectTestPayload>,
) -> Response {
    let Some(sid) = current_session(&state, &headers) else { return unauthenticated(role) };
    let res = state.nav.select_test(&sid, role, &payload.test).map(|_| ());
    redirect_or_reject(role, res, &results_path(role), &listing_path(role, DetailKind::Results))
}

async fn student_attendance<S: PortalStore>(State(state): State<AppState<S>>, headers: HeaderMap) -> Response {
    let role = Role::Student;
    let Some(sid) = current_session(&state, &headers) else { return unauthenticated(role) };
    respond("student_attendance", role, &home_path(role), state.nav.student_attendance(&sid)).await
}

async fn student_results<S: PortalStore>(State(state): State<AppState<S>>, headers: HeaderMap) -> Response {
    let role = Role::Student;
    let Some(sid) = current_session(&state, &headers) else { return unauthenticated(role) };
    respond("student_results", role, &home_path(role), state.nav.student_results(&sid)).await
}

async fn class_roster<S: PortalStore>(State(state): State<AppState<S>>, headers: HeaderMap) -> Response {
    let role = Role::Teacher;
    let Some(sid) = current_session(&state, &headers) else { return unauthenticated(role) };
    let listing = listing_path(role, DetailKind::Attendance);
    respond("class_roster", role, &listing, state.nav.class_roster(&sid)).await
}

#[derive(Debug, Deserialize)]
struct AttendancePayload {
    present: Vec<String>,
}

#[derive(Serialize)]
struct AttendanceRecorded {
    marked: usize,
}

async fn record_attendance<S: PortalStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Json(payload): Json<AttendancePayload>,
) -> Response {
    let role = Role::Teacher;
    let Some(sid) = current_session(&state, &headers) else { return unauthenticated(role) };
    // Duplicate ids in the payload count once.
    let present: BTreeSet<String> = payload.present.into_iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
    let listing = listing_path(role, DetailKind::Attendance);
    let fut = async { state.nav.record_attendance(&sid, &present).await.map(|marked| AttendanceRecorded { marked }) };
    respond("record_attendance", role, &listing, fut).await
}

async fn class_results<S: PortalStore>(State(state): State<AppState<S>>, headers: HeaderMap) -> Response {
    let role = Role::Teacher;
    let Some(sid) = current_session(&state, &headers) else { return unauthenticated(role) };
    let listing = listing_path(role, DetailKind::Results);
    respond("class_results", role, &listing, state.nav.class_results(&sid)).await
}

#[derive(Debug, Deserialize)]
struct AnnouncementPayload {
    title: String,
    #[serde(default)]
    body: String,
}

async fn post_announcement<S: PortalStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Json(payload): Json<AnnouncementPayload>,
) -> Response {
    let role = Role::Teacher;
    let Some(sid) = current_session(&state, &headers) else { return unauthenticated(role) };
    let listing = listing_path(role, DetailKind::Announcements);
    match guarded("post_announcement", state.nav.post_announcement(&sid, &payload.title, &payload.body)).await {
        Ok(res) => redirect_or_reject(role, res, &class_detail_path(role, DetailKind::Announcements), &listing),
        Err(resp) => resp,
    }
}
