use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::views::{
    AnnouncementView, ClassAnnouncementsView, ClassListingView, ClassResultsView, HomeView, StudentResultsView,
};
use super::{DetailKind, NavState, TestColumn};
use crate::error::{ContextError, PortalResult, StorageError, ValidationError};
use crate::identity::{AuthorizationGate, Identity, Role, Selection, SelectionField, SessionContextStore};
use crate::storage::{AttendanceRecord, ClassRoster, DataStore, IdentityStore};

pub struct NavigationStateMachine<D> {
    sessions: Arc<SessionContextStore>,
    gate: AuthorizationGate,
    data: Arc<D>,
    fetch_timeout: Duration,
}

impl<D> Clone for NavigationStateMachine<D> {
    fn clone(&self) -> Self {
        Self { sessions: self.sessions.clone(), gate: self.gate.clone(), data: self.data.clone(), fetch_timeout: self.fetch_timeout }
    }
}

impl<D: DataStore> NavigationStateMachine<D> {
    pub fn new(sessions: Arc<SessionContextStore>, data: Arc<D>, fetch_timeout: Duration) -> Self {
        let gate = AuthorizationGate::new(sessions.clone());
        Self { sessions, gate, data, fetch_timeout }
    }

    pub fn gate(&self) -> &AuthorizationGate { &self.gate }

    /// Current state of a live session; unknown ids read as `Home`.
    pub fn state(&self, session_id: &str) -> NavState {
        self.sessions.snapshot(session_id).map(|s| s.state).unwrap_or(NavState::Home)
    }

    /// Bound a data call by the fetch timeout; elapsing is a transient storage failure.
    async fn fetch<T>(&self, what: &'static str, fut: impl Future<Output = Result<T, StorageError>>) -> Result<T, StorageError> {
        match tokio::time::timeout(self.fetch_timeout, fut).await {
            Ok(res) => res,
            Err(_) => {
                warn!(query = what, timeout_ms = self.fetch_timeout.as_millis() as u64, "data fetch timed out");
                Err(StorageError::Transient(format!("{what} timed out")))
            }
        }
    }

    fn selected_class(&self, session_id: &str) -> Result<String, ContextError> {
        self.sessions.class_name(session_id).ok_or(ContextError::MissingSelection)
    }

    // ---- selection transitions ----

    pub fn select_class(&self, session_id: &str, role: Role, class_name: &str) -> PortalResult<()> {
        self.gate.require(session_id, role)?;
        let name = class_name.trim();
        if name.is_empty() {
            return Err(ValidationError::BlankClassName.into());
        }
        self.sessions.set_selection(session_id, Selection::ClassName(name.to_string()));
        self.sessions.set_state(session_id, NavState::ClassListing);
        debug!(session = %session_id, class = %name, "nav.select_class");
        Ok(())
    }

    /// Enter a class sub-view. The class name is read, not consumed.
    pub fn enter_class_detail(&self, session_id: &str, role: Role, kind: DetailKind) -> PortalResult<String> {
        self.gate.require(session_id, role)?;
        let name = self.selected_class(session_id)?;
        self.sessions.set_state(session_id, NavState::ClassDetail(kind));
        Ok(name)
    }

    pub fn select_announcement(&self, session_id: &str, role: Role, index: usize) -> PortalResult<()> {
        self.gate.require(session_id, role)?;
        self.sessions.set_selection(session_id, Selection::AnnouncementIndex(index));
        Ok(())
    }

    /// Validate `token` against the test-column allow-list and store it for the next results view.
    pub fn select_test(&self, session_id: &str, role: Role, token: &str) -> PortalResult<TestColumn> {
        self.gate.require(session_id, role)?;
        let test: TestColumn = token.parse()?;
        self.sessions.set_selection(session_id, Selection::TestToken(test));
        debug!(session = %session_id, test = %test, "nav.select_test");
        Ok(test)
    }

    pub fn logout(&self, session_id: &str) -> bool {
        self.sessions.destroy(session_id)
    }

    // ---- views ----

    /// Landing page: the identity's classes. Caches the display name on first use.
    pub async fn home<I: IdentityStore>(&self, session_id: &str, role: Role, identities: &I) -> PortalResult<HomeView> {
        let identity = self.gate.require(session_id, role)?;
        let display_name = match self.sessions.display_name(session_id) {
            Some(name) => name,
            None => {
                let name = self
                    .fetch("display_name", identities.display_name(&identity))
                    .await?
                    .unwrap_or_else(|| identity.external_id().to_string());
                self.sessions.set_display_name_once(session_id, name)
            }
        };
        let classes = self.fetch("classes_for", self.data.classes_for(&identity)).await?;
        self.sessions.set_state(session_id, NavState::Home);
        Ok(HomeView { display_name, classes })
    }

    pub async fn class_listing(&self, session_id: &str, role: Role, kind: DetailKind) -> PortalResult<ClassListingView> {
        let identity = self.gate.require(session_id, role)?;
        let classes = self.fetch("classes_for", self.data.classes_for(&identity)).await?;
        self.sessions.set_state(session_id, NavState::ClassListing);
        Ok(ClassListingView { kind, classes })
    }

    pub async fn class_announcements(&self, session_id: &str, role: Role) -> PortalResult<ClassAnnouncementsView> {
        let class_name = self.enter_class_detail(session_id, role, DetailKind::Announcements)?;
        let announcements = self
            .fetch("announcements_for", self.data.announcements_for(&class_name))
            .await?
            .ok_or(ContextError::MissingSelection)?;
        Ok(ClassAnnouncementsView { class_name, announcements })
    }

    /// The selected announcement. Consumes the index; a missing or out-of-range index sends
    /// the caller back to the class listing.
    pub async fn announcement(&self, session_id: &str, role: Role) -> PortalResult<AnnouncementView> {
        self.gate.require(session_id, role)?;
        let class_name = self.selected_class(session_id)?;
        let lease = self.sessions.lease_selection(session_id, SelectionField::AnnouncementIndex);
        let Some(index) = lease.announcement_index() else {
            return Err(ContextError::MissingSelection.into());
        };
        let list = self.fetch("announcements_for", self.data.announcements_for(&class_name)).await?;
        // Delivered (or provably unusable): either way the selection is spent.
        lease.commit();
        let announcement = list
            .and_then(|mut l| (index < l.len()).then(|| l.swap_remove(index)))
            .ok_or(ContextError::MissingSelection)?;
        Ok(AnnouncementView { class_name, index, announcement })
    }

    pub async fn student_attendance(&self, session_id: &str) -> PortalResult<Vec<AttendanceRecord>> {
        let identity = self.gate.require(session_id, Role::Student)?;
        Ok(self.fetch("attendance_for", self.data.attendance_for(identity.external_id())).await?)
    }

    /// Results for the selected test, or an empty view when none was selected.
    pub async fn student_results(&self, session_id: &str) -> PortalResult<StudentResultsView> {
        let identity = self.gate.require(session_id, Role::Student)?;
        let lease = self.sessions.lease_selection(session_id, SelectionField::TestToken);
        let Some(test) = lease.test_column() else {
            return Ok(StudentResultsView { test: None, grades: None });
        };
        let grades = self.fetch("results_for", self.data.results_for(identity.external_id(), test)).await?;
        lease.commit();
        Ok(StudentResultsView { test: Some(test), grades: Some(grades) })
    }

    pub async fn class_roster(&self, session_id: &str) -> PortalResult<ClassRoster> {
        let class_name = self.enter_class_detail(session_id, Role::Teacher, DetailKind::Attendance)?;
        let roster = self
            .fetch("class_roster", self.data.class_roster(&class_name))
            .await?
            .ok_or(ContextError::MissingSelection)?;
        Ok(roster)
    }

    pub async fn class_results(&self, session_id: &str) -> PortalResult<ClassResultsView> {
        let class_name = self.enter_class_detail(session_id, Role::Teacher, DetailKind::Results)?;
        let lease = self.sessions.lease_selection(session_id, SelectionField::TestToken);
        let Some(test) = lease.test_column() else {
            return Ok(ClassResultsView { class_name, test: None, students: None });
        };
        let students = self
            .fetch("class_results", self.data.class_results(&class_name, test))
            .await?
            .ok_or(ContextError::MissingSelection)?;
        lease.commit();
        Ok(ClassResultsView { class_name, test: Some(test), students: Some(students) })
    }

    /// Mark `present` as attending today in the selected class, as one atomic batch.
    pub async fn record_attendance(&self, session_id: &str, present: &BTreeSet<String>) -> PortalResult<usize> {
        let identity = self.gate.require(session_id, Role::Teacher)?;
        let class_name = self.selected_class(session_id)?;
        let roster = self
            .fetch("class_roster", self.data.class_roster(&class_name))
            .await?
            .ok_or(ContextError::MissingSelection)?;
        self.fetch("increment_attendance", self.data.increment_attendance(roster.class_id, present)).await?;
        log_write(&identity, &class_name, "attendance", present.len());
        Ok(present.len())
    }

    pub async fn post_announcement(&self, session_id: &str, title: &str, body: &str) -> PortalResult<()> {
        let identity = self.gate.require(session_id, Role::Teacher)?;
        let class_name = self.selected_class(session_id)?;
        let title = title.trim();
        if title.is_empty() {
            return Err(ValidationError::BlankAnnouncementTitle.into());
        }
        self.fetch("append_announcement", self.data.append_announcement(&class_name, title, body)).await?;
        log_write(&identity, &class_name, "announcement", 1);
        Ok(())
    }
}

fn log_write(identity: &Identity, class_name: &str, what: &'static str, rows: usize) {
    tracing::info!(teacher = %identity.external_id(), class = %class_name, rows, "{} recorded", what);
}
