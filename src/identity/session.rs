//! Per-session authenticated identity and drill-down selections.
//!
//! The store keeps one `Arc<Mutex<Session>>` slot per session id behind a map lock that is
//! only held long enough to find or insert the slot. Every operation on a session runs under
//! that session's own mutex, so operations on one session are linearizable while unrelated
//! sessions never wait on each other's work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::principal::Identity;
use crate::navigation::{NavState, TestColumn};

pub type SessionId = String;

/// Transient drill-down selections carried between a "select" request and its consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NavigationContext {
    pub selected_class_name: Option<String>,
    pub selected_test_token: Option<TestColumn>,
    pub selected_announcement_index: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionField {
    ClassName,
    TestToken,
    AnnouncementIndex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    ClassName(String),
    TestToken(TestColumn),
    AnnouncementIndex(usize),
}

impl Selection {
    pub fn field(&self) -> SelectionField {
        match self {
            Selection::ClassName(_) => SelectionField::ClassName,
            Selection::TestToken(_) => SelectionField::TestToken,
            Selection::AnnouncementIndex(_) => SelectionField::AnnouncementIndex,
        }
    }
}

impl NavigationContext {
    fn put(&mut self, selection: Selection) {
        match selection {
            Selection::ClassName(v) => self.selected_class_name = Some(v),
            Selection::TestToken(v) => self.selected_test_token = Some(v),
            Selection::AnnouncementIndex(v) => self.selected_announcement_index = Some(v),
        }
    }

    fn take(&mut self, field: SelectionField) -> Option<Selection> {
        match field {
            SelectionField::ClassName => self.selected_class_name.take().map(Selection::ClassName),
            SelectionField::TestToken => self.selected_test_token.take().map(Selection::TestToken),
            SelectionField::AnnouncementIndex => self.selected_announcement_index.take().map(Selection::AnnouncementIndex),
        }
    }

    fn is_empty_at(&self, field: SelectionField) -> bool {
        match field {
            SelectionField::ClassName => self.selected_class_name.is_none(),
            SelectionField::TestToken => self.selected_test_token.is_none(),
            SelectionField::AnnouncementIndex => self.selected_announcement_index.is_none(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub identity: Option<Identity>,
    pub context: NavigationContext,
    /// Filled once at first authenticated access; not refreshed if the profile changes.
    pub display_name_cache: Option<String>,
    pub state: NavState,
    pub issued_at: Instant,
    last_seen: Instant,
}

impl Session {
    fn new(session_id: SessionId) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            identity: None,
            context: NavigationContext::default(),
            display_name_cache: None,
            state: NavState::Home,
            issued_at: now,
            last_seen: now,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }
}

type Slot = Arc<Mutex<Session>>;

fn gen_id() -> SessionId {
    let mut buf = [0u8; 32];
    if getrandom::getrandom(&mut buf).is_err() {
        // OS RNG unavailable: fall back to a per-process counter mixed with the clock.
        // Still unique, but not secret; log so operators notice.
        tracing::error!("getrandom failed; session id entropy degraded");
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        buf[..16].copy_from_slice(&nanos.to_le_bytes());
        static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        buf[16..24].copy_from_slice(&n.to_le_bytes());
    }
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

pub struct SessionContextStore {
    slots: RwLock<HashMap<SessionId, Slot>>,
    ttl: Duration,
}

impl Default for SessionContextStore {
    fn default() -> Self { Self::new(Duration::from_secs(60 * 60)) }
}

impl SessionContextStore {
    pub fn new(ttl: Duration) -> Self {
        Self { slots: RwLock::new(HashMap::new()), ttl }
    }

    pub fn ttl(&self) -> Duration { self.ttl }

    /// Live slot for `session_id`, if any. Never inserts; an expired slot counts as absent
    /// and is left for the sweeper.
    fn lookup(&self, session_id: &str) -> Option<Slot> {
        let now = Instant::now();
        let map = self.slots.read();
        let slot = map.get(session_id)?;
        let mut s = slot.lock();
        if now.duration_since(s.last_seen) > self.ttl {
            return None;
        }
        s.last_seen = now;
        Some(slot.clone())
    }

    /// Live slot for `session_id`, creating an empty one on first reference or after expiry.
    fn slot(&self, session_id: &str) -> Slot {
        if let Some(slot) = self.lookup(session_id) {
            return slot;
        }
        let now = Instant::now();
        let mut map = self.slots.write();
        // Re-check under the write lock: another request may have refreshed or replaced it.
        if let Some(slot) = map.get(session_id) {
            let mut s = slot.lock();
            if now.duration_since(s.last_seen) <= self.ttl {
                s.last_seen = now;
                return slot.clone();
            }
            debug!(session = %session_id, "session expired; starting fresh");
        }
        let slot: Slot = Arc::new(Mutex::new(Session::new(session_id.to_string())));
        map.insert(session_id.to_string(), slot.clone());
        slot
    }

    /// Run `f` on a live session. Unknown or expired ids yield `None` without allocating.
    fn with_live<R>(&self, session_id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let slot = self.lookup(session_id)?;
        let mut guard = slot.lock();
        Some(f(&mut guard))
    }

    /// Mint a fresh, unauthenticated session and return its id.
    pub fn issue(&self) -> SessionId {
        let sid = gen_id();
        let slot = Arc::new(Mutex::new(Session::new(sid.clone())));
        self.slots.write().insert(sid.clone(), slot);
        debug!(session = %sid, "session.issue");
        sid
    }

    /// True when `session_id` names a live (unexpired) session.
    pub fn contains(&self, session_id: &str) -> bool {
        self.lookup(session_id).is_some()
    }

    /// Snapshot of the session, creating an empty unauthenticated one if none exists.
    pub fn get(&self, session_id: &str) -> Session {
        let slot = self.slot(session_id);
        let snapshot = slot.lock().clone();
        snapshot
    }

    /// Snapshot of a live session; never creates one.
    pub fn snapshot(&self, session_id: &str) -> Option<Session> {
        self.with_live(session_id, |s| s.clone())
    }

    pub fn identity(&self, session_id: &str) -> Option<Identity> {
        self.with_live(session_id, |s| s.identity.clone()).flatten()
    }

    /// Bind `identity` to a live session. Returns false when the id is unknown.
    pub fn bind_identity(&self, session_id: &str, identity: Identity) -> bool {
        self.with_live(session_id, |s| {
            debug!(session = %session_id, role = %identity.role(), "session.bind");
            s.identity = Some(identity);
            s.state = NavState::Home;
        })
        .is_some()
    }

    /// Destroy `old` and issue a new id; used whenever the session gains privileges.
    pub fn regenerate(&self, old: Option<&str>) -> SessionId {
        if let Some(old) = old { self.destroy(old); }
        self.issue()
    }

    pub fn set_selection(&self, session_id: &str, selection: Selection) {
        self.with_live(session_id, |s| s.context.put(selection));
    }

    /// Atomic read-and-clear of a one-shot field.
    pub fn take_selection(&self, session_id: &str, field: SelectionField) -> Option<Selection> {
        self.with_live(session_id, |s| s.context.take(field)).flatten()
    }

    /// Put a previously taken value back, unless a newer selection has been made meanwhile.
    pub fn restore_selection(&self, session_id: &str, selection: Selection) {
        self.with_live(session_id, |s| {
            if s.context.is_empty_at(selection.field()) {
                s.context.put(selection);
            }
        });
    }

    /// Take a one-shot field under a guard that restores it unless committed.
    pub fn lease_selection<'a>(&'a self, session_id: &str, field: SelectionField) -> SelectionLease<'a> {
        let value = self.take_selection(session_id, field);
        SelectionLease { store: self, session_id: session_id.to_string(), value }
    }

    pub fn class_name(&self, session_id: &str) -> Option<String> {
        self.with_live(session_id, |s| s.context.selected_class_name.clone()).flatten()
    }

    pub fn set_state(&self, session_id: &str, state: NavState) {
        self.with_live(session_id, |s| s.state = state);
    }

    pub fn display_name(&self, session_id: &str) -> Option<String> {
        self.with_live(session_id, |s| s.display_name_cache.clone()).flatten()
    }

    /// Cache the display name if none is cached yet; returns the cached value.
    pub fn set_display_name_once(&self, session_id: &str, name: String) -> String {
        match self.lookup(session_id) {
            Some(slot) => slot.lock().display_name_cache.get_or_insert(name).clone(),
            None => name,
        }
    }

    pub fn destroy(&self, session_id: &str) -> bool {
        let removed = self.slots.write().remove(session_id).is_some();
        if removed { debug!(session = %session_id, "session.destroy"); }
        removed
    }

    /// Drop sessions idle for longer than the TTL. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.slots.write();
        let before = map.len();
        map.retain(|_, slot| now.duration_since(slot.lock().last_seen) <= self.ttl);
        before - map.len()
    }

    pub fn len(&self) -> usize { self.slots.read().len() }

    pub fn is_empty(&self) -> bool { self.slots.read().is_empty() }
}

/// A one-shot selection taken out of a session and held until the read that needs it completes.
/// Dropping the lease without `commit` (error, timeout, cancelled future) puts the value back.
pub struct SelectionLease<'a> {
    store: &'a SessionContextStore,
    session_id: SessionId,
    value: Option<Selection>,
}

impl SelectionLease<'_> {
    pub fn value(&self) -> Option<&Selection> { self.value.as_ref() }

    pub fn test_column(&self) -> Option<TestColumn> {
        match self.value {
            Some(Selection::TestToken(t)) => Some(t),
            _ => None,
        }
    }

    pub fn announcement_index(&self) -> Option<usize> {
        match self.value {
            Some(Selection::AnnouncementIndex(i)) => Some(i),
            _ => None,
        }
    }

    /// The dependent read was delivered; the value stays consumed.
    pub fn commit(mut self) { self.value = None; }
}

impl Drop for SelectionLease<'_> {
    fn drop(&mut self) {
        if let Some(v) = self.value.take() {
            debug!(session = %self.session_id, field = ?v.field(), "selection.restore");
            self.store.restore_selection(&self.session_id, v);
        }
    }
}
