//! Drill-down navigation: which class, which announcement, which test.
//!
//! A "select" request writes the choice into the session; the request that renders the
//! dependent view reads it back. The class name persists across the class sub-views, while
//! the announcement index and the test selection are one-shot: the first read clears them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod machine;
mod test_column;
mod views;

pub use machine::NavigationStateMachine;
pub use test_column::TestColumn;
pub use views::{AnnouncementView, ClassAnnouncementsView, ClassListingView, ClassResultsView, HomeView, StudentResultsView};

/// What a class drill-down shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetailKind {
    Announcements,
    Attendance,
    Results,
}

impl DetailKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetailKind::Announcements => "announcements",
            DetailKind::Attendance => "attendance",
            DetailKind::Results => "results",
        }
    }
}

impl fmt::Display for DetailKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for DetailKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "announcements" => Ok(DetailKind::Announcements),
            "attendance" => Ok(DetailKind::Attendance),
            "results" => Ok(DetailKind::Results),
            _ => Err(()),
        }
    }
}

/// Where an authenticated session currently is. Logout is terminal and removes the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "kind", rename_all = "snake_case")]
pub enum NavState {
    Home,
    ClassListing,
    ClassDetail(DetailKind),
}
