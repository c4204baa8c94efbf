use serde::Serialize;

use super::{DetailKind, TestColumn};
use crate::storage::{Announcement, ClassScore, StudentScore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HomeView {
    pub display_name: String,
    pub classes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassListingView {
    pub kind: DetailKind,
    pub classes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassAnnouncementsView {
    pub class_name: String,
    pub announcements: Vec<Announcement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnnouncementView {
    pub class_name: String,
    pub index: usize,
    pub announcement: Announcement,
}

/// `test`/`grades` are `None` when no test was selected before the view was requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudentResultsView {
    pub test: Option<TestColumn>,
    pub grades: Option<Vec<ClassScore>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassResultsView {
    pub class_name: String,
    pub test: Option<TestColumn>,
    pub students: Option<Vec<StudentScore>>,
}
