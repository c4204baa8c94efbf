//! Allow-list of result columns a test selection may refer to.
//! Only a `TestColumn` ever reaches the storage layer; queries interpolate `column_name()`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestColumn {
    UnitTest1,
    UnitTest2,
    MidTerm,
    EndTerm,
}

impl TestColumn {
    pub const ALL: [TestColumn; 4] = [
        TestColumn::UnitTest1,
        TestColumn::UnitTest2,
        TestColumn::MidTerm,
        TestColumn::EndTerm,
    ];

    /// Column name in the enrollment table. Static, so safe to splice into SQL.
    pub fn column_name(&self) -> &'static str {
        match self {
            TestColumn::UnitTest1 => "unit_test_1",
            TestColumn::UnitTest2 => "unit_test_2",
            TestColumn::MidTerm => "mid_term",
            TestColumn::EndTerm => "end_term",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TestColumn::UnitTest1 => "Unit Test 1",
            TestColumn::UnitTest2 => "Unit Test 2",
            TestColumn::MidTerm => "Mid Term",
            TestColumn::EndTerm => "End Term",
        }
    }
}

impl fmt::Display for TestColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column_name())
    }
}

impl FromStr for TestColumn {
    type Err = ValidationError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let wanted = token.trim();
        TestColumn::ALL
            .into_iter()
            .find(|c| c.column_name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ValidationError::UnknownTestColumn(token.to_string()))
    }
}
