//! Year-keyed partition addressing.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Datelike, Duration, Utc};

/// Records published before this year collapse into its partition.
pub const FLOOR_YEAR: i32 = 2002;

/// Width of the "recently modified" window.
pub const MODIFIED_WINDOW_DAYS: i64 = 7;

/// Address of one on-disk partition.
///
/// Every record lives in exactly one year partition; records touched within
/// the modified window additionally appear in [`PartitionKey::Modified`],
/// a denormalized view rebuilt on every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PartitionKey {
    Year(i32),
    Modified,
}

impl PartitionKey {
    /// The year partition a record belongs to, floored at [`FLOOR_YEAR`].
    pub fn for_published(published: DateTime<Utc>) -> Self {
        Self::Year(published.year().max(FLOOR_YEAR))
    }
}

impl Display for PartitionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Year(year) => write!(f, "{year}"),
            Self::Modified => write!(f, "modified"),
        }
    }
}

/// Whether `last_modified` falls inside the modified window ending at `now`.
pub fn in_modified_window(last_modified: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - last_modified <= Duration::days(MODIFIED_WINDOW_DAYS)
}
