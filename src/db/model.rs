//! View models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::{EntryStatus, FormType};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Queue listing row; file contents are left out.
#[derive(Debug, Clone)]
pub struct EntrySummary {
    pub id: Uuid,
    pub form_type: FormType,
    pub status: EntryStatus,
    pub timestamp: DateTime<Utc>,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub file_count: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: i64,
    pub uploading: i64,
    pub completed: i64,
    pub error: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.uploading + self.completed + self.error
    }
}

#[derive(Debug, Clone)]
pub struct CachedBody {
    pub body: Vec<u8>,
    pub content_type: String,
    pub stored_at: DateTime<Utc>,
}
