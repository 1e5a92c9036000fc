use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FormType {
    Revision,
    Note,
}

impl FormType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormType::Revision => "revision",
            FormType::Note => "note",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "revision" => Some(FormType::Revision),
            "note" => Some(FormType::Note),
            _ => None,
        }
    }
}

impl fmt::Display for FormType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Uploading,
    Completed,
    Error,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Uploading => "uploading",
            EntryStatus::Completed => "completed",
            EntryStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(EntryStatus::Pending),
            "uploading" => Some(EntryStatus::Uploading),
            "completed" => Some(EntryStatus::Completed),
            "error" => Some(EntryStatus::Error),
            _ => None,
        }
    }

    /// pending → uploading → {completed | error}, and error → pending on retry.
    pub fn can_transition_to(&self, next: EntryStatus) -> bool {
        matches!(
            (self, next),
            (EntryStatus::Pending, EntryStatus::Uploading)
                | (EntryStatus::Uploading, EntryStatus::Completed)
                | (EntryStatus::Uploading, EntryStatus::Error)
                | (EntryStatus::Error, EntryStatus::Pending)
        )
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file attached to a form field (e.g. a photo of the bathroom).
#[derive(Clone, PartialEq, Eq)]
pub struct AttachedFile {
    pub field: String,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl AttachedFile {
    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }
}

impl fmt::Debug for AttachedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedFile")
            .field("field", &self.field)
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A submission persisted locally because it could not reach the backend.
#[derive(Debug, Clone)]
pub struct OfflineFormEntry {
    pub id: Uuid,
    pub form_type: FormType,
    pub payload: Value,
    pub attached_files: Vec<AttachedFile>,
    pub timestamp: DateTime<Utc>,
    pub retry_count: i64,
    pub status: EntryStatus,
    pub last_error: Option<String>,
}

impl OfflineFormEntry {
    pub fn new(form_type: FormType, payload: Value, attached_files: Vec<AttachedFile>) -> Self {
        Self {
            id: Uuid::new_v4(),
            form_type,
            payload,
            attached_files,
            timestamp: Utc::now(),
            retry_count: 0,
            status: EntryStatus::Pending,
            last_error: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("offline entry {0} not found")]
    NotFound(Uuid),
    #[error("offline entry {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: EntryStatus,
        to: EntryStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            EntryStatus::Pending,
            EntryStatus::Uploading,
            EntryStatus::Completed,
            EntryStatus::Error,
        ] {
            assert_eq!(EntryStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(EntryStatus::parse("done"), None);
    }

    #[test]
    fn only_documented_transitions_are_allowed() {
        use EntryStatus::*;
        assert!(Pending.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Completed));
        assert!(Uploading.can_transition_to(Error));
        assert!(Error.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Error.can_transition_to(Uploading));
        assert!(!Uploading.can_transition_to(Pending));
    }

    #[test]
    fn new_entry_starts_pending() {
        let entry = OfflineFormEntry::new(FormType::Note, serde_json::json!({"nota": "x"}), vec![]);
        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(entry.retry_count, 0);
        assert!(entry.last_error.is_none());
    }
}
