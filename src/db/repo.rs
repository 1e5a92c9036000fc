use super::model::{EntrySummary, StatusCounts};
use crate::model::{AttachedFile, EntryStatus, FormType, OfflineFormEntry, QueueError};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub const INTERRUPTED_UPLOAD: &str = "upload interrupted before completion";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // Per-connection settings: every pooled connection gets them.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid local queue database url {}", normalized))?
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePool::connect_with(options)
        .await
        .with_context(|| format!("failed to open local queue database {}", normalized))?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // sqlx refuses to create a missing file unless asked to.
    let mut rebuilt = format!("sqlite://{}", expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("timestamp {} out of range", ms))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid entry id {}", raw))
}

fn parse_form_type(raw: &str) -> Result<FormType> {
    FormType::parse(raw).ok_or_else(|| anyhow!("unknown form type {}", raw))
}

fn parse_status(raw: &str) -> Result<EntryStatus> {
    EntryStatus::parse(raw).ok_or_else(|| anyhow!("unknown entry status {}", raw))
}

#[instrument(skip_all, fields(id = %entry.id, form_type = %entry.form_type))]
pub async fn insert_entry(pool: &Pool, entry: &OfflineFormEntry) -> Result<()> {
    let payload = serde_json::to_string(&entry.payload).context("failed to encode payload")?;
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO offline_forms (id, form_type, payload, timestamp_ms, retry_count, status, last_error) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.id.to_string())
    .bind(entry.form_type.as_str())
    .bind(payload)
    .bind(entry.timestamp.timestamp_millis())
    .bind(entry.retry_count)
    .bind(entry.status.as_str())
    .bind(entry.last_error.as_deref())
    .execute(&mut *tx)
    .await?;

    for file in &entry.attached_files {
        sqlx::query(
            "INSERT INTO offline_form_files (entry_id, field, file_name, content_type, data) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(&file.field)
        .bind(&file.file_name)
        .bind(&file.content_type)
        .bind(&file.bytes)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to store attachment {}", file.field))?;
    }
    tx.commit().await?;
    Ok(())
}

async fn load_files(pool: &Pool, id: Uuid) -> Result<Vec<AttachedFile>> {
    let rows = sqlx::query(
        "SELECT field, file_name, content_type, data FROM offline_form_files WHERE entry_id = ? ORDER BY field",
    )
    .bind(id.to_string())
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| AttachedFile {
            field: row.get("field"),
            file_name: row.get("file_name"),
            content_type: row.get("content_type"),
            bytes: row.get("data"),
        })
        .collect())
}

fn entry_from_row(row: &SqliteRow, attached_files: Vec<AttachedFile>) -> Result<OfflineFormEntry> {
    let payload: String = row.get("payload");
    Ok(OfflineFormEntry {
        id: parse_id(row.get("id"))?,
        form_type: parse_form_type(row.get("form_type"))?,
        payload: serde_json::from_str(&payload).context("stored payload is not valid JSON")?,
        attached_files,
        timestamp: from_millis(row.get("timestamp_ms"))?,
        retry_count: row.get("retry_count"),
        status: parse_status(row.get("status"))?,
        last_error: row.try_get::<Option<String>, _>("last_error").ok().flatten(),
    })
}

#[instrument(skip_all)]
pub async fn get_entry(pool: &Pool, id: Uuid) -> Result<Option<OfflineFormEntry>> {
    let row = sqlx::query(
        "SELECT id, form_type, payload, timestamp_ms, retry_count, status, last_error FROM offline_forms WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let files = load_files(pool, id).await?;
    Ok(Some(entry_from_row(&row, files)?))
}

/// Oldest pending entry, with its attachments.
#[instrument(skip_all)]
pub async fn next_pending_entry(pool: &Pool) -> Result<Option<OfflineFormEntry>> {
    let row = sqlx::query(
        "SELECT id, form_type, payload, timestamp_ms, retry_count, status, last_error FROM offline_forms \
         WHERE status = 'pending' ORDER BY timestamp_ms ASC, rowid ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let id = parse_id(row.get("id"))?;
    let files = load_files(pool, id).await?;
    Ok(Some(entry_from_row(&row, files)?))
}

#[instrument(skip_all)]
pub async fn list_entries(pool: &Pool, status: Option<EntryStatus>) -> Result<Vec<EntrySummary>> {
    const SUMMARY: &str = "SELECT f.id, f.form_type, f.status, f.timestamp_ms, f.retry_count, f.last_error, \
                (SELECT COUNT(*) FROM offline_form_files a WHERE a.entry_id = f.id) AS file_count \
         FROM offline_forms f";
    let filter = if status.is_some() { " WHERE f.status = ?" } else { "" };
    let sql = format!(
        "{}{} ORDER BY f.timestamp_ms ASC, f.rowid ASC",
        SUMMARY, filter
    );
    let mut query = sqlx::query(&sql);
    if let Some(status) = status {
        query = query.bind(status.as_str());
    }
    let rows = query.fetch_all(pool).await?;

    rows.iter()
        .map(|row| {
            Ok(EntrySummary {
                id: parse_id(row.get("id"))?,
                form_type: parse_form_type(row.get("form_type"))?,
                status: parse_status(row.get("status"))?,
                timestamp: from_millis(row.get("timestamp_ms"))?,
                retry_count: row.get("retry_count"),
                last_error: row.try_get::<Option<String>, _>("last_error").ok().flatten(),
                file_count: row.get("file_count"),
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn count_by_status(pool: &Pool) -> Result<StatusCounts> {
    let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM offline_forms GROUP BY status")
        .fetch_all(pool)
        .await?;
    let mut counts = StatusCounts::default();
    for row in rows {
        let n: i64 = row.get("n");
        match parse_status(row.get("status"))? {
            EntryStatus::Pending => counts.pending = n,
            EntryStatus::Uploading => counts.uploading = n,
            EntryStatus::Completed => counts.completed = n,
            EntryStatus::Error => counts.error = n,
        }
    }
    Ok(counts)
}

async fn current_status(pool: &Pool, id: Uuid) -> Result<Option<EntryStatus>> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM offline_forms WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;
    status.as_deref().map(parse_status).transpose()
}

/// Move an entry between statuses. The update only applies while the entry is
/// still in `from`; otherwise a [`QueueError`] describes what went wrong.
///
/// - `error` records `message` as `last_error`.
/// - `error → pending` bumps `retry_count`.
/// - `completed` clears `last_error`.
#[instrument(skip_all, fields(%id, %from, %to))]
pub async fn transition_status(
    pool: &Pool,
    id: Uuid,
    from: EntryStatus,
    to: EntryStatus,
    message: Option<&str>,
) -> Result<()> {
    if !from.can_transition_to(to) {
        return Err(QueueError::InvalidTransition { id, from, to }.into());
    }

    let affected = match to {
        EntryStatus::Uploading => {
            sqlx::query("UPDATE offline_forms SET status = 'uploading' WHERE id = ? AND status = ?")
                .bind(id.to_string())
                .bind(from.as_str())
                .execute(pool)
                .await?
        }
        EntryStatus::Completed => {
            sqlx::query(
                "UPDATE offline_forms SET status = 'completed', last_error = NULL WHERE id = ? AND status = ?",
            )
            .bind(id.to_string())
            .bind(from.as_str())
            .execute(pool)
            .await?
        }
        EntryStatus::Error => {
            sqlx::query(
                "UPDATE offline_forms SET status = 'error', last_error = ? WHERE id = ? AND status = ?",
            )
            .bind(message)
            .bind(id.to_string())
            .bind(from.as_str())
            .execute(pool)
            .await?
        }
        EntryStatus::Pending => {
            sqlx::query(
                "UPDATE offline_forms SET status = 'pending', retry_count = retry_count + 1 WHERE id = ? AND status = ?",
            )
            .bind(id.to_string())
            .bind(from.as_str())
            .execute(pool)
            .await?
        }
    }
    .rows_affected();

    if affected == 0 {
        return match current_status(pool, id).await? {
            None => Err(QueueError::NotFound(id).into()),
            Some(actual) => Err(QueueError::InvalidTransition {
                id,
                from: actual,
                to,
            }
            .into()),
        };
    }
    Ok(())
}

/// Wholesale retry: every `error` entry goes back to `pending`.
#[instrument(skip_all)]
pub async fn requeue_failed(pool: &Pool) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE offline_forms SET status = 'pending', retry_count = retry_count + 1 WHERE status = 'error'",
    )
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Entries a previous process left in `uploading` can never finish; mark them
/// as failed so they become retryable.
#[instrument(skip_all)]
pub async fn fail_interrupted_uploads(pool: &Pool) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE offline_forms SET status = 'error', last_error = ? WHERE status = 'uploading'",
    )
    .bind(INTERRUPTED_UPLOAD)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Remove completed entries created before `cutoff`. Other statuses are never
/// touched.
#[instrument(skip_all)]
pub async fn delete_completed_before(pool: &Pool, cutoff: DateTime<Utc>) -> Result<u64> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "DELETE FROM offline_form_files WHERE entry_id IN \
         (SELECT id FROM offline_forms WHERE status = 'completed' AND timestamp_ms < ?)",
    )
    .bind(cutoff.timestamp_millis())
    .execute(&mut *tx)
    .await?;
    let res = sqlx::query("DELETE FROM offline_forms WHERE status = 'completed' AND timestamp_ms < ?")
        .bind(cutoff.timestamp_millis())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(res.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn photo(field: &str) -> AttachedFile {
        AttachedFile {
            field: field.to_string(),
            file_name: format!("{}.jpg", field),
            content_type: "image/jpeg".into(),
            bytes: vec![0xFF, 0xD8, 0xFF, 0xE0],
        }
    }

    #[test]
    fn prepare_sqlite_url_adds_create_mode() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://localhost/db"),
            "postgres://localhost/db"
        );
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("q.db");
        let url = prepare_sqlite_url(&format!("sqlite://{}", path.display()));
        assert_eq!(url, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn file_pool_enforces_foreign_keys() {
        let td = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", td.path().join("queue.db").display());
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let fk: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(fk, 1);
        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");

        let entry = OfflineFormEntry::new(FormType::Revision, json!({}), vec![photo("foto")]);
        insert_entry(&pool, &entry).await.unwrap();
        sqlx::query("DELETE FROM offline_forms WHERE id = ?")
            .bind(entry.id.to_string())
            .execute(&pool)
            .await
            .unwrap();
        let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM offline_form_files")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(files, 0);

        let orphan = sqlx::query(
            "INSERT INTO offline_form_files (entry_id, field, file_name, content_type, data) \
             VALUES ('missing', 'f', 'f.jpg', 'image/jpeg', x'00')",
        )
        .execute(&pool)
        .await;
        assert!(orphan.is_err());
    }

    #[tokio::test]
    async fn insert_and_read_back_with_files() {
        let pool = setup_pool().await;
        let entry = OfflineFormEntry::new(
            FormType::Revision,
            json!({"casita": "7", "checklist": {"toallas": true}}),
            vec![photo("foto_bano"), photo("foto_cocina")],
        );
        insert_entry(&pool, &entry).await.unwrap();

        let loaded = get_entry(&pool, entry.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, entry.id);
        assert_eq!(loaded.form_type, FormType::Revision);
        assert_eq!(loaded.payload["casita"], "7");
        assert_eq!(loaded.status, EntryStatus::Pending);
        assert_eq!(loaded.attached_files.len(), 2);
        assert_eq!(loaded.attached_files[0].field, "foto_bano");
        assert_eq!(loaded.attached_files[0].bytes, vec![0xFF, 0xD8, 0xFF, 0xE0]);
        assert_eq!(
            loaded.timestamp.timestamp_millis(),
            entry.timestamp.timestamp_millis()
        );

        let listed = list_entries(&pool, Some(EntryStatus::Pending)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file_count, 2);
        assert!(list_entries(&pool, Some(EntryStatus::Error))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn transitions_follow_the_state_machine() {
        let pool = setup_pool().await;
        let entry = OfflineFormEntry::new(FormType::Note, json!({"nota": "llave perdida"}), vec![]);
        insert_entry(&pool, &entry).await.unwrap();

        transition_status(&pool, entry.id, EntryStatus::Pending, EntryStatus::Uploading, None)
            .await
            .unwrap();
        transition_status(
            &pool,
            entry.id,
            EntryStatus::Uploading,
            EntryStatus::Error,
            Some("503 Service Unavailable"),
        )
        .await
        .unwrap();
        let e = get_entry(&pool, entry.id).await.unwrap().unwrap();
        assert_eq!(e.status, EntryStatus::Error);
        assert_eq!(e.last_error.as_deref(), Some("503 Service Unavailable"));
        assert_eq!(e.retry_count, 0);

        transition_status(&pool, entry.id, EntryStatus::Error, EntryStatus::Pending, None)
            .await
            .unwrap();
        let e = get_entry(&pool, entry.id).await.unwrap().unwrap();
        assert_eq!(e.status, EntryStatus::Pending);
        assert_eq!(e.retry_count, 1);

        transition_status(&pool, entry.id, EntryStatus::Pending, EntryStatus::Uploading, None)
            .await
            .unwrap();
        transition_status(&pool, entry.id, EntryStatus::Uploading, EntryStatus::Completed, None)
            .await
            .unwrap();
        let e = get_entry(&pool, entry.id).await.unwrap().unwrap();
        assert_eq!(e.status, EntryStatus::Completed);
        assert!(e.last_error.is_none());
    }

    #[tokio::test]
    async fn stale_or_illegal_transitions_are_rejected() {
        let pool = setup_pool().await;
        let entry = OfflineFormEntry::new(FormType::Note, json!({}), vec![]);
        insert_entry(&pool, &entry).await.unwrap();

        let err = transition_status(&pool, entry.id, EntryStatus::Completed, EntryStatus::Pending, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<QueueError>(),
            Some(QueueError::InvalidTransition { .. })
        ));

        // Legal edge, but the entry is not in `from`.
        let err = transition_status(&pool, entry.id, EntryStatus::Error, EntryStatus::Pending, None)
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<QueueError>(),
            Some(&QueueError::InvalidTransition {
                id: entry.id,
                from: EntryStatus::Pending,
                to: EntryStatus::Pending,
            })
        );

        let missing = Uuid::new_v4();
        let err = transition_status(&pool, missing, EntryStatus::Pending, EntryStatus::Uploading, None)
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<QueueError>(), Some(&QueueError::NotFound(missing)));
    }

    #[tokio::test]
    async fn next_pending_is_oldest_first() {
        let pool = setup_pool().await;
        let mut older = OfflineFormEntry::new(FormType::Note, json!({"n": 1}), vec![]);
        older.timestamp = Utc::now() - chrono::Duration::minutes(5);
        let newer = OfflineFormEntry::new(FormType::Note, json!({"n": 2}), vec![]);
        insert_entry(&pool, &newer).await.unwrap();
        insert_entry(&pool, &older).await.unwrap();

        let next = next_pending_entry(&pool).await.unwrap().unwrap();
        assert_eq!(next.id, older.id);
    }

    #[tokio::test]
    async fn interrupted_uploads_become_errors() {
        let pool = setup_pool().await;
        let entry = OfflineFormEntry::new(FormType::Revision, json!({}), vec![]);
        insert_entry(&pool, &entry).await.unwrap();
        transition_status(&pool, entry.id, EntryStatus::Pending, EntryStatus::Uploading, None)
            .await
            .unwrap();

        assert_eq!(fail_interrupted_uploads(&pool).await.unwrap(), 1);
        let e = get_entry(&pool, entry.id).await.unwrap().unwrap();
        assert_eq!(e.status, EntryStatus::Error);
        assert_eq!(e.last_error.as_deref(), Some(INTERRUPTED_UPLOAD));

        assert_eq!(requeue_failed(&pool).await.unwrap(), 1);
        let counts = count_by_status(&pool).await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.total(), 1);
    }

    #[tokio::test]
    async fn deleting_an_entry_drops_its_files() {
        let pool = setup_pool().await;
        let mut entry = OfflineFormEntry::new(FormType::Revision, json!({}), vec![photo("foto")]);
        entry.status = EntryStatus::Completed;
        entry.timestamp = Utc::now() - chrono::Duration::days(30);
        insert_entry(&pool, &entry).await.unwrap();

        let removed = delete_completed_before(&pool, Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM offline_form_files")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(files, 0);
    }
}
