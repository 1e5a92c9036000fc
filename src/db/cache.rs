use super::model::CachedBody;
use super::repo::{from_millis, Pool};
use anyhow::Result;
use chrono::Utc;
use sqlx::Row;
use tracing::instrument;

#[instrument(skip_all, fields(bucket = %bucket, key = %key))]
pub async fn put(
    pool: &Pool,
    bucket: &str,
    key: &str,
    body: &[u8],
    content_type: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO cache_entries (bucket, key, body, content_type, stored_at_ms) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT (bucket, key) DO UPDATE SET body = excluded.body, \
             content_type = excluded.content_type, stored_at_ms = excluded.stored_at_ms",
    )
    .bind(bucket)
    .bind(key)
    .bind(body)
    .bind(content_type)
    .bind(Utc::now().timestamp_millis())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all, fields(bucket = %bucket, key = %key))]
pub async fn get(pool: &Pool, bucket: &str, key: &str) -> Result<Option<CachedBody>> {
    let row = sqlx::query(
        "SELECT body, content_type, stored_at_ms FROM cache_entries WHERE bucket = ? AND key = ?",
    )
    .bind(bucket)
    .bind(key)
    .fetch_optional(pool)
    .await?;
    row.map(|row| {
        Ok(CachedBody {
            body: row.get("body"),
            content_type: row.get("content_type"),
            stored_at: from_millis(row.get("stored_at_ms"))?,
        })
    })
    .transpose()
}

#[instrument(skip_all, fields(bucket = %bucket))]
pub async fn delete_bucket(pool: &Pool, bucket: &str) -> Result<u64> {
    let res = sqlx::query("DELETE FROM cache_entries WHERE bucket = ?")
        .bind(bucket)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

pub async fn delete_all(pool: &Pool) -> Result<u64> {
    let res = sqlx::query("DELETE FROM cache_entries").execute(pool).await?;
    Ok(res.rows_affected())
}

/// `(entries, bytes)` held in a bucket.
pub async fn bucket_usage(pool: &Pool, bucket: &str) -> Result<(i64, i64)> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS n, COALESCE(SUM(LENGTH(body)), 0) AS bytes FROM cache_entries WHERE bucket = ?",
    )
    .bind(bucket)
    .fetch_one(pool)
    .await?;
    Ok((row.get("n"), row.get("bytes")))
}
