//! Two-bucket response cache.
//!
//! `structure` holds page shells and reference data and never expires.
//! `data` holds query results and is dropped wholesale on an interval and on
//! every reconnect. There is no per-key TTL and no eviction order.
use anyhow::Result;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

use crate::backend::FormBackend;
use crate::db::{self, CachedBody, Pool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBucket {
    Structure,
    Data,
}

impl CacheBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheBucket::Structure => "structure",
            CacheBucket::Data => "data",
        }
    }
}

impl fmt::Display for CacheBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BucketStats {
    pub entries: i64,
    pub bytes: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub structure: BucketStats,
    pub data: BucketStats,
}

#[derive(Clone, Copy)]
pub struct CacheLayer<'a> {
    pool: &'a Pool,
}

impl<'a> CacheLayer<'a> {
    pub fn new(pool: &'a Pool) -> Self {
        Self { pool }
    }

    pub async fn put(
        &self,
        bucket: CacheBucket,
        key: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<()> {
        db::cache::put(self.pool, bucket.as_str(), key, body, content_type).await
    }

    pub async fn get(&self, bucket: CacheBucket, key: &str) -> Result<Option<CachedBody>> {
        db::cache::get(self.pool, bucket.as_str(), key).await
    }

    /// Read-through select: serve from `bucket` when present, otherwise fetch
    /// from the backend and store the response.
    pub async fn get_or_fetch(
        &self,
        bucket: CacheBucket,
        backend: &dyn FormBackend,
        table: &str,
        query: &str,
    ) -> Result<String> {
        let key = cache_key(table, query);
        if let Some(hit) = self.get(bucket, &key).await? {
            debug!(%bucket, %key, "cache hit");
            return Ok(String::from_utf8_lossy(&hit.body).into_owned());
        }
        let body = backend.select(table, query).await?;
        self.put(bucket, &key, body.as_bytes(), "application/json")
            .await?;
        Ok(body)
    }

    pub async fn purge_data(&self) -> Result<u64> {
        let removed = db::cache::delete_bucket(self.pool, CacheBucket::Data.as_str()).await?;
        info!(removed, "data cache purged");
        Ok(removed)
    }

    /// Operator reset of both buckets.
    pub async fn clear_all(&self) -> Result<u64> {
        db::cache::delete_all(self.pool).await
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let (s_entries, s_bytes) =
            db::cache::bucket_usage(self.pool, CacheBucket::Structure.as_str()).await?;
        let (d_entries, d_bytes) =
            db::cache::bucket_usage(self.pool, CacheBucket::Data.as_str()).await?;
        Ok(CacheStats {
            structure: BucketStats {
                entries: s_entries,
                bytes: s_bytes,
            },
            data: BucketStats {
                entries: d_entries,
                bytes: d_bytes,
            },
        })
    }
}

pub fn cache_key(table: &str, query: &str) -> String {
    if query.is_empty() {
        format!("/rest/v1/{}", table)
    } else {
        format!("/rest/v1/{}?{}", table, query)
    }
}
