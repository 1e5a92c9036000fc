use anyhow::Result;
use chrono::Utc;
use std::time::Duration;
use tracing::{error, info, instrument};

use crate::cache::CacheLayer;
use crate::db::{self, Pool};

/// Drop completed entries older than `retention`. Pending and failed entries
/// are kept no matter how old they are.
#[instrument(skip_all)]
pub async fn cleanup_completed(pool: &Pool, retention: chrono::Duration) -> Result<u64> {
    let cutoff = Utc::now() - retention;
    let removed = db::delete_completed_before(pool, cutoff).await?;
    if removed > 0 {
        info!(removed, %cutoff, "removed completed offline entries");
    }
    Ok(removed)
}

/// Periodic jobs: retention cleanup and the data-cache purge.
pub async fn run(
    pool: &Pool,
    cache: &CacheLayer<'_>,
    retention: chrono::Duration,
    cleanup_every: Duration,
    purge_every: Duration,
) {
    let mut cleanup = tokio::time::interval(cleanup_every);
    let mut purge = tokio::time::interval(purge_every);
    loop {
        tokio::select! {
            _ = cleanup.tick() => {
                if let Err(err) = cleanup_completed(pool, retention).await {
                    error!(?err, "offline entry cleanup failed");
                }
            }
            _ = purge.tick() => {
                if let Err(err) = cache.purge_data().await {
                    error!(?err, "scheduled data cache purge failed");
                }
            }
        }
    }
}
