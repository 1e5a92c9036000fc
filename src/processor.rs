use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::backend::FormBackend;
use crate::cache::CacheLayer;
use crate::connection::{ConnectionMonitor, ConnectionState};
use crate::db::{self, Pool};
use crate::model::EntryStatus;
use crate::notify::{Notification, Notifier};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub completed: usize,
    pub failed: usize,
}

/// Replays queued submissions against the backend.
pub struct QueueProcessor<'a> {
    pub pool: &'a Pool,
    pub backend: &'a dyn FormBackend,
    pub notifier: &'a dyn Notifier,
    pub replay_timeout: Duration,
}

impl QueueProcessor<'_> {
    /// Replay the oldest pending entry. Returns `Ok(None)` when the queue has
    /// nothing pending, otherwise the status the entry ended in.
    #[instrument(skip_all)]
    pub async fn process_next_entry(&self) -> Result<Option<EntryStatus>> {
        let Some(entry) = db::next_pending_entry(self.pool).await? else {
            return Ok(None);
        };
        db::transition_status(
            self.pool,
            entry.id,
            EntryStatus::Pending,
            EntryStatus::Uploading,
            None,
        )
        .await?;

        let replay = self
            .backend
            .submit(entry.form_type, &entry.payload, &entry.attached_files);
        let res = match tokio::time::timeout(self.replay_timeout, replay).await {
            Ok(res) => res,
            Err(_) => Err(anyhow::anyhow!(
                "replay timed out after {}s",
                self.replay_timeout.as_secs()
            )),
        };

        match res {
            Ok(remote_id) => {
                db::transition_status(
                    self.pool,
                    entry.id,
                    EntryStatus::Uploading,
                    EntryStatus::Completed,
                    None,
                )
                .await?;
                info!(id = %entry.id, form_type = %entry.form_type, %remote_id, "offline entry replayed");
                self.notifier.notify(Notification::success(format!(
                    "{} pendiente enviada",
                    entry.form_type
                )));
                Ok(Some(EntryStatus::Completed))
            }
            Err(err) => {
                let message = format!("{:#}", err);
                warn!(
                    id = %entry.id,
                    form_type = %entry.form_type,
                    retry_count = entry.retry_count,
                    error = %message,
                    "offline entry replay failed"
                );
                db::transition_status(
                    self.pool,
                    entry.id,
                    EntryStatus::Uploading,
                    EntryStatus::Error,
                    Some(&message),
                )
                .await?;
                self.notifier.notify(Notification::error(format!(
                    "Error al enviar {} pendiente: {}",
                    entry.form_type, message
                )));
                Ok(Some(EntryStatus::Error))
            }
        }
    }

    /// Drain the pending entries while the connection stays up.
    pub async fn process_pending(&self, monitor: &ConnectionMonitor) -> Result<ReplaySummary> {
        let mut summary = ReplaySummary::default();
        while monitor.is_online() {
            match self.process_next_entry().await? {
                Some(EntryStatus::Completed) => summary.completed += 1,
                Some(_) => summary.failed += 1,
                None => break,
            }
        }
        if summary != ReplaySummary::default() {
            info!(
                completed = summary.completed,
                failed = summary.failed,
                "offline queue replay finished"
            );
        }
        Ok(summary)
    }

    /// Reconnect handling: optionally re-queue failed entries, then replay.
    pub async fn on_reconnect(
        &self,
        monitor: &ConnectionMonitor,
        retry_failed: bool,
    ) -> Result<ReplaySummary> {
        if retry_failed {
            let requeued = db::requeue_failed(self.pool).await?;
            if requeued > 0 {
                info!(requeued, "re-queued failed entries on reconnect");
            }
        }
        self.process_pending(monitor).await
    }

    /// Replay on every offline→online transition and on each `poll_every`
    /// tick while online. The poll picks up entries that became pending
    /// without a reconnect (manual retries, failed online submissions). The
    /// data cache is purged on every reconnect before replay starts.
    pub async fn run(
        &self,
        monitor: &ConnectionMonitor,
        cache: &CacheLayer<'_>,
        retry_failed: bool,
        poll_every: Duration,
    ) -> Result<()> {
        let mut rx: watch::Receiver<ConnectionState> = monitor.subscribe();
        let mut was_online = rx.borrow_and_update().is_online();
        let mut poll = tokio::time::interval(poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = rx.changed() => {
                    changed.context("connection monitor dropped")?;
                    let online = rx.borrow_and_update().is_online();
                    if online && !was_online {
                        if let Err(err) = cache.purge_data().await {
                            error!(?err, "failed to purge data cache on reconnect");
                        }
                        if let Err(err) = self.on_reconnect(monitor, retry_failed).await {
                            error!(?err, "replay after reconnect failed");
                        }
                    }
                    was_online = online;
                }
                _ = poll.tick() => {
                    if monitor.is_online() {
                        if let Err(err) = self.process_pending(monitor).await {
                            error!(?err, "scheduled replay failed");
                        }
                    }
                }
            }
        }
    }
}

/// Manual retry of one failed entry (error → pending).
pub async fn retry_entry(pool: &Pool, id: Uuid) -> Result<()> {
    db::transition_status(pool, id, EntryStatus::Error, EntryStatus::Pending, None).await
}

/// Manual retry of every failed entry.
pub async fn retry_all_failed(pool: &Pool) -> Result<u64> {
    db::requeue_failed(pool).await
}
