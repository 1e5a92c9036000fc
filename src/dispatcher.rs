use anyhow::Result;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::backend::FormBackend;
use crate::compress;
use crate::config::Images;
use crate::connection::ConnectionMonitor;
use crate::db::{self, Pool};
use crate::model::{AttachedFile, FormType, OfflineFormEntry};
use crate::notify::{Notification, Notifier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Stored remotely; carries the remote row id.
    Submitted(String),
    /// Kept in the local queue for replay.
    QueuedOffline(Uuid),
}

/// Entry point for every form submission.
pub struct Dispatcher<'a> {
    pub pool: &'a Pool,
    pub backend: &'a dyn FormBackend,
    pub monitor: &'a ConnectionMonitor,
    pub notifier: &'a dyn Notifier,
    pub images: &'a Images,
}

impl Dispatcher<'_> {
    /// Submit directly when online; otherwise, or when the direct attempt
    /// fails, persist to the offline queue. Every path emits a notification.
    #[instrument(skip_all, fields(%form_type))]
    pub async fn submit(
        &self,
        form_type: FormType,
        payload: Value,
        files: Vec<AttachedFile>,
    ) -> Result<DispatchOutcome> {
        let files = compress::compress_attachments(files, self.images);

        let failure = if self.monitor.is_online() {
            match self.backend.submit(form_type, &payload, &files).await {
                Ok(remote_id) => {
                    info!(%remote_id, "submitted online");
                    self.notifier
                        .notify(Notification::success(format!("{} enviada", label(form_type))));
                    return Ok(DispatchOutcome::Submitted(remote_id));
                }
                Err(err) => {
                    warn!(?err, "online submission failed; queueing locally");
                    Some(format!("{:#}", err))
                }
            }
        } else {
            None
        };

        let mut entry = OfflineFormEntry::new(form_type, payload, files);
        entry.last_error = failure.clone();
        if let Err(err) = db::insert_entry(self.pool, &entry).await {
            self.notifier.notify(Notification::error(format!(
                "No se pudo guardar la {}: {:#}",
                label(form_type),
                err
            )));
            return Err(err);
        }

        let message = match failure {
            Some(reason) => format!(
                "{} guardada sin conexión tras un error ({}); se enviará al reconectar",
                label(form_type),
                reason
            ),
            None => format!(
                "Sin conexión: {} guardada y se enviará al reconectar",
                label(form_type)
            ),
        };
        self.notifier.notify(Notification::queued_offline(message));
        info!(id = %entry.id, "queued offline");
        Ok(DispatchOutcome::QueuedOffline(entry.id))
    }
}

fn label(form_type: FormType) -> &'static str {
    match form_type {
        FormType::Revision => "revisión",
        FormType::Note => "nota",
    }
}
