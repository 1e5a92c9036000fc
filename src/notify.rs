//! User-facing notifications (success / queued offline / error).
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Success,
    QueuedOffline,
    Error,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
}

impl Notification {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Success,
            message: message.into(),
        }
    }

    pub fn queued_offline(message: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::QueuedOffline,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Error,
            message: message.into(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: Notification) {
        match n.kind {
            NotificationKind::Success => info!(kind = "success", "{}", n.message),
            NotificationKind::QueuedOffline => warn!(kind = "queued_offline", "{}", n.message),
            NotificationKind::Error => error!(kind = "error", "{}", n.message),
        }
    }
}

/// Forwards notifications to whoever holds the receiver. Dropped receivers
/// are tolerated: the notification is logged instead.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, n: Notification) {
        if let Err(mpsc::error::SendError(n)) = self.tx.send(n) {
            LogNotifier.notify(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_notifier_delivers_in_order() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.notify(Notification::queued_offline("guardado sin conexión"));
        notifier.notify(Notification::success("enviado"));

        assert_eq!(rx.try_recv().unwrap().kind, NotificationKind::QueuedOffline);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.kind, NotificationKind::Success);
        assert_eq!(second.message, "enviado");
    }

    #[test]
    fn closed_channel_does_not_panic() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        notifier.notify(Notification::error("boom"));
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&Notification::queued_offline("x")).unwrap();
        assert_eq!(json, r#"{"kind":"queued_offline","message":"x"}"#);
    }
}
