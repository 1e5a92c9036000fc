//! Tracks whether the backend is reachable and announces transitions.
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::backend::FormBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Online,
    Offline,
}

impl ConnectionState {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectionState::Online)
    }
}

/// Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct ConnectionMonitor {
    tx: watch::Sender<ConnectionState>,
}

impl ConnectionMonitor {
    pub fn new(initial: ConnectionState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Record the current state. Returns `true` when this is a transition;
    /// subscribers are only woken on transitions.
    pub fn set(&self, next: ConnectionState) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            match next {
                ConnectionState::Online => info!("connection restored"),
                ConnectionState::Offline => warn!("connection lost"),
            }
        }
        changed
    }

    /// Probe the backend once and record the outcome.
    pub async fn probe(&self, backend: &dyn FormBackend) -> ConnectionState {
        let state = match backend.ping().await {
            Ok(()) => ConnectionState::Online,
            Err(err) => {
                if self.is_online() {
                    warn!(?err, "connectivity probe failed");
                }
                ConnectionState::Offline
            }
        };
        self.set(state);
        state
    }

    /// Probe forever at `interval`.
    pub async fn run_probe_loop(&self, backend: &dyn FormBackend, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.probe(backend).await;
        }
    }
}
