//! Status notifications.
//!
//! Every status change of the updater is published on a [`StatusBus`]. Any
//! number of observers (UI, logging, rollout controllers) can subscribe; the
//! engine itself never depends on who is listening. Each event is also logged
//! through `tracing`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::backend::FileInfo;
use crate::manifest::Manifest;

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Kind of status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtaState {
    /// Session created
    Init,
    /// Manifest accepted, writing started
    Begin,
    /// Bytes are being written
    Progress,
    /// Finalize requested
    Finalizing,
    /// Session finished (successfully or not)
    Done,
    /// Something went wrong
    Error,
    /// Update committed
    Commit,
    /// Update reverted
    Rollback,
}

impl OtaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Begin => "begin",
            Self::Progress => "progress",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
            Self::Error => "error",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for OtaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manifest and current entry at the time of an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateSnapshot {
    pub manifest: Option<Manifest>,
    pub entry: Option<FileInfo>,
}

/// One status notification.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub state: OtaState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<UpdateSnapshot>,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast channel for [`StatusEvent`]s.
#[derive(Debug, Clone)]
pub struct StatusBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Log and publish a status change.
    pub fn emit(&self, state: OtaState, message: impl Into<String>, snapshot: Option<UpdateSnapshot>) {
        let message = message.into();
        match state {
            OtaState::Error => error!(state = %state, "{message}"),
            _ => info!(state = %state, "{message}"),
        }

        let event = StatusEvent {
            state,
            message,
            snapshot,
            timestamp: Utc::now(),
        };
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(OtaState::Init.to_string(), "init");
        assert_eq!(OtaState::Finalizing.as_str(), "finalizing");
        assert_eq!(
            serde_json::to_string(&OtaState::Rollback).unwrap(),
            "\"rollback\""
        );
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = StatusBus::default();
        bus.emit(OtaState::Init, "starting", None);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_every_subscriber_sees_events() {
        let bus = StatusBus::default();
        let mut ui = bus.subscribe();
        let mut logger = bus.subscribe();

        bus.emit(OtaState::Begin, "App: app FW: 1.0", None);
        bus.emit(OtaState::Done, "Finished", None);

        for rx in [&mut ui, &mut logger] {
            let first = rx.try_recv().unwrap();
            assert_eq!(first.state, OtaState::Begin);
            assert_eq!(first.message, "App: app FW: 1.0");
            assert_eq!(rx.try_recv().unwrap().state, OtaState::Done);
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn test_event_serialization_skips_empty_snapshot() {
        let bus = StatusBus::default();
        let mut rx = bus.subscribe();
        bus.emit(OtaState::Error, "boom", None);
        let json = serde_json::to_value(rx.try_recv().unwrap()).unwrap();
        assert_eq!(json["state"], "error");
        assert_eq!(json["message"], "boom");
        assert!(json.get("snapshot").is_none());
    }
}
