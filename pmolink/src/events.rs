use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::debug;

use crate::model::{Track, TrackEndReason};

/// Everything the runtime reports to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The node sent `ready` and accepts sessions
    NodeConnect {
        node: String,
        session_id: String,
        resumed: bool,
    },
    NodeReconnect {
        node: String,
        attempt: u32,
    },
    NodeDisconnect {
        node: String,
        code: Option<u16>,
        reason: String,
    },
    NodeError {
        node: String,
        error: String,
        fatal: bool,
    },
    NodeDestroy {
        node: String,
    },

    PlayerCreate {
        guild_id: String,
        node: String,
    },
    PlayerDestroy {
        guild_id: String,
    },
    PlayerMigrated {
        guild_id: String,
        from: String,
        to: String,
    },
    /// Failure surfaced from an event handler or a deferred update
    PlayerError {
        guild_id: String,
        error: String,
    },

    TrackStart {
        guild_id: String,
        track: Track,
    },
    TrackEnd {
        guild_id: String,
        track: Option<Track>,
        reason: TrackEndReason,
    },
    TrackError {
        guild_id: String,
        track: Option<Track>,
        exception: Value,
    },
    TrackStuck {
        guild_id: String,
        track: Option<Track>,
        threshold_ms: u64,
    },
    QueueEnd {
        guild_id: String,
        last_track: Option<Track>,
    },
    QueueShuffle {
        guild_id: String,
    },
    QueueMove {
        guild_id: String,
        from: usize,
        to: usize,
    },
    QueueRemove {
        guild_id: String,
        index: usize,
        track: Track,
    },
    AutoplayFailed {
        guild_id: String,
        reason: String,
    },
    SocketClosed {
        guild_id: String,
        code: u16,
        reason: String,
        by_remote: bool,
    },

    PluginLoaded {
        name: String,
    },
    PluginUnloaded {
        name: String,
    },

    Debug {
        message: String,
    },
}

impl LinkEvent {
    /// Session the event is scoped to, if any
    pub fn guild_id(&self) -> Option<&str> {
        match self {
            LinkEvent::PlayerCreate { guild_id, .. }
            | LinkEvent::PlayerDestroy { guild_id }
            | LinkEvent::PlayerMigrated { guild_id, .. }
            | LinkEvent::PlayerError { guild_id, .. }
            | LinkEvent::TrackStart { guild_id, .. }
            | LinkEvent::TrackEnd { guild_id, .. }
            | LinkEvent::TrackError { guild_id, .. }
            | LinkEvent::TrackStuck { guild_id, .. }
            | LinkEvent::QueueEnd { guild_id, .. }
            | LinkEvent::QueueShuffle { guild_id }
            | LinkEvent::QueueMove { guild_id, .. }
            | LinkEvent::QueueRemove { guild_id, .. }
            | LinkEvent::AutoplayFailed { guild_id, .. }
            | LinkEvent::SocketClosed { guild_id, .. } => Some(guild_id),
            _ => None,
        }
    }

    /// Node the event is scoped to, if any
    pub fn node(&self) -> Option<&str> {
        match self {
            LinkEvent::NodeConnect { node, .. }
            | LinkEvent::NodeReconnect { node, .. }
            | LinkEvent::NodeDisconnect { node, .. }
            | LinkEvent::NodeError { node, .. }
            | LinkEvent::NodeDestroy { node } => Some(node),
            _ => None,
        }
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<UnboundedSender<LinkEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<LinkEvent> {
        let (tx, rx) = unbounded_channel::<LinkEvent>();
        self.subscribers.lock().push(tx);
        rx
    }

    pub(crate) fn broadcast(&self, event: LinkEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        debug!("{}", message);
        self.broadcast(LinkEvent::Debug { message });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
