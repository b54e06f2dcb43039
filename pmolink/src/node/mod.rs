//! Remote audio node: identity, live state and control socket.
//!
//! A [`Node`] is owned by the registry. Its control socket runs in its own
//! task ([`connection`]) which updates the node in place and reports
//! lifecycle changes and session events to the manager through
//! [`NodeSignal`]s.
//!
//! States: `Disconnected → Connecting → Open → Ready`, back to
//! `Disconnected` when the socket closes, `Reconnecting` while waiting for
//! the next attempt, and the terminal `Destroyed`.

mod connection;
pub mod health;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{LinkOptions, NodeConfig, validate_node};
use crate::errors::{LinkError, Result};
use crate::model::{NodeInfo, NodeStats, PlayerUpdateState, Track, TrackEvent};
use crate::rest::RestClient;

use self::health::NodeHealth;

const LYRICS_PLUGIN: &str = "lavalyrics-plugin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Disconnected,
    Connecting,
    Open,
    Ready,
    Reconnecting,
    Destroyed,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Disconnected => "disconnected",
            NodeState::Connecting => "connecting",
            NodeState::Open => "open",
            NodeState::Ready => "ready",
            NodeState::Reconnecting => "reconnecting",
            NodeState::Destroyed => "destroyed",
        }
    }
}

/// Session scoped message forwarded to the player owning `guild_id`
#[derive(Debug, Clone)]
pub(crate) enum SessionEvent {
    PlayerUpdate(PlayerUpdateState),
    Track(TrackEvent),
}

/// Lifecycle report sent by a connection task to the manager
#[derive(Debug)]
pub(crate) enum NodeSignal {
    Open {
        node: String,
    },
    Ready {
        node: String,
        session_id: String,
        resumed: bool,
    },
    Reconnecting {
        node: String,
        attempt: u32,
        delay: Duration,
    },
    Disconnected {
        node: String,
        code: Option<u16>,
        reason: String,
    },
    Error {
        node: String,
        error: String,
    },
    /// Reconnect budget exhausted or node unusable; sent at most once
    Fatal {
        node: String,
        error: String,
    },
    Session {
        node: String,
        guild_id: String,
        event: SessionEvent,
    },
}

#[derive(Debug)]
struct NodeInner {
    state: NodeState,
    stats: Option<NodeStats>,
    info: Option<NodeInfo>,
    /// Bumped on every change that affects the health score
    epoch: u64,
    reconnect_attempts: u32,
    last_ready: Option<DateTime<Utc>>,
}

pub struct Node {
    config: NodeConfig,
    options: Arc<LinkOptions>,
    rest: RestClient,
    inner: RwLock<NodeInner>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl Node {
    pub fn new(config: NodeConfig, options: Arc<LinkOptions>) -> Result<Arc<Self>> {
        validate_node(&config)?;
        let mut config = config;
        if config.name.is_empty() {
            config.name = config.host.clone();
        }
        let rest = RestClient::for_node(&config, &options)?;

        Ok(Arc::new(Self {
            config,
            options,
            rest,
            inner: RwLock::new(NodeInner {
                state: NodeState::Disconnected,
                stats: None,
                info: None,
                epoch: 0,
                reconnect_attempts: 0,
                last_ready: None,
            }),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub(crate) fn options(&self) -> &Arc<LinkOptions> {
        &self.options
    }

    pub fn regions(&self) -> &[String] {
        &self.config.regions
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn state(&self) -> NodeState {
        self.inner.read().state
    }

    /// A node is connected once it sent `ready`
    pub fn is_connected(&self) -> bool {
        self.state() == NodeState::Ready
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == NodeState::Destroyed
    }

    pub fn session_id(&self) -> Option<String> {
        self.rest.session_id()
    }

    pub fn stats(&self) -> Option<NodeStats> {
        self.inner.read().stats.clone()
    }

    pub fn info(&self) -> Option<NodeInfo> {
        self.inner.read().info.clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.read().reconnect_attempts
    }

    pub fn last_ready(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_ready
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.inner.read().epoch
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.inner
            .read()
            .info
            .as_ref()
            .is_some_and(|info| info.has_plugin(name))
    }

    /// Current health score, computed from the last stats snapshot
    pub fn score(&self) -> f64 {
        let inner = self.inner.read();
        health::score(inner.stats.as_ref(), inner.state == NodeState::Ready)
    }

    pub fn health(&self) -> NodeHealth {
        let inner = self.inner.read();
        let connected = inner.state == NodeState::Ready;
        let stats = inner.stats.clone().unwrap_or_default();
        NodeHealth {
            name: self.config.name.clone(),
            state: inner.state.as_str().to_string(),
            connected,
            score: health::score(inner.stats.as_ref(), connected),
            players: stats.players,
            playing_players: stats.playing_players,
            cpu_load: stats.cpu.system_load,
            memory_usage: stats.memory_usage(),
            uptime: stats.uptime,
            regions: self.config.regions.clone(),
            reconnect_attempts: inner.reconnect_attempts,
        }
    }

    /// Changes state unless the node is destroyed. Returns `false` when ignored.
    pub(crate) fn set_state(&self, state: NodeState) -> bool {
        let mut inner = self.inner.write();
        if inner.state == NodeState::Destroyed {
            return false;
        }
        if inner.state != state {
            debug!(node = %self.name(), from = inner.state.as_str(), to = state.as_str(), "Node state change");
            inner.state = state;
            inner.epoch += 1;
        }
        true
    }

    pub(crate) fn set_reconnect_attempts(&self, attempts: u32) {
        self.inner.write().reconnect_attempts = attempts;
    }

    pub(crate) fn apply_stats(&self, stats: NodeStats) {
        let mut inner = self.inner.write();
        inner.stats = Some(stats);
        inner.epoch += 1;
    }

    pub(crate) fn set_info(&self, info: NodeInfo) {
        self.inner.write().info = Some(info);
    }

    /// Enters `Ready` with the session granted by the node.
    ///
    /// Returns `true` when the session id differs from the previous one.
    pub(crate) fn apply_ready(&self, session_id: &str) -> bool {
        let changed = self.rest.session_id().as_deref() != Some(session_id);
        if changed {
            self.rest.set_session_id(Some(session_id.to_string()));
        }
        if self.set_state(NodeState::Ready) {
            let mut inner = self.inner.write();
            inner.reconnect_attempts = 0;
            inner.last_ready = Some(Utc::now());
        }
        changed
    }

    /// Starts the connection task, once.
    pub(crate) fn connect(self: &Arc<Self>, client_id: String, signals: UnboundedSender<NodeSignal>) {
        let mut task = self.task.lock();
        if task.is_some() || self.is_destroyed() {
            return;
        }
        *task = Some(tokio::spawn(connection::run(
            Arc::clone(self),
            client_id,
            signals,
        )));
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Terminal transition, shared by explicit destroy and reconnect exhaustion.
    pub(crate) fn mark_destroyed(&self) -> bool {
        {
            let mut inner = self.inner.write();
            if inner.state == NodeState::Destroyed {
                return false;
            }
            inner.state = NodeState::Destroyed;
            inner.epoch += 1;
        }
        self.cancel.cancel();
        true
    }

    /// Ferme le socket et arrête toute reconnexion.
    ///
    /// Idempotent: returns `false` if the node was already destroyed.
    pub fn destroy(&self) -> bool {
        if !self.mark_destroyed() {
            return false;
        }
        self.task.lock().take();
        self.rest.clear_cache();
        info!(node = %self.name(), "Node destroyed");
        true
    }

    /// Lyrics of `track`, requires the lyrics plugin on the node
    pub async fn lyrics(&self, track: &Track, skip_track_source: bool) -> Result<Option<Value>> {
        if !self.has_plugin(LYRICS_PLUGIN) {
            return Err(LinkError::MissingPlugin {
                node: self.name().to_string(),
                plugin: LYRICS_PLUGIN.to_string(),
            });
        }
        let encoded = track
            .encoded
            .as_deref()
            .ok_or_else(|| LinkError::playback("track is not resolved"))?;
        self.rest.lyrics(encoded, skip_track_source).await
    }
}
