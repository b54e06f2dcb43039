//! Point d'entrée de pmolink
//!
//! [`LinkManager`] owns the node registry and the session table, runs the
//! dispatcher that turns node signals into events, migrations and session
//! routing, and exposes track resolution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::autoplay::{Recommender, YoutubeMixRecommender};
use crate::config::{LinkConfig, LinkOptions, NodeConfig};
use crate::errors::{LinkError, Result};
use crate::events::{EventBus, LinkEvent};
use crate::gateway::{VoiceGateway, VoicePacket};
use crate::model::{LoadResult, LoadType};
use crate::node::health::{NodeHealth, SystemHealth};
use crate::node::{Node, NodeSignal};
use crate::player::{Player, PlayerContext, SessionOptions};
use crate::plugin::Plugin;
use crate::registry::NodeRegistry;

/// Paramètres d'une recherche de pistes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveQuery {
    /// URL or free text
    pub query: String,
    /// Search platform prefix, defaults to the configured one
    pub source: Option<String>,
    /// Stamped on every returned track
    pub requester: Option<Value>,
    /// Node to ask, defaults to the least loaded one
    pub node: Option<String>,
}

impl ResolveQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn requester(mut self, requester: Value) -> Self {
        self.requester = Some(requester);
        self
    }

    pub fn node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }
}

pub(crate) struct ManagerInner {
    pub(crate) config: LinkConfig,
    pub(crate) options: Arc<LinkOptions>,
    pub(crate) registry: NodeRegistry,
    pub(crate) players: RwLock<HashMap<String, Arc<Player>>>,
    pub(crate) events: EventBus,
    gateway: Arc<dyn VoiceGateway>,
    recommender: RwLock<Arc<dyn Recommender>>,
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
    client_id: RwLock<Option<String>>,
    signals: UnboundedSender<NodeSignal>,
    signal_rx: Mutex<Option<UnboundedReceiver<NodeSignal>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    destroyed: AtomicBool,
}

/// Client runtime for a fleet of audio nodes.
///
/// Cheap to clone; all clones share the same nodes and sessions.
#[derive(Clone)]
pub struct LinkManager {
    pub(crate) inner: Arc<ManagerInner>,
}

impl LinkManager {
    /// Validates `config`. Nothing connects before [`LinkManager::init`].
    pub fn new(config: LinkConfig, gateway: impl VoiceGateway + 'static) -> Result<Self> {
        config.validate()?;
        let options = Arc::new(config.options.clone());
        let (signals, signal_rx) = unbounded_channel();

        Ok(Self {
            inner: Arc::new(ManagerInner {
                registry: NodeRegistry::new(options.health_cache_ttl()),
                options,
                config,
                players: RwLock::new(HashMap::new()),
                events: EventBus::new(),
                gateway: Arc::new(gateway),
                recommender: RwLock::new(Arc::new(YoutubeMixRecommender)),
                plugins: RwLock::new(Vec::new()),
                client_id: RwLock::new(None),
                signals,
                signal_rx: Mutex::new(Some(signal_rx)),
                dispatcher: Mutex::new(None),
                cancel: CancellationToken::new(),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    /// Replaces the autoplay recommender used by sessions created afterwards
    pub fn with_recommender(self, recommender: impl Recommender + 'static) -> Self {
        *self.inner.recommender.write() = Arc::new(recommender);
        self
    }

    /// Registers a plugin, loaded by [`LinkManager::init`]
    pub fn add_plugin(&self, plugin: impl Plugin + 'static) {
        self.inner.plugins.write().push(Arc::new(plugin));
    }

    pub fn options(&self) -> &LinkOptions {
        &self.inner.options
    }

    pub fn client_id(&self) -> Option<String> {
        self.inner.client_id.read().clone()
    }

    /// Démarre le runtime
    ///
    /// Connects every configured node and loads the plugins. Calling it again
    /// is a no-op.
    pub async fn init(&self, client_id: impl Into<String>) -> Result<()> {
        {
            let mut current = self.inner.client_id.write();
            if current.is_some() {
                return Ok(());
            }
            *current = Some(client_id.into());
        }

        if let Some(rx) = self.inner.signal_rx.lock().take() {
            let handle = tokio::spawn(run_dispatcher(
                Arc::downgrade(&self.inner),
                rx,
                self.inner.cancel.clone(),
            ));
            *self.inner.dispatcher.lock() = Some(handle);
        }

        for node in self.inner.config.nodes.clone() {
            self.create_node(node)?;
        }

        let plugins = self.inner.plugins.read().clone();
        for plugin in plugins {
            plugin.load(self)?;
            info!(plugin = %plugin.name(), "Plugin loaded");
            self.inner.events.broadcast(LinkEvent::PluginLoaded {
                name: plugin.name().to_string(),
            });
        }

        info!(nodes = self.inner.registry.len(), "pmolink initialised");
        Ok(())
    }

    pub fn subscribe(&self) -> UnboundedReceiver<LinkEvent> {
        self.inner.events.subscribe()
    }

    // ============ Nodes ============

    /// Registers a node and starts connecting to it
    pub fn create_node(&self, config: NodeConfig) -> Result<Arc<Node>> {
        let client_id = self
            .client_id()
            .ok_or_else(|| LinkError::config("the manager must be initialised before adding nodes"))?;
        let node = Node::new(config, Arc::clone(&self.inner.options))?;
        self.inner.registry.insert(Arc::clone(&node))?;
        node.connect(client_id, self.inner.signals.clone());
        info!(node = %node.name(), url = %node.config().rest_url(), "Node created");
        Ok(node)
    }

    /// Moves the node's sessions elsewhere (or destroys them), then closes it
    pub async fn destroy_node(&self, name: &str) -> Result<()> {
        let node = self
            .inner
            .registry
            .remove(name)
            .ok_or_else(|| LinkError::NodeNotFound(name.to_string()))?;
        self.inner.evacuate(&node, true).await;
        if node.destroy() {
            self.inner.events.broadcast(LinkEvent::NodeDestroy {
                node: node.name().to_string(),
            });
        }
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.inner.registry.get(name)
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.inner.registry.all()
    }

    /// Connected nodes, best first
    pub fn least_loaded(&self) -> Vec<Arc<Node>> {
        self.inner.registry.least_loaded()
    }

    pub fn best_for_region(&self, region: &str) -> Option<Arc<Node>> {
        self.inner.registry.best_for_region(region)
    }

    pub fn nodes_health(&self) -> Vec<NodeHealth> {
        self.inner.registry.nodes_health()
    }

    pub fn system_health(&self) -> SystemHealth {
        self.inner
            .registry
            .system_health(self.inner.players.read().len())
    }

    // ============ Sessions ============

    /// Returns the session of `options.guild_id`, creating it if needed.
    ///
    /// A new session goes to the best node of its region, or to the least
    /// loaded node. It joins its voice channel right away when one is set.
    pub async fn create_session(&self, options: SessionOptions) -> Result<Arc<Player>> {
        options.validate()?;
        let player = {
            let mut players = self.inner.players.write();
            match players.get(&options.guild_id) {
                Some(existing) if !existing.is_destroyed() => return Ok(Arc::clone(existing)),
                Some(_) => debug!(guild = %options.guild_id, "Replacing destroyed session"),
                None => {}
            }
            let node = match &options.region {
                Some(region) => self.inner.registry.best_for_region(region),
                None => self.inner.registry.least_loaded().into_iter().next(),
            }
            .ok_or(LinkError::NoNodesAvailable)?;

            let player = Player::spawn(&options, Arc::clone(&node), self.inner.player_context());
            players.insert(options.guild_id.clone(), Arc::clone(&player));
            info!(guild = %options.guild_id, node = %node.name(), "Session created");
            player
        };

        self.inner.events.broadcast(LinkEvent::PlayerCreate {
            guild_id: player.guild_id().to_string(),
            node: player.node_name(),
        });
        if options.voice_channel.is_some() {
            player.connect().await?;
        }
        Ok(player)
    }

    pub fn get(&self, guild_id: &str) -> Option<Arc<Player>> {
        self.inner.players.read().get(guild_id).cloned()
    }

    pub fn players(&self) -> Vec<Arc<Player>> {
        self.inner.players.read().values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.inner.players.read().len()
    }

    /// Returns `false` when no such session exists
    pub async fn destroy_session(&self, guild_id: &str) -> bool {
        self.inner.destroy_session(guild_id).await
    }

    /// Routes a raw gateway voice dispatch to its session.
    ///
    /// Returns `true` when a session consumed the packet.
    pub async fn update_voice_state(&self, packet: &Value) -> Result<bool> {
        let Some(packet) = VoicePacket::from_gateway(packet) else {
            return Ok(false);
        };
        if let VoicePacket::State(state) = &packet {
            if self.client_id().as_deref() != Some(state.user_id.as_str()) {
                return Ok(false);
            }
        }
        let Some(player) = self.get(packet.guild_id()) else {
            debug!(guild = %packet.guild_id(), "Voice update for unknown session");
            return Ok(false);
        };
        player.handle_voice(packet).await?;
        Ok(true)
    }

    // ============ Résolution ============

    /// Loads tracks for a URL or a search.
    ///
    /// Text queries are prefixed with the search platform. A URL the node
    /// cannot load is retried as a search; an empty text lookup is retried
    /// as a Spotify then a YouTube identifier.
    pub async fn resolve(&self, query: ResolveQuery) -> Result<LoadResult> {
        let node = match &query.node {
            Some(name) => self
                .inner
                .registry
                .get(name)
                .ok_or_else(|| LinkError::NodeNotFound(name.clone()))?,
            None => self
                .inner
                .registry
                .least_loaded()
                .into_iter()
                .next()
                .ok_or(LinkError::NoNodesAvailable)?,
        };

        let text = query.query.trim();
        if text.is_empty() {
            return Err(LinkError::playback("empty query"));
        }
        let platform = query
            .source
            .as_deref()
            .unwrap_or(&self.inner.options.default_search_platform);
        let is_url = looks_like_url(text);
        let search = format!("{}:{}", platform, text);

        let identifier = if is_url { text.to_string() } else { search.clone() };
        debug!(node = %node.name(), identifier = %identifier, "Resolving");
        let mut result = node.rest().load_tracks(&identifier).await?;

        if result.load_type == LoadType::Error && is_url {
            debug!(query = %text, "URL failed to load, searching instead");
            result = node.rest().load_tracks(&search).await?;
        }
        if result.load_type == LoadType::Empty && !is_url {
            for fallback in [
                format!("https://open.spotify.com/track/{}", text),
                format!("https://www.youtube.com/watch?v={}", text),
            ] {
                let retry = node.rest().load_tracks(&fallback).await?;
                if !retry.is_empty() {
                    result = retry;
                    break;
                }
            }
        }

        if result.load_type == LoadType::Error {
            let message = result
                .exception
                .as_ref()
                .and_then(|e| e.message.clone())
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(LinkError::playback(format!(
                "failed to load '{}': {}",
                text, message
            )));
        }

        if let Some(requester) = &query.requester {
            for track in &mut result.tracks {
                track.requester = Some(requester.clone());
            }
        }
        Ok(result)
    }

    pub async fn search(&self, query: impl Into<String>, requester: Option<Value>) -> Result<LoadResult> {
        let mut query = ResolveQuery::new(query);
        query.requester = requester;
        self.resolve(query).await
    }

    // ============ Arrêt ============

    /// Unloads plugins, destroys every session and node. Idempotent.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let plugins: Vec<Arc<dyn Plugin>> = self.inner.plugins.write().drain(..).collect();
        for plugin in plugins {
            if let Err(e) = plugin.unload(self) {
                warn!(plugin = %plugin.name(), error = %e, "Plugin unload failed");
            }
            self.inner.events.broadcast(LinkEvent::PluginUnloaded {
                name: plugin.name().to_string(),
            });
        }

        let players: Vec<Arc<Player>> = self.inner.players.write().drain().map(|(_, p)| p).collect();
        for player in players {
            player.destroy().await;
        }

        for node in self.inner.registry.clear() {
            if node.destroy() {
                self.inner.events.broadcast(LinkEvent::NodeDestroy {
                    node: node.name().to_string(),
                });
            }
        }

        self.inner.cancel.cancel();
        if let Some(handle) = self.inner.dispatcher.lock().take() {
            handle.abort();
        }
        info!("pmolink destroyed");
    }
}

impl ManagerInner {
    pub(crate) fn player_context(&self) -> PlayerContext {
        PlayerContext {
            events: self.events.clone(),
            gateway: Arc::clone(&self.gateway),
            recommender: self.recommender.read().clone(),
            options: Arc::clone(&self.options),
        }
    }

    fn players_on(&self, node: &str) -> Vec<Arc<Player>> {
        self.players
            .read()
            .values()
            .filter(|player| player.node_name() == node)
            .cloned()
            .collect()
    }

    async fn destroy_session(&self, guild_id: &str) -> bool {
        let Some(player) = self.players.write().remove(guild_id) else {
            return false;
        };
        player.destroy().await
    }

    /// Moves every session bound to `node` to the best other node.
    ///
    /// With no other node, sessions are destroyed when `destroy_orphans` is
    /// set and left in place otherwise.
    async fn evacuate(&self, node: &Node, destroy_orphans: bool) {
        for player in self.players_on(node.name()) {
            match self.registry.best_except(node.name()) {
                Some(target) => self.migrate(&player, node.name(), target).await,
                None if destroy_orphans => {
                    warn!(guild = %player.guild_id(), node = %node.name(), "No node left, destroying session");
                    self.destroy_session(player.guild_id()).await;
                }
                None => {
                    warn!(guild = %player.guild_id(), node = %node.name(), "No other node connected, session stays bound");
                }
            }
        }
    }

    async fn migrate(&self, player: &Arc<Player>, from: &str, target: Arc<Node>) {
        let to = target.name().to_string();
        let result = player.migrate(target).await;
        if player.node_name() == to {
            self.events.broadcast(LinkEvent::PlayerMigrated {
                guild_id: player.guild_id().to_string(),
                from: from.to_string(),
                to,
            });
        }
        if let Err(e) = result {
            warn!(guild = %player.guild_id(), error = %e, "Migration incomplete");
            self.events.broadcast(LinkEvent::PlayerError {
                guild_id: player.guild_id().to_string(),
                error: e.to_string(),
            });
        }
    }

    async fn handle_signal(self: &Arc<Self>, signal: NodeSignal) {
        match signal {
            NodeSignal::Open { node } => {
                self.events.debug(format!("Node {} socket open", node));
            }
            NodeSignal::Ready {
                node,
                session_id,
                resumed,
            } => {
                self.events.broadcast(LinkEvent::NodeConnect {
                    node: node.clone(),
                    session_id,
                    resumed,
                });
                let this = Arc::clone(self);
                tokio::spawn(async move { this.on_node_ready(&node, resumed).await });
            }
            NodeSignal::Reconnecting {
                node,
                attempt,
                delay,
            } => {
                self.events
                    .debug(format!("Node {} reconnecting in {:?} (attempt {})", node, delay, attempt));
                self.events.broadcast(LinkEvent::NodeReconnect { node, attempt });
            }
            NodeSignal::Disconnected { node, code, reason } => {
                self.events.broadcast(LinkEvent::NodeDisconnect {
                    node: node.clone(),
                    code,
                    reason,
                });
                if let Some(node) = self.registry.get(&node) {
                    let this = Arc::clone(self);
                    tokio::spawn(async move { this.evacuate(&node, false).await });
                }
            }
            NodeSignal::Error { node, error } => {
                self.events.broadcast(LinkEvent::NodeError {
                    node,
                    error,
                    fatal: false,
                });
            }
            NodeSignal::Fatal { node, error } => {
                let removed = self.registry.remove(&node);
                self.events.broadcast(LinkEvent::NodeError {
                    node: node.clone(),
                    error,
                    fatal: true,
                });
                if let Some(removed) = removed {
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        this.evacuate(&removed, true).await;
                        this.events.broadcast(LinkEvent::NodeDestroy {
                            node: removed.name().to_string(),
                        });
                    });
                }
            }
            NodeSignal::Session {
                node,
                guild_id,
                event,
            } => {
                let player = self.players.read().get(&guild_id).cloned();
                match player {
                    Some(player) if player.node_name() == node => player.dispatch(event),
                    _ => debug!(node = %node, guild = %guild_id, "Dropping event for unknown session"),
                }
            }
        }
    }

    /// Adopts orphaned sessions and replays sessions that lost their node state
    async fn on_node_ready(&self, name: &str, resumed: bool) {
        let Some(node) = self.registry.get(name) else {
            return;
        };

        let orphans: Vec<Arc<Player>> = self
            .players
            .read()
            .values()
            .filter(|player| {
                let bound = player.node();
                bound.name() != name && !bound.is_connected()
            })
            .cloned()
            .collect();
        for player in orphans {
            let from = player.node_name();
            self.migrate(&player, &from, Arc::clone(&node)).await;
        }

        if resumed || !self.options.auto_resume {
            return;
        }
        for player in self.players_on(name) {
            if let Err(e) = player.on_node_ready().await {
                warn!(guild = %player.guild_id(), error = %e, "Resume after reconnect failed");
                self.events.broadcast(LinkEvent::PlayerError {
                    guild_id: player.guild_id().to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
}

async fn run_dispatcher(
    inner: Weak<ManagerInner>,
    mut signals: UnboundedReceiver<NodeSignal>,
    cancel: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            _ = cancel.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else { break };
        inner.handle_signal(signal).await;
    }
    debug!("Dispatcher stopped");
}

fn looks_like_url(query: &str) -> bool {
    url::Url::parse(query).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::VoiceCommand;

    fn config() -> LinkConfig {
        LinkConfig::new(
            vec![NodeConfig::new("main", "127.0.0.1", 1)],
            LinkOptions::default(),
        )
    }

    #[test]
    fn test_url_detection() {
        assert!(looks_like_url("https://www.youtube.com/watch?v=abc"));
        assert!(!looks_like_url("never gonna give you up"));
        assert!(!looks_like_url("ytsearch:song"));
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let result = LinkManager::new(LinkConfig::default(), |_: VoiceCommand| {});
        assert!(matches!(result, Err(LinkError::Config(_))));
    }

    #[tokio::test]
    async fn test_create_node_requires_init() {
        let manager = LinkManager::new(config(), |_: VoiceCommand| {}).unwrap();
        let result = manager.create_node(NodeConfig::new("extra", "127.0.0.1", 2));
        assert!(matches!(result, Err(LinkError::Config(_))));
    }

    #[tokio::test]
    async fn test_no_nodes_available() {
        let manager = LinkManager::new(config(), |_: VoiceCommand| {}).unwrap();
        manager.init("bot").await.unwrap();
        assert_eq!(manager.nodes().len(), 1);

        let result = manager.create_session(SessionOptions::new("g1")).await;
        assert!(matches!(result, Err(LinkError::NoNodesAvailable)));
        assert!(matches!(
            manager.search("song", None).await,
            Err(LinkError::NoNodesAvailable)
        ));
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let manager = LinkManager::new(config(), |_: VoiceCommand| {}).unwrap();
        manager.init("bot").await.unwrap();
        manager.init("other").await.unwrap();
        assert_eq!(manager.client_id().as_deref(), Some("bot"));
        assert_eq!(manager.nodes().len(), 1);
        manager.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_unknown_node() {
        let manager = LinkManager::new(config(), |_: VoiceCommand| {}).unwrap();
        assert!(matches!(
            manager.destroy_node("nope").await,
            Err(LinkError::NodeNotFound(_))
        ));
    }
}
