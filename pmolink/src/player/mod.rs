//! Sessions de lecture
//!
//! One [`Player`] per guild. It owns the queue, the voice connection state
//! and the playback flags, and talks to its node through the REST client.
//!
//! Every operation locks the session state for its whole duration, so
//! concurrent callers and node events are applied one at a time. Node events
//! are queued to a per-session driver task; timers (coalesced flush, restart,
//! autoplay) are tasks owned by the session and cancelled when it is
//! destroyed.

mod events;
mod history;
mod snapshot;
mod updates;
mod voice;

pub use history::TrackHistory;
pub use snapshot::{AutoResumeState, PlayerSnapshot};
pub use updates::{PendingUpdate, TrackUpdate, VoicePayload};
pub use voice::VoiceConnection;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::autoplay::Recommender;
use crate::config::LinkOptions;
use crate::errors::{LinkError, Result};
use crate::events::{EventBus, LinkEvent};
use crate::gateway::{VoiceCommand, VoiceGateway};
use crate::model::{Filters, LoopMode, Queue, Track};
use crate::node::{Node, SessionEvent};

use self::updates::{NodeSlot, UpdateBatcher};

pub const MAX_VOLUME: u16 = 1000;
pub const DEFAULT_VOLUME: u16 = 100;

/// Paramètres de création d'une session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub guild_id: String,
    pub voice_channel: Option<String>,
    pub text_channel: Option<String>,
    /// Preferred node region
    pub region: Option<String>,
    pub deaf: bool,
    pub mute: bool,
    pub volume: u16,
    pub autoplay: bool,
    pub loop_mode: LoopMode,
}

impl SessionOptions {
    pub fn new(guild_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            voice_channel: None,
            text_channel: None,
            region: None,
            deaf: true,
            mute: false,
            volume: DEFAULT_VOLUME,
            autoplay: false,
            loop_mode: LoopMode::None,
        }
    }

    pub fn voice_channel(mut self, channel: impl Into<String>) -> Self {
        self.voice_channel = Some(channel.into());
        self
    }

    pub fn text_channel(mut self, channel: impl Into<String>) -> Self {
        self.text_channel = Some(channel.into());
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn deaf(mut self, deaf: bool) -> Self {
        self.deaf = deaf;
        self
    }

    pub fn mute(mut self, mute: bool) -> Self {
        self.mute = mute;
        self
    }

    pub fn volume(mut self, volume: u16) -> Self {
        self.volume = volume;
        self
    }

    pub fn autoplay(mut self, autoplay: bool) -> Self {
        self.autoplay = autoplay;
        self
    }

    pub fn loop_mode(mut self, mode: LoopMode) -> Self {
        self.loop_mode = mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.guild_id.trim().is_empty() {
            return Err(LinkError::config("session guild id is empty"));
        }
        if self.volume > MAX_VOLUME {
            return Err(LinkError::config(format!(
                "volume {} exceeds the maximum of {}",
                self.volume, MAX_VOLUME
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerStatus {
    Idle,
    Playing,
    Paused,
    Destroyed,
}

/// Collaborators shared by every session of a manager
#[derive(Clone)]
pub(crate) struct PlayerContext {
    pub events: EventBus,
    pub gateway: Arc<dyn VoiceGateway>,
    pub recommender: Arc<dyn Recommender>,
    pub options: Arc<LinkOptions>,
}

struct SessionState {
    voice_channel: Option<String>,
    text_channel: Option<String>,
    deaf: bool,
    mute: bool,
    queue: Queue,
    current: Option<Track>,
    history: TrackHistory,
    volume: u16,
    loop_mode: LoopMode,
    filters: Filters,
    playing: bool,
    paused: bool,
    /// Last position reported by the node, and when
    position: u64,
    position_at: Option<DateTime<Utc>>,
    ping: i64,
    autoplay: bool,
    auto_resume: AutoResumeState,
    voice: VoiceConnection,
    data: HashMap<String, Value>,
    /// Replay the current track once voice is connected again
    pending_restart: bool,
    resume_paused: bool,
}

impl SessionState {
    fn new(options: &SessionOptions, link: &LinkOptions) -> Self {
        Self {
            voice_channel: options.voice_channel.clone(),
            text_channel: options.text_channel.clone(),
            deaf: options.deaf,
            mute: options.mute,
            queue: Queue::new(),
            current: None,
            history: TrackHistory::new(link.history),
            volume: options.volume.min(MAX_VOLUME),
            loop_mode: options.loop_mode,
            filters: Filters::default(),
            playing: false,
            paused: false,
            position: 0,
            position_at: None,
            ping: -1,
            autoplay: options.autoplay,
            auto_resume: AutoResumeState {
                enabled: link.auto_resume,
                ..AutoResumeState::default()
            },
            voice: VoiceConnection {
                self_deaf: options.deaf,
                self_mute: options.mute,
                ..VoiceConnection::default()
            },
            data: HashMap::new(),
            pending_restart: false,
            resume_paused: false,
        }
    }

    fn from_snapshot(snapshot: PlayerSnapshot, link: &LinkOptions) -> Self {
        let pending_restart = snapshot.current.is_some();
        let mut auto_resume = snapshot.auto_resume;
        auto_resume.enabled = link.auto_resume;
        auto_resume.last_track = snapshot.current.clone();
        auto_resume.last_position = snapshot.position;
        auto_resume.last_update = Some(snapshot.saved_at);

        Self {
            voice_channel: snapshot.voice_channel,
            text_channel: snapshot.text_channel,
            deaf: snapshot.deaf,
            mute: snapshot.mute,
            queue: Queue::from(snapshot.queue),
            current: snapshot.current,
            history: TrackHistory::restore(link.history, snapshot.history),
            volume: snapshot.volume.min(MAX_VOLUME),
            loop_mode: snapshot.loop_mode,
            filters: snapshot.filters,
            playing: false,
            paused: snapshot.paused,
            position: snapshot.position,
            position_at: None,
            ping: -1,
            autoplay: snapshot.autoplay,
            auto_resume,
            voice: VoiceConnection {
                self_deaf: snapshot.deaf,
                self_mute: snapshot.mute,
                ..VoiceConnection::default()
            },
            data: snapshot.data,
            pending_restart,
            resume_paused: snapshot.paused,
        }
    }

    /// Position extrapolée depuis le dernier rapport du node
    fn live_position(&self) -> u64 {
        let mut position = self.position;
        if self.playing && !self.paused {
            if let Some(at) = self.position_at {
                let elapsed = (Utc::now() - at).num_milliseconds().max(0) as u64;
                position = position.saturating_add(elapsed);
            }
        }
        match &self.current {
            Some(track) if !track.info.is_stream && track.info.length > 0 => {
                position.min(track.info.length)
            }
            _ => position,
        }
    }

    /// Saved auto-resume position when it is newer than the live one
    fn best_position(&self) -> u64 {
        let resume = &self.auto_resume;
        let same_track = match (&resume.last_track, &self.current) {
            (Some(saved), Some(current)) => saved.encoded == current.encoded,
            _ => false,
        };
        if same_track {
            if let Some(saved_at) = resume.last_update {
                if self.position_at.is_none_or(|at| saved_at > at) {
                    return resume.last_position;
                }
            }
        }
        self.live_position()
    }

    fn record_auto_resume(&mut self) {
        if !self.auto_resume.enabled {
            return;
        }
        self.auto_resume.last_track = self.current.clone();
        self.auto_resume.last_position = self.position;
        self.auto_resume.last_volume = self.volume;
        self.auto_resume.last_filters = self.filters.clone();
        self.auto_resume.last_update = self.position_at.or_else(|| Some(Utc::now()));
    }
}

pub struct Player {
    guild_id: String,
    region: Option<String>,
    ctx: PlayerContext,
    node: NodeSlot,
    state: Mutex<SessionState>,
    batcher: UpdateBatcher,
    inbox: UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
    destroyed: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("guild_id", &self.guild_id)
            .field("node", &self.node_name())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Player {
    pub(crate) fn spawn(options: &SessionOptions, node: Arc<Node>, ctx: PlayerContext) -> Arc<Self> {
        let state = SessionState::new(options, &ctx.options);
        Self::start(options.guild_id.clone(), options.region.clone(), node, ctx, state)
    }

    /// Rebuilds a saved session on `node`. Playback restarts once voice connects.
    pub(crate) fn restore(snapshot: PlayerSnapshot, node: Arc<Node>, ctx: PlayerContext) -> Arc<Self> {
        let guild_id = snapshot.guild_id.clone();
        let region = snapshot.region.clone();
        let state = SessionState::from_snapshot(snapshot, &ctx.options);
        Self::start(guild_id, region, node, ctx, state)
    }

    fn start(
        guild_id: String,
        region: Option<String>,
        node: Arc<Node>,
        ctx: PlayerContext,
        state: SessionState,
    ) -> Arc<Self> {
        let (inbox, rx) = unbounded_channel();
        let node: NodeSlot = Arc::new(RwLock::new(node));
        let batcher = UpdateBatcher::new(
            guild_id.clone(),
            Arc::clone(&node),
            ctx.options.batch_delay(),
            ctx.events.clone(),
        );

        let player = Arc::new(Self {
            guild_id,
            region,
            ctx,
            node,
            state: Mutex::new(state),
            batcher,
            inbox,
            cancel: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });
        player.spawn_driver(rx);
        player
    }

    /// Applique les événements du node un par un
    fn spawn_driver(self: &Arc<Self>, mut rx: UnboundedReceiver<SessionEvent>) {
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(player) = weak.upgrade() else { break };
                player.handle_event(event).await;
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Runs `future` as a task owned by the session
    fn spawn_task<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_destroyed() {
            return;
        }
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = future => {}
            }
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    pub(crate) fn dispatch(&self, event: SessionEvent) {
        if !self.is_destroyed() {
            let _ = self.inbox.send(event);
        }
    }

    // ============ Accesseurs ============

    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn node(&self) -> Arc<Node> {
        self.node.read().clone()
    }

    pub fn node_name(&self) -> String {
        self.node.read().name().to_string()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> PlayerStatus {
        let state = self.state.lock().await;
        if self.is_destroyed() {
            PlayerStatus::Destroyed
        } else if state.current.is_none() {
            PlayerStatus::Idle
        } else if state.paused {
            PlayerStatus::Paused
        } else {
            PlayerStatus::Playing
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.voice.connected
    }

    pub async fn current(&self) -> Option<Track> {
        self.state.lock().await.current.clone()
    }

    /// Most recently finished track
    pub async fn previous(&self) -> Option<Track> {
        self.state.lock().await.history.last().cloned()
    }

    pub async fn history(&self) -> Vec<Track> {
        self.state.lock().await.history.to_vec()
    }

    pub async fn queue(&self) -> Vec<Track> {
        self.state.lock().await.queue.to_vec()
    }

    pub async fn volume(&self) -> u16 {
        self.state.lock().await.volume
    }

    pub async fn loop_mode(&self) -> LoopMode {
        self.state.lock().await.loop_mode
    }

    pub async fn filters(&self) -> Filters {
        self.state.lock().await.filters.clone()
    }

    pub async fn autoplay(&self) -> bool {
        self.state.lock().await.autoplay
    }

    pub async fn position(&self) -> u64 {
        self.state.lock().await.live_position()
    }

    pub async fn ping(&self) -> i64 {
        self.state.lock().await.ping
    }

    pub async fn voice_channel(&self) -> Option<String> {
        self.state.lock().await.voice_channel.clone()
    }

    pub async fn text_channel(&self) -> Option<String> {
        self.state.lock().await.text_channel.clone()
    }

    // ============ Lecture ============

    /// Plays the head of the queue.
    ///
    /// Returns the track now playing, or `None` when the queue is empty.
    pub async fn play(&self) -> Result<Option<Track>> {
        let mut state = self.state.lock().await;
        self.ensure_usable()?;
        self.play_next_locked(&mut state).await
    }

    /// Stops the current track. The queue then advances as for a skip.
    pub async fn stop(&self) -> Result<()> {
        let state = self.state.lock().await;
        self.ensure_usable()?;
        if state.current.is_none() {
            return Ok(());
        }
        self.send_update(PendingUpdate {
            track: Some(TrackUpdate::Stop),
            ..PendingUpdate::default()
        })
        .await
    }

    pub async fn pause(&self, paused: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_usable()?;
        if state.paused == paused {
            return Ok(());
        }
        state.position = state.live_position();
        state.position_at = Some(Utc::now());
        state.paused = paused;
        state.playing = !paused && state.current.is_some();
        self.queue_update(PendingUpdate::paused(paused));
        Ok(())
    }

    /// Seeks the current track, clamping to its length. Returns the position sent.
    pub async fn seek(&self, position: u64) -> Result<u64> {
        let mut state = self.state.lock().await;
        self.ensure_usable()?;
        let track = state
            .current
            .as_ref()
            .ok_or_else(|| LinkError::playback("nothing is playing"))?;
        if !track.info.is_seekable {
            return Err(LinkError::playback(format!(
                "track '{}' is not seekable",
                track.title()
            )));
        }
        let position = if track.info.length > 0 {
            position.min(track.info.length)
        } else {
            position
        };
        state.position = position;
        state.position_at = Some(Utc::now());
        self.queue_update(PendingUpdate::position(position));
        Ok(position)
    }

    /// Sets the volume, clamped to `0..=1000`. Returns the applied value.
    pub async fn set_volume(&self, volume: u16) -> Result<u16> {
        let mut state = self.state.lock().await;
        self.ensure_usable()?;
        let volume = volume.min(MAX_VOLUME);
        state.volume = volume;
        self.queue_update(PendingUpdate::volume(volume));
        Ok(volume)
    }

    pub async fn set_filters(&self, filters: Filters) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_usable()?;
        state.filters = filters.clone();
        self.queue_update(PendingUpdate::filters(filters));
        Ok(())
    }

    pub async fn clear_filters(&self) -> Result<()> {
        self.set_filters(Filters::default()).await
    }

    pub async fn set_loop(&self, mode: LoopMode) {
        self.state.lock().await.loop_mode = mode;
    }

    pub async fn set_autoplay(&self, enabled: bool) {
        self.state.lock().await.autoplay = enabled;
    }

    /// Re-sends the current track with its last known position, volume,
    /// pause flag and filters.
    pub async fn restart(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_usable()?;
        self.restart_locked(&mut state).await
    }

    // ============ File d'attente ============

    /// Appends a track. Returns the new queue length.
    pub async fn add(&self, track: Track) -> usize {
        let mut state = self.state.lock().await;
        state.queue.push(track);
        state.queue.len()
    }

    pub async fn add_all(&self, tracks: Vec<Track>) -> usize {
        let mut state = self.state.lock().await;
        state.queue.extend(tracks);
        state.queue.len()
    }

    pub async fn insert(&self, index: usize, track: Track) {
        self.state.lock().await.queue.insert(index, track);
    }

    pub async fn remove(&self, index: usize) -> Option<Track> {
        let removed = self.state.lock().await.queue.remove(index)?;
        self.ctx.events.broadcast(LinkEvent::QueueRemove {
            guild_id: self.guild_id.clone(),
            index,
            track: removed.clone(),
        });
        Some(removed)
    }

    pub async fn move_track(&self, from: usize, to: usize) -> bool {
        let moved = self.state.lock().await.queue.move_item(from, to);
        if moved && from != to {
            self.ctx.events.broadcast(LinkEvent::QueueMove {
                guild_id: self.guild_id.clone(),
                from,
                to,
            });
        }
        moved
    }

    pub async fn shuffle(&self) {
        self.state.lock().await.queue.shuffle();
        self.ctx.events.broadcast(LinkEvent::QueueShuffle {
            guild_id: self.guild_id.clone(),
        });
    }

    pub async fn clear_queue(&self) {
        self.state.lock().await.queue.clear();
    }

    // ============ Canaux ============

    pub async fn set_text_channel(&self, channel: Option<String>) {
        self.state.lock().await.text_channel = channel;
    }

    /// Moves the session to another voice channel
    pub async fn set_voice_channel(&self, channel: impl Into<String>) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_usable()?;
        state.voice_channel = Some(channel.into());
        self.ctx
            .gateway
            .send(self.voice_command(&state, state.voice_channel.clone()));
        Ok(())
    }

    /// Asks the host to join the configured voice channel
    pub async fn connect(&self) -> Result<()> {
        let state = self.state.lock().await;
        self.ensure_usable()?;
        let channel = state.voice_channel.clone().ok_or_else(|| {
            LinkError::config(format!("session {} has no voice channel", self.guild_id))
        })?;
        debug!(guild = %self.guild_id, channel = %channel, "Joining voice channel");
        self.ctx.gateway.send(self.voice_command(&state, Some(channel)));
        Ok(())
    }

    /// Leaves the voice channel, keeping the session
    pub async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_usable()?;
        self.ctx.gateway.send(self.voice_command(&state, None));
        state.voice.reset();
        state.voice_channel = None;
        state.playing = false;
        Ok(())
    }

    // ============ Données libres ============

    pub async fn set_data(&self, key: impl Into<String>, value: Value) {
        self.state.lock().await.data.insert(key.into(), value);
    }

    pub async fn data(&self, key: &str) -> Option<Value> {
        self.state.lock().await.data.get(key).cloned()
    }

    pub async fn clear_data(&self) {
        self.state.lock().await.data.clear();
    }

    /// Lyrics of the current track
    pub async fn lyrics(&self, skip_track_source: bool) -> Result<Option<Value>> {
        let track = self
            .current()
            .await
            .ok_or_else(|| LinkError::playback("nothing is playing"))?;
        self.node().lyrics(&track, skip_track_source).await
    }

    // ============ Cycle de vie ============

    /// Binds the session to `node` and replays its state there
    pub(crate) async fn migrate(&self, node: Arc<Node>) -> Result<()> {
        let mut state = self.state.lock().await;
        // Le node d'origine peut être détruit : c'est le cas normal d'une évacuation
        if self.is_destroyed() {
            return Err(LinkError::SessionDestroyed(self.guild_id.clone()));
        }

        let previous = std::mem::replace(&mut *self.node.write(), Arc::clone(&node));
        if previous.name() == node.name() {
            return Ok(());
        }
        info!(guild = %self.guild_id, from = %previous.name(), to = %node.name(), "Migrating session");

        state.voice.connected = false;
        if let Some(channel) = state.voice_channel.clone() {
            self.ctx.gateway.send(self.voice_command(&state, Some(channel)));
        }
        if state.current.is_some() && !state.pending_restart {
            state.pending_restart = true;
            state.resume_paused = state.paused;
        }
        self.push_voice_locked(&mut state).await
    }

    /// Called when the bound node came back with a fresh session
    pub(crate) async fn on_node_ready(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_usable()?;
        if state.current.is_none() {
            return Ok(());
        }
        if !state.pending_restart {
            state.pending_restart = true;
            state.resume_paused = state.paused;
        }
        state.voice.connected = false;
        self.push_voice_locked(&mut state).await
    }

    pub async fn to_snapshot(&self) -> PlayerSnapshot {
        let state = self.state.lock().await;
        PlayerSnapshot {
            guild_id: self.guild_id.clone(),
            voice_channel: state.voice_channel.clone(),
            text_channel: state.text_channel.clone(),
            region: self.region.clone(),
            node: Some(self.node_name()),
            volume: state.volume,
            loop_mode: state.loop_mode,
            paused: state.paused,
            position: state.best_position(),
            current: state.current.clone(),
            queue: state.queue.to_vec(),
            history: state.history.to_vec(),
            filters: state.filters.clone(),
            autoplay: state.autoplay,
            deaf: state.deaf,
            mute: state.mute,
            data: state.data.clone(),
            auto_resume: state.auto_resume.clone(),
            saved_at: Utc::now(),
        }
    }

    /// Détruit la session
    ///
    /// Cancels every task owned by the session, leaves the voice channel and
    /// deletes the player on the node. Returns `false` if the session was
    /// already destroyed.
    pub async fn destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.batcher.close();

        let (deaf, mute) = {
            let state = self.state.lock().await;
            (state.deaf, state.mute)
        };
        self.ctx.gateway.send(VoiceCommand {
            guild_id: self.guild_id.clone(),
            channel_id: None,
            self_mute: mute,
            self_deaf: deaf,
        });

        let node = self.node();
        if node.is_connected() {
            if let Err(e) = node.rest().destroy_player(&self.guild_id).await {
                warn!(guild = %self.guild_id, node = %node.name(), error = %e, "Failed to delete player on node");
            }
        }

        info!(guild = %self.guild_id, "Session destroyed");
        self.ctx.events.broadcast(LinkEvent::PlayerDestroy {
            guild_id: self.guild_id.clone(),
        });
        true
    }

    // ============ Interne ============

    fn ensure_usable(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(LinkError::SessionDestroyed(self.guild_id.clone()));
        }
        let node = self.node.read();
        if node.is_destroyed() {
            return Err(LinkError::NodeUnavailable(node.name().to_string()));
        }
        Ok(())
    }

    fn voice_command(&self, state: &SessionState, channel_id: Option<String>) -> VoiceCommand {
        VoiceCommand {
            guild_id: self.guild_id.clone(),
            channel_id,
            self_mute: state.mute,
            self_deaf: state.deaf,
        }
    }

    /// Submits without waiting, failures surface as `PlayerError`
    fn queue_update(&self, update: PendingUpdate) {
        drop(self.batcher.submit(update));
    }

    /// Submits and waits for the flush carrying the update
    async fn send_update(&self, update: PendingUpdate) -> Result<()> {
        let rx = self.batcher.submit(update);
        self.await_flush(rx).await
    }

    /// Submits and flushes the current window immediately
    async fn send_update_now(&self, update: PendingUpdate) -> Result<()> {
        let rx = self.batcher.submit(update);
        self.batcher.flush_now().await;
        self.await_flush(rx).await
    }

    async fn await_flush(
        &self,
        rx: tokio::sync::oneshot::Receiver<updates::FlushResult>,
    ) -> Result<()> {
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LinkError::rest(self.node_name(), e)),
            Err(_) => Err(LinkError::SessionDestroyed(self.guild_id.clone())),
        }
    }

    async fn play_next_locked(&self, state: &mut SessionState) -> Result<Option<Track>> {
        if !state.voice.connected {
            return Err(LinkError::NotConnected(self.guild_id.clone()));
        }
        let Some(next) = state.queue.shift() else {
            return Ok(None);
        };
        let track = if next.is_resolved() {
            next
        } else {
            self.resolve_track(&next).await?
        };
        let encoded = track
            .encoded
            .clone()
            .ok_or_else(|| LinkError::playback(format!("track '{}' has no payload", track.title())))?;

        if let Some(previous) = state.current.take() {
            state.history.push(previous);
        }
        state.current = Some(track.clone());
        state.paused = false;
        state.playing = true;
        state.position = 0;
        state.position_at = Some(Utc::now());

        let update = PendingUpdate {
            track: Some(TrackUpdate::Play {
                encoded,
                user_data: track.user_data.clone(),
            }),
            paused: Some(false),
            // Un seek encore en attente ne doit pas s'appliquer à la nouvelle piste
            position: Some(0),
            ..PendingUpdate::default()
        };
        if let Err(e) = self.send_update(update).await {
            state.playing = false;
            return Err(e);
        }

        info!(guild = %self.guild_id, title = %track.title(), "Playing track");
        Ok(Some(track))
    }

    /// Looks a metadata-only track up on the bound node
    async fn resolve_track(&self, track: &Track) -> Result<Track> {
        let query = track.search_query(&self.ctx.options.default_search_platform);
        let result = self
            .node()
            .rest()
            .load_tracks(&query)
            .await
            .map_err(|e| LinkError::playback(format!("cannot resolve '{}': {}", query, e)))?;
        track
            .best_match(&result.tracks)
            .ok_or_else(|| LinkError::playback(format!("no match found for '{}'", query)))
    }

    async fn restart_locked(&self, state: &mut SessionState) -> Result<()> {
        let Some(track) = state.current.clone() else {
            return Ok(());
        };
        let Some(encoded) = track.encoded.clone() else {
            return Ok(());
        };
        if !state.voice.connected {
            state.pending_restart = true;
            state.resume_paused = state.paused;
            return Ok(());
        }

        let position = state.best_position();
        let update = PendingUpdate {
            track: Some(TrackUpdate::Play {
                encoded,
                user_data: track.user_data.clone(),
            }),
            position: Some(position),
            volume: Some(state.volume),
            paused: Some(state.paused),
            filters: Some(state.filters.clone()),
            voice: state.voice.payload(),
            end_time: None,
        };
        self.send_update_now(update).await?;

        state.pending_restart = false;
        state.position = position;
        state.position_at = Some(Utc::now());
        state.playing = !state.paused;
        info!(guild = %self.guild_id, title = %track.title(), position, "Session restarted");
        Ok(())
    }
}
