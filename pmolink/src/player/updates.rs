//! Regroupement des mises à jour sortantes d'un player.
//!
//! Every state mutation is expressed as a [`PendingUpdate`] and handed to the
//! session's [`UpdateBatcher`]. Updates submitted within one window are
//! merged field by field (last value wins) and sent as a single PATCH when
//! the window closes. Flushes of one session are serialized, so updates
//! reach the node in submission order.
//!
//! Each submission returns a receiver resolved with the outcome of the flush
//! that carried it. Dropping the receiver is fine: failures nobody listens to
//! are reported as [`LinkEvent::PlayerError`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::RestVersion;
use crate::errors::{LinkError, RestError};
use crate::events::{EventBus, LinkEvent};
use crate::model::Filters;
use crate::node::Node;

/// Slot holding the node a session is currently bound to
pub(crate) type NodeSlot = Arc<RwLock<Arc<Node>>>;

pub(crate) type FlushResult = Result<(), RestError>;

/// Voice credentials forwarded to the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoicePayload {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackUpdate {
    Play { encoded: String, user_data: Value },
    Stop,
}

/// Fields to change on the node, `None` meaning "leave as is"
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingUpdate {
    pub track: Option<TrackUpdate>,
    pub position: Option<u64>,
    pub end_time: Option<u64>,
    pub volume: Option<u16>,
    pub paused: Option<bool>,
    pub filters: Option<Filters>,
    pub voice: Option<VoicePayload>,
}

impl PendingUpdate {
    pub fn volume(volume: u16) -> Self {
        Self {
            volume: Some(volume),
            ..Self::default()
        }
    }

    pub fn paused(paused: bool) -> Self {
        Self {
            paused: Some(paused),
            ..Self::default()
        }
    }

    pub fn position(position: u64) -> Self {
        Self {
            position: Some(position),
            ..Self::default()
        }
    }

    pub fn filters(filters: Filters) -> Self {
        Self {
            filters: Some(filters),
            ..Self::default()
        }
    }

    pub fn voice(voice: VoicePayload) -> Self {
        Self {
            voice: Some(voice),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == PendingUpdate::default()
    }

    /// Fusionne `other` dans `self`, la dernière valeur l'emporte
    pub fn merge(&mut self, other: PendingUpdate) {
        if other.track.is_some() {
            self.track = other.track;
        }
        if other.position.is_some() {
            self.position = other.position;
        }
        if other.end_time.is_some() {
            self.end_time = other.end_time;
        }
        if other.volume.is_some() {
            self.volume = other.volume;
        }
        if other.paused.is_some() {
            self.paused = other.paused;
        }
        if other.filters.is_some() {
            self.filters = other.filters;
        }
        if other.voice.is_some() {
            self.voice = other.voice;
        }
    }

    pub fn to_payload(&self, version: RestVersion) -> Value {
        let mut payload = Map::new();

        if let Some(track) = &self.track {
            let encoded = match track {
                TrackUpdate::Play { encoded, .. } => Value::String(encoded.clone()),
                TrackUpdate::Stop => Value::Null,
            };
            match version {
                RestVersion::V4 => {
                    let mut track_json = json!({ "encoded": encoded });
                    if let TrackUpdate::Play { user_data, .. } = track {
                        if !user_data.is_null() {
                            track_json["userData"] = user_data.clone();
                        }
                    }
                    payload.insert("track".into(), track_json);
                }
                RestVersion::V3 => {
                    payload.insert("encodedTrack".into(), encoded);
                }
            }
        }
        if let Some(position) = self.position {
            payload.insert("position".into(), json!(position));
        }
        if let Some(end_time) = self.end_time {
            payload.insert("endTime".into(), json!(end_time));
        }
        if let Some(volume) = self.volume {
            payload.insert("volume".into(), json!(volume));
        }
        if let Some(paused) = self.paused {
            payload.insert("paused".into(), json!(paused));
        }
        if let Some(filters) = &self.filters {
            payload.insert(
                "filters".into(),
                serde_json::to_value(filters).unwrap_or_else(|_| json!({})),
            );
        }
        if let Some(voice) = &self.voice {
            payload.insert(
                "voice".into(),
                json!({
                    "token": voice.token,
                    "endpoint": voice.endpoint,
                    "sessionId": voice.session_id,
                }),
            );
        }

        Value::Object(payload)
    }
}

#[derive(Default)]
struct Pending {
    update: PendingUpdate,
    waiters: Vec<oneshot::Sender<FlushResult>>,
    timer: Option<JoinHandle<()>>,
    /// Identifies the window the running timer belongs to
    generation: u64,
}

struct BatcherInner {
    guild_id: String,
    node: NodeSlot,
    delay: Duration,
    events: EventBus,
    pending: Mutex<Pending>,
    send_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub(crate) struct UpdateBatcher {
    inner: Arc<BatcherInner>,
}

impl UpdateBatcher {
    pub fn new(guild_id: String, node: NodeSlot, delay: Duration, events: EventBus) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                guild_id,
                node,
                delay,
                events,
                pending: Mutex::new(Pending::default()),
                send_lock: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Merges `update` into the current window, opening one if needed.
    pub fn submit(&self, update: PendingUpdate) -> oneshot::Receiver<FlushResult> {
        let (tx, rx) = oneshot::channel();
        if self.inner.closed.load(Ordering::SeqCst) {
            return rx;
        }

        let mut pending = self.inner.pending.lock();
        pending.update.merge(update);
        pending.waiters.push(tx);

        if pending.timer.is_none() {
            let inner = Arc::clone(&self.inner);
            let generation = pending.generation;
            pending.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(inner.delay).await;
                inner.flush(Some(generation)).await;
            }));
        }
        rx
    }

    /// Sends the current window without waiting for it to close
    pub async fn flush_now(&self) {
        self.inner.flush(None).await;
    }

    /// Drops the pending window and cancels its timer. Further submissions are ignored.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut pending = self.inner.pending.lock();
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        pending.update = PendingUpdate::default();
        pending.waiters.clear();
        pending.generation += 1;
    }
}

impl BatcherInner {
    async fn flush(&self, generation: Option<u64>) {
        let (update, waiters) = {
            let mut pending = self.pending.lock();
            if let Some(generation) = generation {
                if generation != pending.generation || pending.timer.is_none() {
                    return;
                }
            }
            pending.timer = None;
            pending.generation += 1;
            (
                std::mem::take(&mut pending.update),
                std::mem::take(&mut pending.waiters),
            )
        };

        if update.is_empty() {
            for waiter in waiters {
                let _ = waiter.send(Ok(()));
            }
            return;
        }

        let _guard = self.send_lock.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let node = self.node.read().clone();
        let payload = update.to_payload(node.rest().version());
        debug!(guild = %self.guild_id, node = %node.name(), "Sending player update {}", payload);

        let result: FlushResult = node
            .rest()
            .update_player(&self.guild_id, &payload, false)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                LinkError::Rest { source, .. } => source,
                other => RestError::Transport(other.to_string()),
            });

        let mut delivered = false;
        for waiter in waiters {
            delivered |= waiter.send(result.clone()).is_ok();
        }

        if let Err(e) = result {
            warn!(guild = %self.guild_id, node = %node.name(), error = %e, "Player update failed");
            if !delivered {
                self.events.broadcast(LinkEvent::PlayerError {
                    guild_id: self.guild_id.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
}
