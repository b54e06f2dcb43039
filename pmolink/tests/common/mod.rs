//! Node factice (axum) pour les tests d'intégration.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, patch};
use axum::{Json, http::StatusCode};
use pmolink::{LinkEvent, LinkOptions, NodeConfig, VoiceCommand};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

pub const SESSION_ID: &str = "fake-session";

/// Frame the fake node pushes on its open sockets
#[derive(Clone, Debug)]
enum Outgoing {
    Text(String),
    Close,
}

#[derive(Clone)]
struct FakeState {
    updates: Arc<Mutex<Vec<(String, Value)>>>,
    deleted: Arc<Mutex<Vec<String>>>,
    push: broadcast::Sender<Outgoing>,
    session_delay: Duration,
}

pub struct FakeNode {
    pub port: u16,
    updates: Arc<Mutex<Vec<(String, Value)>>>,
    deleted: Arc<Mutex<Vec<String>>>,
    push: broadcast::Sender<Outgoing>,
    handle: JoinHandle<()>,
}

impl FakeNode {
    pub async fn start() -> Self {
        Self::start_with_session_delay(Duration::ZERO).await
    }

    /// Node whose session update endpoint answers after `session_delay`
    pub async fn start_with_session_delay(session_delay: Duration) -> Self {
        let (push, _) = broadcast::channel(32);
        let state = FakeState {
            updates: Arc::new(Mutex::new(Vec::new())),
            deleted: Arc::new(Mutex::new(Vec::new())),
            push: push.clone(),
            session_delay,
        };

        let app = Router::new()
            .route("/v4/websocket", any(websocket))
            .route("/v4/info", get(info))
            .route("/v4/loadtracks", get(load_tracks))
            .route("/v4/sessions/{session}", patch(update_session))
            .route(
                "/v4/sessions/{session}/players/{guild}",
                patch(update_player).delete(destroy_player),
            )
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            port,
            updates: state.updates,
            deleted: state.deleted,
            push,
            handle,
        }
    }

    pub fn config(&self, name: &str) -> NodeConfig {
        NodeConfig::new(name, "127.0.0.1", self.port)
    }

    /// Player updates received so far, as `(guild, body)`
    pub fn updates(&self) -> Vec<(String, Value)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    /// Sends a raw message on every open control socket
    pub fn send(&self, message: Value) {
        let _ = self.push.send(Outgoing::Text(message.to_string()));
    }

    /// Closes every open control socket; clients may reconnect
    pub fn close_sockets(&self) {
        let _ = self.push.send(Outgoing::Close);
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn websocket(ws: WebSocketUpgrade, State(state): State<FakeState>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state.push.subscribe()))
}

async fn serve_socket(mut socket: WebSocket, mut push: broadcast::Receiver<Outgoing>) {
    let ready = json!({"op": "ready", "sessionId": SESSION_ID, "resumed": false}).to_string();
    if socket.send(Message::Text(ready.into())).await.is_err() {
        return;
    }
    loop {
        tokio::select! {
            message = socket.recv() => match message {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            outgoing = push.recv() => match outgoing {
                Ok(Outgoing::Text(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(Outgoing::Close) => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn info() -> Json<Value> {
    Json(json!({
        "version": {"semver": "4.0.4", "major": 4, "minor": 0, "patch": 4},
        "sourceManagers": ["youtube"],
        "filters": ["volume", "equalizer"],
        "plugins": []
    }))
}

pub fn track_json(identifier: &str, title: &str) -> Value {
    json!({
        "encoded": format!("enc-{identifier}"),
        "info": {
            "identifier": identifier,
            "isSeekable": true,
            "author": "Fake Artist",
            "length": 180000,
            "isStream": false,
            "position": 0,
            "title": title,
            "uri": format!("https://example.org/{identifier}"),
            "sourceName": "youtube"
        },
        "pluginInfo": {}
    })
}

async fn load_tracks() -> Json<Value> {
    Json(json!({
        "loadType": "search",
        "data": [track_json("abc", "First"), track_json("def", "Second")]
    }))
}

async fn update_session(
    State(state): State<FakeState>,
    Path(_session): Path<String>,
) -> Json<Value> {
    tokio::time::sleep(state.session_delay).await;
    Json(json!({"resuming": true, "timeout": 60}))
}

async fn update_player(
    State(state): State<FakeState>,
    Path((_session, guild)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.updates.lock().unwrap().push((guild.clone(), body));
    Json(json!({"guildId": guild}))
}

async fn destroy_player(
    State(state): State<FakeState>,
    Path((_session, guild)): Path<(String, String)>,
) -> impl IntoResponse {
    state.deleted.lock().unwrap().push(guild);
    StatusCode::NO_CONTENT
}

/// Options adaptées aux tests : backoff court, pas de coalescence
pub fn fast_options() -> LinkOptions {
    LinkOptions {
        reconnect_tries: 2,
        reconnect_delay_ms: 10,
        reconnect_max_delay_ms: 20,
        batch_delay_ms: 0,
        restart_delay_ms: 10,
        rest_timeout_ms: 2_000,
        ..LinkOptions::default()
    }
}

pub type Commands = Arc<Mutex<Vec<VoiceCommand>>>;

/// Gateway recording every command it is asked to send
pub fn recording_gateway() -> (Commands, impl Fn(VoiceCommand) + Send + Sync + 'static) {
    let commands: Commands = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&commands);
    (commands, move |command: VoiceCommand| {
        sink.lock().unwrap().push(command)
    })
}

/// Waits for the first event accepted by `filter`
pub async fn wait_for<F>(events: &mut UnboundedReceiver<LinkEvent>, mut filter: F) -> LinkEvent
where
    F: FnMut(&LinkEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            if filter(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Polls `check` until it holds
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never became true");
}

/// Gateway dispatches that complete the voice handshake of `guild`
pub fn voice_packets(guild: &str, user: &str, channel: &str) -> (Value, Value) {
    (
        json!({
            "t": "VOICE_STATE_UPDATE",
            "d": {
                "guild_id": guild,
                "user_id": user,
                "session_id": "voice-session",
                "channel_id": channel,
                "self_deaf": true,
                "self_mute": false
            }
        }),
        json!({
            "t": "VOICE_SERVER_UPDATE",
            "d": {"guild_id": guild, "token": "voice-token", "endpoint": "voice.example.org:443"}
        }),
    )
}
