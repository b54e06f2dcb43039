//! Messages exchanged with a node.
//!
//! Inbound socket messages carry an `op` discriminator; track lifecycle
//! events nest a second `type` discriminator. Both v3 and v4 spellings are
//! accepted where they differ.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{NodeStats, Track};

/// Message received on a node control socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NodeMessage {
    Ready {
        #[serde(default)]
        resumed: bool,
        session_id: String,
    },
    Stats(NodeStats),
    PlayerUpdate {
        guild_id: String,
        #[serde(default)]
        state: PlayerUpdateState,
    },
    Event(TrackEvent),
}

impl NodeMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Position report sent periodically by the node for each playing session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerUpdateState {
    /// Horodatage Unix en millisecondes
    pub time: i64,
    pub position: u64,
    pub connected: bool,
    pub ping: i64,
}

/// Track reference as found in events: a full object (v4) or the encoded string (v3).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum EventTrack {
    Encoded(String),
    Full(Box<Track>),
}

impl EventTrack {
    pub fn encoded(&self) -> Option<&str> {
        match self {
            EventTrack::Encoded(encoded) => Some(encoded),
            EventTrack::Full(track) => track.encoded.as_deref(),
        }
    }

    pub fn into_track(self) -> Option<Track> {
        match self {
            EventTrack::Full(track) => Some(*track),
            EventTrack::Encoded(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackEndReason {
    #[serde(rename = "finished", alias = "FINISHED")]
    Finished,
    #[serde(rename = "loadFailed", alias = "LOAD_FAILED")]
    LoadFailed,
    #[serde(rename = "stopped", alias = "STOPPED")]
    Stopped,
    #[serde(rename = "replaced", alias = "REPLACED")]
    Replaced,
    #[serde(rename = "cleanup", alias = "CLEANUP")]
    Cleanup,
}

impl TrackEndReason {
    /// Whether loop modes apply to the finished track
    pub fn honours_loop(&self) -> bool {
        matches!(self, TrackEndReason::Finished)
    }

    /// The track failed or was torn down and must not be requeued
    pub fn is_failure(&self) -> bool {
        matches!(self, TrackEndReason::LoadFailed | TrackEndReason::Cleanup)
    }
}

/// Session scoped events (`op: "event"`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum TrackEvent {
    TrackStartEvent {
        guild_id: String,
        #[serde(default)]
        track: Option<EventTrack>,
    },
    TrackEndEvent {
        guild_id: String,
        #[serde(default)]
        track: Option<EventTrack>,
        reason: TrackEndReason,
    },
    TrackExceptionEvent {
        guild_id: String,
        #[serde(default)]
        track: Option<EventTrack>,
        #[serde(default, alias = "error")]
        exception: Value,
    },
    TrackStuckEvent {
        guild_id: String,
        #[serde(default)]
        track: Option<EventTrack>,
        #[serde(default)]
        threshold_ms: u64,
    },
    WebSocketClosedEvent {
        guild_id: String,
        code: u16,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        by_remote: bool,
    },
}

impl TrackEvent {
    pub fn guild_id(&self) -> &str {
        match self {
            TrackEvent::TrackStartEvent { guild_id, .. }
            | TrackEvent::TrackEndEvent { guild_id, .. }
            | TrackEvent::TrackExceptionEvent { guild_id, .. }
            | TrackEvent::TrackStuckEvent { guild_id, .. }
            | TrackEvent::WebSocketClosedEvent { guild_id, .. } => guild_id,
        }
    }
}

/// Category of a track resolution result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadType {
    Track,
    Playlist,
    Search,
    Empty,
    Error,
}

impl LoadType {
    /// Accepts v4 names and the v3 upper case ones
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "track" | "TRACK_LOADED" => Some(LoadType::Track),
            "playlist" | "PLAYLIST_LOADED" => Some(LoadType::Playlist),
            "search" | "SEARCH_RESULT" => Some(LoadType::Search),
            "empty" | "NO_MATCHES" => Some(LoadType::Empty),
            "error" | "LOAD_FAILED" => Some(LoadType::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlaylistInfo {
    pub name: String,
    /// -1 when no track is selected
    pub selected_track: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadException {
    pub message: Option<String>,
    pub severity: String,
    pub cause: Option<String>,
}

/// Result of `loadtracks`, normalised across protocol versions.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadResult {
    pub load_type: LoadType,
    pub tracks: Vec<Track>,
    pub playlist: Option<PlaylistInfo>,
    pub plugin_info: Value,
    pub exception: Option<LoadException>,
}

impl LoadResult {
    pub fn empty() -> Self {
        Self {
            load_type: LoadType::Empty,
            tracks: Vec::new(),
            playlist: None,
            plugin_info: Value::Null,
            exception: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn from_value(value: Value) -> Result<Self, String> {
        let load_type = value
            .get("loadType")
            .and_then(Value::as_str)
            .and_then(LoadType::parse)
            .ok_or_else(|| format!("missing or unknown loadType in {}", value))?;

        if value.get("data").is_some() {
            Self::from_v4(load_type, value)
        } else {
            Self::from_v3(load_type, value)
        }
    }

    fn from_v4(load_type: LoadType, mut value: Value) -> Result<Self, String> {
        let data = value
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null);
        let mut result = Self {
            load_type,
            ..Self::empty()
        };

        match load_type {
            LoadType::Track => {
                result.tracks = vec![parse(data)?];
            }
            LoadType::Search => {
                result.tracks = parse(data)?;
            }
            LoadType::Playlist => {
                let mut data = data;
                let info = data
                    .get_mut("info")
                    .map(Value::take)
                    .unwrap_or_else(|| Value::Object(Default::default()));
                result.playlist = Some(parse(info)?);
                result.plugin_info = data
                    .get_mut("pluginInfo")
                    .map(Value::take)
                    .unwrap_or_default();
                result.tracks = parse(
                    data.get_mut("tracks")
                        .map(Value::take)
                        .unwrap_or(Value::Array(vec![])),
                )?;
            }
            LoadType::Error => {
                result.exception = Some(parse(data)?);
            }
            LoadType::Empty => {}
        }
        Ok(result)
    }

    fn from_v3(load_type: LoadType, mut value: Value) -> Result<Self, String> {
        let tracks = match value.get_mut("tracks").map(Value::take) {
            Some(tracks) => parse(tracks)?,
            None => Vec::new(),
        };
        let playlist = match value.get_mut("playlistInfo").map(Value::take) {
            Some(info) if load_type == LoadType::Playlist => Some(parse(info)?),
            _ => None,
        };
        let exception = match value.get_mut("exception").map(Value::take) {
            Some(exception) if !exception.is_null() => Some(parse(exception)?),
            _ => None,
        };

        Ok(Self {
            load_type,
            tracks,
            playlist,
            plugin_info: Value::Null,
            exception,
        })
    }
}

fn parse<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, String> {
    serde_json::from_value(value).map_err(|e| e.to_string())
}
