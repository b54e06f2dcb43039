//! Sérialisation d'une session
//!
//! [`PlayerSnapshot`] holds everything needed to rebuild a session on a
//! freshly chosen node after a process restart. [`AutoResumeState`] is the
//! last known playback state, refreshed while playing and replayed after
//! reconnections.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Filters, LoopMode, Track};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoResumeState {
    pub enabled: bool,
    pub last_track: Option<Track>,
    pub last_position: u64,
    pub last_volume: u16,
    pub last_filters: Filters,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub guild_id: String,
    #[serde(default)]
    pub voice_channel: Option<String>,
    #[serde(default)]
    pub text_channel: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Node the session was bound to when saved
    #[serde(default)]
    pub node: Option<String>,
    pub volume: u16,
    #[serde(default)]
    pub loop_mode: LoopMode,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub current: Option<Track>,
    #[serde(default)]
    pub queue: Vec<Track>,
    /// Newest first
    #[serde(default)]
    pub history: Vec<Track>,
    #[serde(default)]
    pub filters: Filters,
    #[serde(default)]
    pub autoplay: bool,
    #[serde(default = "default_true")]
    pub deaf: bool,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub data: HashMap<String, Value>,
    #[serde(default)]
    pub auto_resume: AutoResumeState,
    pub saved_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_snapshot_uses_defaults() {
        let snapshot: PlayerSnapshot = serde_json::from_value(json!({
            "guildId": "1",
            "volume": 100,
            "savedAt": "2026-01-01T00:00:00Z"
        }))
        .unwrap();

        assert_eq!(snapshot.loop_mode, LoopMode::None);
        assert!(snapshot.deaf);
        assert!(snapshot.queue.is_empty());
        assert!(!snapshot.auto_resume.enabled);
    }

    #[test]
    fn test_field_names_are_camel_case() {
        let snapshot = PlayerSnapshot {
            guild_id: "1".into(),
            voice_channel: Some("v".into()),
            text_channel: None,
            region: None,
            node: Some("main".into()),
            volume: 80,
            loop_mode: LoopMode::Queue,
            paused: false,
            position: 1234,
            current: None,
            queue: vec![],
            history: vec![],
            filters: Filters::default(),
            autoplay: true,
            deaf: true,
            mute: false,
            data: HashMap::new(),
            auto_resume: AutoResumeState::default(),
            saved_at: Utc::now(),
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["guildId"], json!("1"));
        assert_eq!(json["loopMode"], json!("queue"));
        assert_eq!(json["autoResume"]["lastPosition"], json!(0));
    }
}
