//! Node statistics and capability descriptors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpuStats {
    pub cores: u32,
    /// 0.0 - 1.0
    pub system_load: f64,
    pub lavalink_load: f64,
}

/// Audio frames over the last minute
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

/// Payload of the `stats` socket message (and of `GET /stats`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeStats {
    pub players: u32,
    pub playing_players: u32,
    pub uptime: u64,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    pub frame_stats: Option<FrameStats>,
}

impl NodeStats {
    /// Part of the reservable memory in use, in percent
    pub fn memory_usage(&self) -> f64 {
        if self.memory.reservable == 0 {
            return 0.0;
        }
        self.memory.used as f64 / self.memory.reservable as f64 * 100.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeVersion {
    pub semver: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
}

/// Payload of `GET /info`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeInfo {
    pub version: NodeVersion,
    pub build_time: i64,
    pub git: Value,
    pub jvm: String,
    pub lavaplayer: String,
    pub source_managers: Vec<String>,
    pub filters: Vec<String>,
    pub plugins: Vec<PluginDescriptor>,
}

impl NodeInfo {
    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.iter().any(|p| p.name == name)
    }

    pub fn supports_source(&self, source: &str) -> bool {
        self.source_managers.iter().any(|s| s == source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_stats_with_op_field() {
        let stats: NodeStats = serde_json::from_value(json!({
            "op": "stats",
            "players": 3,
            "playingPlayers": 1,
            "uptime": 1000,
            "memory": {"free": 10, "used": 50, "allocated": 80, "reservable": 200},
            "cpu": {"cores": 4, "systemLoad": 0.5, "lavalinkLoad": 0.1},
            "frameStats": {"sent": 3000, "nulled": 2, "deficit": 5}
        }))
        .unwrap();

        assert_eq!(stats.playing_players, 1);
        assert_eq!(stats.frame_stats.as_ref().unwrap().deficit, 5);
        assert!((stats.memory_usage() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_info_plugins() {
        let info: NodeInfo = serde_json::from_value(json!({
            "version": {"semver": "4.0.8", "major": 4, "minor": 0, "patch": 8},
            "sourceManagers": ["youtube", "soundcloud"],
            "plugins": [{"name": "lavalyrics-plugin", "version": "1.0.0"}]
        }))
        .unwrap();

        assert!(info.has_plugin("lavalyrics-plugin"));
        assert!(!info.has_plugin("lavasrc-plugin"));
        assert!(info.supports_source("youtube"));
    }
}
