//! Score de santé d'un node
//!
//! Pure functions of the last stats snapshot and the connectivity flag.
//! Lower is better; a disconnected node scores `f64::INFINITY`.

use serde::Serialize;

use crate::model::NodeStats;

/// Exponential penalty on system CPU load (0.0 - 1.0)
pub fn cpu_penalty(system_load: f64) -> f64 {
    let load = system_load.max(0.0);
    (1.05f64.powf(100.0 * load) * 10.0 - 10.0).round()
}

/// Load penalties: players, CPU curve and audio frame problems
pub fn penalties(stats: &NodeStats) -> f64 {
    let (deficit, nulled) = stats
        .frame_stats
        .as_ref()
        .map(|f| (f.deficit.max(0) as f64, f.nulled.max(0) as f64))
        .unwrap_or((0.0, 0.0));

    f64::from(stats.players) + cpu_penalty(stats.cpu.system_load) + deficit + nulled * 2.0
}

pub fn score(stats: Option<&NodeStats>, connected: bool) -> f64 {
    if !connected {
        return f64::INFINITY;
    }
    let Some(stats) = stats else {
        return 0.0;
    };

    penalties(stats) * 10.0
        + stats.cpu.system_load.max(0.0) * 100.0
        + stats.memory_usage() * 0.5
        + f64::from(stats.players) * 2.0
        + f64::from(stats.playing_players) * 5.0
}

/// Health report of one node
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealth {
    pub name: String,
    pub state: String,
    pub connected: bool,
    pub score: f64,
    pub players: u32,
    pub playing_players: u32,
    pub cpu_load: f64,
    pub memory_usage: f64,
    pub uptime: u64,
    pub regions: Vec<String>,
    pub reconnect_attempts: u32,
}

/// Aggregated health of the fleet
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub total_nodes: usize,
    pub connected_nodes: usize,
    pub total_players: u32,
    pub playing_players: u32,
    pub sessions: usize,
    /// Average score of connected nodes
    pub average_score: Option<f64>,
    pub healthy: bool,
}

impl SystemHealth {
    pub fn from_nodes(nodes: &[NodeHealth], sessions: usize) -> Self {
        let connected: Vec<&NodeHealth> = nodes.iter().filter(|n| n.connected).collect();
        let average_score = if connected.is_empty() {
            None
        } else {
            Some(connected.iter().map(|n| n.score).sum::<f64>() / connected.len() as f64)
        };

        Self {
            total_nodes: nodes.len(),
            connected_nodes: connected.len(),
            total_players: nodes.iter().map(|n| n.players).sum(),
            playing_players: nodes.iter().map(|n| n.playing_players).sum(),
            sessions,
            average_score,
            healthy: !connected.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CpuStats, FrameStats};

    fn stats(players: u32, playing: u32, load: f64, deficit: i64, nulled: i64) -> NodeStats {
        NodeStats {
            players,
            playing_players: playing,
            cpu: CpuStats {
                cores: 4,
                system_load: load,
                lavalink_load: 0.0,
            },
            frame_stats: Some(FrameStats {
                sent: 3000,
                nulled,
                deficit,
            }),
            ..NodeStats::default()
        }
    }

    #[test]
    fn test_disconnected_is_infinite() {
        assert_eq!(score(Some(&stats(0, 0, 0.0, 0, 0)), false), f64::INFINITY);
        assert_eq!(score(None, false), f64::INFINITY);
        assert_eq!(score(None, true), 0.0);
    }

    #[test]
    fn test_monotonic_in_cpu_load() {
        let mut previous = score(Some(&stats(1, 1, 0.0, 0, 0)), true);
        for step in 1..=100 {
            let current = score(Some(&stats(1, 1, step as f64 / 100.0, 0, 0)), true);
            assert!(current >= previous, "load {step}%: {current} < {previous}");
            previous = current;
        }
    }

    #[test]
    fn test_monotonic_in_players_and_frames() {
        let base = score(Some(&stats(2, 1, 0.3, 10, 10)), true);
        assert!(score(Some(&stats(3, 1, 0.3, 10, 10)), true) >= base);
        assert!(score(Some(&stats(2, 2, 0.3, 10, 10)), true) >= base);
        assert!(score(Some(&stats(2, 1, 0.3, 11, 10)), true) >= base);
        assert!(score(Some(&stats(2, 1, 0.3, 10, 11)), true) >= base);
    }

    #[test]
    fn test_nulled_frames_weigh_more_than_deficit() {
        let deficit = penalties(&stats(0, 0, 0.0, 10, 0));
        let nulled = penalties(&stats(0, 0, 0.0, 0, 10));
        assert!(nulled > deficit);
    }

    #[test]
    fn test_system_health() {
        let node = |name: &str, connected: bool, score: f64| NodeHealth {
            name: name.into(),
            state: "ready".into(),
            connected,
            score,
            players: 1,
            playing_players: 1,
            cpu_load: 0.0,
            memory_usage: 0.0,
            uptime: 0,
            regions: vec![],
            reconnect_attempts: 0,
        };
        let report = SystemHealth::from_nodes(&[node("a", true, 10.0), node("b", true, 20.0), node("c", false, f64::INFINITY)], 2);
        assert_eq!(report.connected_nodes, 2);
        assert_eq!(report.total_players, 3);
        assert_eq!(report.average_score, Some(15.0));
        assert!(report.healthy);
    }
}
