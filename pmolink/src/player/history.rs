use std::collections::VecDeque;

use crate::config::HistoryPolicy;
use crate::model::Track;

/// Previously played tracks, newest first, bounded by a [`HistoryPolicy`].
#[derive(Debug, Clone)]
pub struct TrackHistory {
    policy: HistoryPolicy,
    items: VecDeque<Track>,
}

impl TrackHistory {
    pub fn new(policy: HistoryPolicy) -> Self {
        Self {
            policy,
            items: VecDeque::new(),
        }
    }

    /// Rebuilds a history from persisted tracks (newest first), truncated to the policy
    pub fn restore(policy: HistoryPolicy, tracks: Vec<Track>) -> Self {
        let mut items: VecDeque<Track> = tracks.into();
        items.truncate(policy.capacity());
        Self { policy, items }
    }

    pub fn push(&mut self, track: Track) {
        let capacity = self.policy.capacity();
        if capacity == 0 {
            return;
        }
        self.items.push_front(track);
        self.items.truncate(capacity);
    }

    /// Most recently finished track
    pub fn last(&self) -> Option<&Track> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn to_vec(&self) -> Vec<Track> {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TrackInfo;

    fn track(id: &str) -> Track {
        Track::new(
            id,
            TrackInfo {
                identifier: id.into(),
                ..TrackInfo::default()
            },
        )
    }

    #[test]
    fn test_disabled_keeps_nothing() {
        let mut history = TrackHistory::new(HistoryPolicy::Disabled);
        history.push(track("a"));
        assert!(history.is_empty());
        assert!(history.last().is_none());
    }

    #[test]
    fn test_last_only() {
        let mut history = TrackHistory::new(HistoryPolicy::LastOnly);
        history.push(track("a"));
        history.push(track("b"));
        assert_eq!(history.len(), 1);
        assert_eq!(history.last().unwrap().identifier(), "b");
    }

    #[test]
    fn test_bounded_newest_first() {
        let mut history = TrackHistory::new(HistoryPolicy::Bounded(3));
        for id in ["a", "b", "c", "d"] {
            history.push(track(id));
        }
        let ids: Vec<String> = history.to_vec().iter().map(|t| t.identifier().to_string()).collect();
        assert_eq!(ids, vec!["d", "c", "b"]);
    }

    #[test]
    fn test_restore_truncates() {
        let history = TrackHistory::restore(HistoryPolicy::LastOnly, vec![track("x"), track("y")]);
        assert_eq!(history.len(), 1);
        assert_eq!(history.last().unwrap().identifier(), "x");
    }
}
