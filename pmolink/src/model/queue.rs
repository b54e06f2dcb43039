//! File d'attente de lecture d'une session.
//!
//! [`Queue`] only exposes the operations a session needs: appending,
//! taking the head, positional insert/remove, move and shuffle. It does not
//! deref to its inner container, so nothing can reorder it behind the
//! player's back.

use std::collections::VecDeque;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::Track;

/// Loop behaviour applied when a track finishes normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    #[default]
    None,
    /// Replay the finished track
    Track,
    /// Append the finished track to the tail
    Queue,
}

/// Ordered playback queue. Duplicates are allowed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Queue {
    items: VecDeque<Track>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.items.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Track> {
        self.items.get(index)
    }

    /// Next track to play, without removing it
    pub fn first(&self) -> Option<&Track> {
        self.items.front()
    }

    /// Ajoute une piste en fin de file
    pub fn push(&mut self, track: Track) {
        self.items.push_back(track);
    }

    pub fn push_front(&mut self, track: Track) {
        self.items.push_front(track);
    }

    pub fn extend<I: IntoIterator<Item = Track>>(&mut self, tracks: I) {
        self.items.extend(tracks);
    }

    /// Retire et retourne la tête de file
    pub fn shift(&mut self) -> Option<Track> {
        self.items.pop_front()
    }

    /// Inserts at `index`, clamped to the queue length
    pub fn insert(&mut self, index: usize, track: Track) {
        let index = index.min(self.items.len());
        self.items.insert(index, track);
    }

    pub fn remove(&mut self, index: usize) -> Option<Track> {
        self.items.remove(index)
    }

    /// Moves the track at `from` so that it ends up at `to`.
    ///
    /// Returns `false` and leaves the queue untouched when either index is
    /// out of range.
    pub fn move_item(&mut self, from: usize, to: usize) -> bool {
        if from >= self.items.len() || to >= self.items.len() {
            return false;
        }
        if from == to {
            return true;
        }
        if let Some(track) = self.items.remove(from) {
            self.items.insert(to, track);
        }
        true
    }

    pub fn shuffle(&mut self) {
        self.items.make_contiguous().shuffle(&mut rand::rng());
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn to_vec(&self) -> Vec<Track> {
        self.items.iter().cloned().collect()
    }
}

impl From<Vec<Track>> for Queue {
    fn from(tracks: Vec<Track>) -> Self {
        Self {
            items: tracks.into(),
        }
    }
}
