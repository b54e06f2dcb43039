use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum length difference accepted when matching an unresolved track
const MATCH_LENGTH_TOLERANCE_MS: u64 = 2_000;

/// Descriptive metadata of a track, as reported by the node.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub is_seekable: bool,
    #[serde(default)]
    pub author: String,
    /// Durée en millisecondes
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub is_stream: bool,
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isrc: Option<String>,
    #[serde(default)]
    pub source_name: String,
}

/// A playable item.
///
/// `encoded` is the opaque payload the node plays; it stays `None` for
/// tracks built from metadata only, until they are resolved against a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    #[serde(default, alias = "track")]
    pub encoded: Option<String>,
    pub info: TrackInfo,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub plugin_info: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub user_data: Value,
    /// Opaque description of whoever queued the track
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<Value>,
}

impl Track {
    pub fn new(encoded: impl Into<String>, info: TrackInfo) -> Self {
        Self {
            encoded: Some(encoded.into()),
            info,
            plugin_info: Value::Null,
            user_data: Value::Null,
            requester: None,
        }
    }

    /// Track known only by its metadata, resolved lazily before playback
    pub fn unresolved(title: impl Into<String>, author: impl Into<String>, length: u64) -> Self {
        Self {
            encoded: None,
            info: TrackInfo {
                title: title.into(),
                author: author.into(),
                length,
                ..TrackInfo::default()
            },
            plugin_info: Value::Null,
            user_data: Value::Null,
            requester: None,
        }
    }

    pub fn with_requester(mut self, requester: Value) -> Self {
        self.requester = Some(requester);
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.encoded.as_deref().is_some_and(|e| !e.is_empty())
    }

    pub fn title(&self) -> &str {
        &self.info.title
    }

    pub fn identifier(&self) -> &str {
        &self.info.identifier
    }

    /// Search query used to resolve this track on `platform`
    pub fn search_query(&self, platform: &str) -> String {
        if self.info.author.is_empty() {
            format!("{}:{}", platform, self.info.title)
        } else {
            format!("{}:{} - {}", platform, self.info.author, self.info.title)
        }
    }

    /// Picks the candidate that best stands for this track.
    ///
    /// Prefers a candidate by the same author whose length is within two
    /// seconds, then falls back to the first candidate. The returned track
    /// keeps this track's requester and user data.
    pub fn best_match(&self, candidates: &[Track]) -> Option<Track> {
        let author = self.info.author.to_lowercase();
        let close_enough = |candidate: &&Track| {
            let same_author = !author.is_empty()
                && candidate.info.author.to_lowercase().contains(&author);
            let same_length = self.info.length == 0
                || candidate.info.length.abs_diff(self.info.length) <= MATCH_LENGTH_TOLERANCE_MS;
            same_author && same_length
        };

        let chosen = candidates
            .iter()
            .find(close_enough)
            .or_else(|| candidates.first())?;

        let mut resolved = chosen.clone();
        resolved.requester = self.requester.clone();
        if !self.user_data.is_null() {
            resolved.user_data = self.user_data.clone();
        }
        Some(resolved)
    }
}
