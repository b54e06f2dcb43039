//! Recommandation de la piste suivante quand la file est vide.

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::model::TrackInfo;

/// Picks what to play after `previous` once the queue ran dry.
///
/// Returns an identifier the node can load (URL or `platform:query`). Any
/// error simply stops autoplay for the session.
#[async_trait]
pub trait Recommender: Send + Sync {
    async fn recommend(&self, previous: &TrackInfo) -> Result<String>;
}

/// YouTube "radio" mix seeded with the previous video
#[derive(Debug, Clone, Copy, Default)]
pub struct YoutubeMixRecommender;

#[async_trait]
impl Recommender for YoutubeMixRecommender {
    async fn recommend(&self, previous: &TrackInfo) -> Result<String> {
        let is_youtube = matches!(previous.source_name.as_str(), "youtube" | "youtubemusic");
        if !is_youtube || previous.identifier.is_empty() {
            return Err(anyhow!(
                "no recommendation for source '{}'",
                previous.source_name
            ));
        }
        Ok(format!(
            "https://www.youtube.com/watch?v={id}&list=RD{id}",
            id = previous.identifier
        ))
    }
}

/// Never recommends anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRecommender;

#[async_trait]
impl Recommender for NoRecommender {
    async fn recommend(&self, _previous: &TrackInfo) -> Result<String> {
        Err(anyhow!("autoplay recommendations are disabled"))
    }
}
