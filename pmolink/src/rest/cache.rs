//! Cache en mémoire des réponses GET
//!
//! Read-through only: the REST client looks entries up before issuing a GET
//! and stores successful GET bodies afterwards. Mutating verbs never touch it.

use std::time::Duration;

use moka::future::Cache as MokaCache;
use serde_json::Value;

/// Which TTL bucket a GET response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Generic data (30 secondes)
    Generic,
    /// Track searches and decodes (5 minutes)
    Tracks,
    /// Node capabilities (1 minute)
    Info,
}

impl CachePolicy {
    pub fn for_path(path: &str) -> Self {
        let route = path.split('?').next().unwrap_or(path);
        if route.ends_with("/loadtracks") || route.ends_with("/decodetrack") {
            CachePolicy::Tracks
        } else if route.ends_with("/info") || route == "/version" {
            CachePolicy::Info
        } else {
            CachePolicy::Generic
        }
    }
}

#[derive(Clone)]
pub struct ResponseCache {
    generic: MokaCache<String, Value>,
    tracks: MokaCache<String, Value>,
    info: MokaCache<String, Value>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::with_capacity(500)
    }

    pub fn with_capacity(max_capacity: u64) -> Self {
        Self {
            generic: MokaCache::builder()
                .max_capacity(max_capacity)
                .time_to_live(Duration::from_secs(30))
                .build(),
            tracks: MokaCache::builder()
                .max_capacity(max_capacity * 2)
                .time_to_live(Duration::from_secs(300))
                .build(),
            info: MokaCache::builder()
                .max_capacity(16)
                .time_to_live(Duration::from_secs(60))
                .build(),
        }
    }

    fn bucket(&self, policy: CachePolicy) -> &MokaCache<String, Value> {
        match policy {
            CachePolicy::Generic => &self.generic,
            CachePolicy::Tracks => &self.tracks,
            CachePolicy::Info => &self.info,
        }
    }

    pub async fn get(&self, policy: CachePolicy, key: &str) -> Option<Value> {
        self.bucket(policy).get(key).await
    }

    pub async fn put(&self, policy: CachePolicy, key: String, value: Value) {
        self.bucket(policy).insert(key, value).await;
    }

    /// Vide toutes les entrées
    pub fn clear(&self) {
        self.generic.invalidate_all();
        self.tracks.invalidate_all();
        self.info.invalidate_all();
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_policy_for_path() {
        assert_eq!(
            CachePolicy::for_path("/v4/loadtracks?identifier=ytsearch%3Aa"),
            CachePolicy::Tracks
        );
        assert_eq!(CachePolicy::for_path("/v4/decodetrack?encodedTrack=x"), CachePolicy::Tracks);
        assert_eq!(CachePolicy::for_path("/v4/info"), CachePolicy::Info);
        assert_eq!(CachePolicy::for_path("/version"), CachePolicy::Info);
        assert_eq!(CachePolicy::for_path("/v4/stats"), CachePolicy::Generic);
    }

    #[tokio::test]
    async fn test_buckets_are_separate() {
        let cache = ResponseCache::new();
        cache.put(CachePolicy::Tracks, "k".into(), json!(1)).await;

        assert_eq!(cache.get(CachePolicy::Tracks, "k").await, Some(json!(1)));
        assert_eq!(cache.get(CachePolicy::Generic, "k").await, None);

        cache.clear();
        assert_eq!(cache.get(CachePolicy::Tracks, "k").await, None);
    }
}
