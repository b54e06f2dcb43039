//! Client REST d'un node
//!
//! One [`RestClient`] per node. It authenticates every call, parses bodies
//! (JSON, plain text, or nothing for `204`), keeps successful GET bodies in a
//! TTL cache and coalesces identical requests already in flight: a second
//! caller asking for the same method, path and body waits on the first
//! caller's request instead of issuing its own.

mod cache;

pub use cache::{CachePolicy, ResponseCache};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::{LinkOptions, NodeConfig, RestVersion};
use crate::errors::{LinkError, RestError, Result};
use crate::model::{LoadResult, NodeInfo, NodeStats, Track};

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

type ResponseFuture = BoxFuture<'static, std::result::Result<Option<Value>, RestError>>;

struct InFlight {
    id: u64,
    future: Shared<ResponseFuture>,
}

/// Client HTTP authentifié pour un node
pub struct RestClient {
    node: String,
    http: Client,
    base_url: String,
    password: String,
    version: RestVersion,
    timeout: Duration,
    session_id: RwLock<Option<String>>,
    cache: ResponseCache,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_request_id: AtomicU64,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("node", &self.node)
            .field("base_url", &self.base_url)
            .field("version", &self.version)
            .finish()
    }
}

/// Builder for a [`RestClient`]
#[derive(Debug)]
pub struct RestClientBuilder {
    node: String,
    base_url: String,
    password: String,
    version: RestVersion,
    timeout: Duration,
    client: Option<Client>,
}

impl RestClientBuilder {
    pub fn new(base_url: impl Into<String>, password: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            node: base_url.clone(),
            base_url,
            password: password.into(),
            version: RestVersion::V4,
            timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            client: None,
        }
    }

    /// Name used in logs and errors
    pub fn node_name(mut self, name: impl Into<String>) -> Self {
        self.node = name.into();
        self
    }

    pub fn version(mut self, version: RestVersion) -> Self {
        self.version = version;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set a custom HTTP client
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> Result<RestClient> {
        let http = match self.client {
            Some(client) => client,
            None => Client::builder()
                .timeout(self.timeout)
                .build()
                .map_err(|e| LinkError::config(format!("cannot build HTTP client: {e}")))?,
        };

        Ok(RestClient {
            node: self.node,
            http,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            password: self.password,
            version: self.version,
            timeout: self.timeout,
            session_id: RwLock::new(None),
            cache: ResponseCache::new(),
            in_flight: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
        })
    }
}

impl RestClient {
    pub fn builder(base_url: impl Into<String>, password: impl Into<String>) -> RestClientBuilder {
        RestClientBuilder::new(base_url, password)
    }

    pub(crate) fn for_node(config: &NodeConfig, options: &LinkOptions) -> Result<Self> {
        let client = Self::builder(config.rest_url(), config.password.clone())
            .node_name(config.display_name())
            .version(options.rest_version)
            .timeout(options.rest_timeout())
            .build()?;
        client.set_session_id(config.session_id.clone());
        Ok(client)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn version(&self) -> RestVersion {
        self.version
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn set_session_id(&self, session_id: Option<String>) {
        *self.session_id.write() = session_id;
    }

    /// Vide le cache des réponses
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Issues a request, serving GETs from the cache when possible.
    ///
    /// Returns `None` for empty bodies, a JSON value for JSON bodies and a
    /// string value for anything else.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> std::result::Result<Option<Value>, RestError> {
        self.send(method, path, body, true).await
    }

    /// Same as [`request`](Self::request) but never reads the cache
    pub async fn request_fresh(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> std::result::Result<Option<Value>, RestError> {
        self.send(method, path, body, false).await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        use_cache: bool,
    ) -> std::result::Result<Option<Value>, RestError> {
        let key = format!(
            "{}:{}:{}",
            method,
            path,
            body.as_ref().map(Value::to_string).unwrap_or_default()
        );
        let cache_policy = (method == Method::GET).then(|| CachePolicy::for_path(path));

        if use_cache {
            if let Some(policy) = cache_policy {
                if let Some(hit) = self.cache.get(policy, &key).await {
                    debug!(node = %self.node, "cache hit for {}", key);
                    return Ok(Some(hit));
                }
            }
        }

        let (id, future) = self.join_or_start(&key, method, path, body);
        let result = future.await;
        self.finish(&key, id);

        if let (Some(policy), Ok(Some(value))) = (cache_policy, &result) {
            self.cache.put(policy, key, value.clone()).await;
        }
        result
    }

    fn join_or_start(
        &self,
        key: &str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> (u64, Shared<ResponseFuture>) {
        let mut in_flight = self.in_flight.lock();
        if let Some(existing) = in_flight.get(key) {
            debug!(node = %self.node, "joining in-flight request {}", key);
            return (existing.id, existing.future.clone());
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let future = execute(
            self.http.clone(),
            method,
            format!("{}{}", self.base_url, path),
            self.password.clone(),
            body,
            self.timeout,
            self.node.clone(),
        )
        .boxed()
        .shared();

        in_flight.insert(
            key.to_string(),
            InFlight {
                id,
                future: future.clone(),
            },
        );
        (id, future)
    }

    fn finish(&self, key: &str, id: u64) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(key).is_some_and(|f| f.id == id) {
            in_flight.remove(key);
        }
    }

    fn wrap(&self, err: RestError) -> LinkError {
        LinkError::rest(self.node.clone(), err)
    }

    fn decode<T: DeserializeOwned>(&self, value: Option<Value>) -> Result<T> {
        serde_json::from_value(value.unwrap_or(Value::Null))
            .map_err(|e| self.wrap(RestError::Decode(e.to_string())))
    }

    fn session_path(&self) -> Result<String> {
        let session_id = self
            .session_id()
            .ok_or_else(|| self.wrap(RestError::NoSession))?;
        Ok(format!("/{}/sessions/{}", self.version.as_str(), session_id))
    }

    fn versioned(&self, path: &str) -> String {
        format!("/{}{}", self.version.as_str(), path)
    }

    // ============ Players ============

    /// PATCH de l'état d'un player
    pub async fn update_player(&self, guild_id: &str, payload: &Value, no_replace: bool) -> Result<Option<Value>> {
        let path = format!(
            "{}/players/{}?noReplace={}",
            self.session_path()?,
            guild_id,
            no_replace
        );
        self.request(Method::PATCH, &path, Some(payload.clone()))
            .await
            .map_err(|e| self.wrap(e))
    }

    pub async fn destroy_player(&self, guild_id: &str) -> Result<()> {
        let path = format!("{}/players/{}", self.session_path()?, guild_id);
        self.request(Method::DELETE, &path, None)
            .await
            .map(|_| ())
            .map_err(|e| self.wrap(e))
    }

    /// Live player list, never cached
    pub async fn get_players(&self) -> Result<Vec<Value>> {
        let path = format!("{}/players", self.session_path()?);
        let value = self
            .request_fresh(Method::GET, &path, None)
            .await
            .map_err(|e| self.wrap(e))?;
        self.decode(value)
    }

    /// Configures session resuming on the node
    pub async fn update_session(&self, resuming: bool, timeout_secs: u64) -> Result<Option<Value>> {
        let body = match self.version {
            RestVersion::V4 => json!({ "resuming": resuming, "timeout": timeout_secs }),
            RestVersion::V3 => {
                let resuming_key = if resuming { self.session_id() } else { None };
                json!({ "resumingKey": resuming_key, "timeout": timeout_secs })
            }
        };
        let path = self.session_path()?;
        self.request(Method::PATCH, &path, Some(body))
            .await
            .map_err(|e| self.wrap(e))
    }

    // ============ Tracks ============

    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        let path = self.versioned(&format!("/loadtracks?identifier={}", encode(identifier)));
        let value = self
            .request(Method::GET, &path, None)
            .await
            .map_err(|e| self.wrap(e))?;
        match value {
            Some(value) => {
                LoadResult::from_value(value).map_err(|e| self.wrap(RestError::Decode(e)))
            }
            None => Ok(LoadResult::empty()),
        }
    }

    pub async fn decode_track(&self, encoded: &str) -> Result<Track> {
        let path = self.versioned(&format!("/decodetrack?encodedTrack={}", encode(encoded)));
        let value = self
            .request(Method::GET, &path, None)
            .await
            .map_err(|e| self.wrap(e))?;
        let mut track: Track = self.decode(value)?;
        if track.encoded.is_none() {
            track.encoded = Some(encoded.to_string());
        }
        Ok(track)
    }

    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<Track>> {
        let path = self.versioned("/decodetracks");
        let value = self
            .request(Method::POST, &path, Some(json!(encoded)))
            .await
            .map_err(|e| self.wrap(e))?;
        self.decode(value)
    }

    // ============ Node ============

    /// Statistiques courantes, jamais servies depuis le cache
    pub async fn get_stats(&self) -> Result<NodeStats> {
        let value = self
            .request_fresh(Method::GET, &self.versioned("/stats"), None)
            .await
            .map_err(|e| self.wrap(e))?;
        self.decode(value)
    }

    pub async fn get_info(&self) -> Result<NodeInfo> {
        let value = self
            .request(Method::GET, &self.versioned("/info"), None)
            .await
            .map_err(|e| self.wrap(e))?;
        self.decode(value)
    }

    /// Reads `/info` from the node itself, refreshing the cached copy
    pub async fn fetch_info(&self) -> Result<NodeInfo> {
        let value = self
            .request_fresh(Method::GET, &self.versioned("/info"), None)
            .await
            .map_err(|e| self.wrap(e))?;
        self.decode(value)
    }

    pub async fn get_version(&self) -> Result<String> {
        let value = self
            .request(Method::GET, "/version", None)
            .await
            .map_err(|e| self.wrap(e))?;
        Ok(match value {
            Some(Value::String(version)) => version,
            Some(other) => other.to_string(),
            None => String::new(),
        })
    }

    /// Lyrics of a track, provided by the lavalyrics plugin
    pub async fn lyrics(&self, encoded: &str, skip_track_source: bool) -> Result<Option<Value>> {
        let path = format!(
            "/v4/lyrics?track={}&skipTrackSource={}",
            encode(encoded),
            skip_track_source
        );
        self.request(Method::GET, &path, None)
            .await
            .map_err(|e| self.wrap(e))
    }
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

async fn execute(
    http: Client,
    method: Method,
    url: String,
    password: String,
    body: Option<Value>,
    timeout: Duration,
    node: String,
) -> std::result::Result<Option<Value>, RestError> {
    debug!(node = %node, "{} {}", method, url);

    let mut request = http
        .request(method, &url)
        .header(AUTHORIZATION, password)
        .timeout(timeout);
    if let Some(body) = &body {
        request = request.json(body);
    }

    let response = request.send().await.map_err(|e| {
        warn!(node = %node, error = %e, "request to {} failed", url);
        RestError::from_reqwest(e, timeout)
    })?;
    handle_response(response, timeout, &node).await
}

/// Traite la réponse HTTP
async fn handle_response(
    response: Response,
    timeout: Duration,
    node: &str,
) -> std::result::Result<Option<Value>, RestError> {
    let status = response.status();
    debug!(node = %node, "Response status: {}", status);

    if status == StatusCode::NO_CONTENT {
        return Ok(None);
    }

    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("json"));
    let text = response
        .text()
        .await
        .map_err(|e| RestError::from_reqwest(e, timeout))?;

    if !status.is_success() {
        warn!(node = %node, "API error ({}): {}", status.as_u16(), text);
        return Err(RestError::from_status_code(status.as_u16(), &text));
    }

    if text.trim().is_empty() {
        return Ok(None);
    }
    if is_json {
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| RestError::Decode(e.to_string()))
    } else {
        Ok(Some(Value::String(text)))
    }
}
