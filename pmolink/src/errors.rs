//! Gestion des erreurs pour pmolink
//!
//! Two layers: [`RestError`] describes what went wrong with a single HTTP
//! exchange against a node, [`LinkError`] is what every public operation of
//! the crate returns.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Type Result personnalisé pour pmolink
pub type Result<T> = std::result::Result<T, LinkError>;

/// Failure of one REST exchange with a node.
///
/// `Clone` because a coalesced request hands the same outcome to every
/// caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RestError {
    /// Connection refused, reset, DNS failure...
    #[error("transport error: {0}")]
    Transport(String),

    /// No response within the configured timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The node answered with a non-2xx status
    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },

    /// The body could not be turned into the expected type
    #[error("invalid response body: {0}")]
    Decode(String),

    /// Session scoped endpoint called before the node sent `ready`
    #[error("node has no session id yet")]
    NoSession,
}

impl RestError {
    /// Construit une erreur depuis un code de statut HTTP et le corps de la réponse.
    ///
    /// The node usually answers errors with `{"message": "..."}`; anything
    /// else is kept verbatim, and an empty body falls back to the reason phrase.
    pub fn from_status_code(code: u16, body: &str) -> Self {
        let message = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|json| {
                json.get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| body.trim().to_string());

        let message = if message.is_empty() {
            reqwest::StatusCode::from_u16(code)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("Unknown error")
                .to_string()
        } else {
            message
        };

        RestError::Status { code, message }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            RestError::Timeout(timeout)
        } else if err.is_decode() {
            RestError::Decode(err.to_string())
        } else {
            RestError::Transport(err.to_string())
        }
    }

    /// Transport level failure (including timeouts): worth retrying elsewhere
    pub fn is_transport(&self) -> bool {
        matches!(self, RestError::Transport(_) | RestError::Timeout(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RestError::Timeout(_))
    }

    /// Protocol level failure reported by the node itself
    pub fn is_status(&self) -> bool {
        matches!(self, RestError::Status { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            RestError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Erreurs possibles lors de l'utilisation de pmolink
#[derive(Error, Debug)]
pub enum LinkError {
    /// Invalid or missing configuration, never retried
    #[error("Configuration error: {0}")]
    Config(String),

    /// The control socket of a node could not be opened
    #[error("Node {node} unreachable: {message}")]
    Connectivity { node: String, message: String },

    /// A REST call against a node failed
    #[error("Node {node} REST error: {source}")]
    Rest {
        node: String,
        #[source]
        source: RestError,
    },

    /// Malformed message received from a node
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Track resolution or loading failed
    #[error("Playback error: {0}")]
    Playback(String),

    #[error("No connected node available")]
    NoNodesAvailable,

    /// The session has no acknowledged voice connection yet
    #[error("Session {0} is not connected to a voice channel")]
    NotConnected(String),

    /// The node a session is bound to is currently not connected
    #[error("Node {0} is not available")]
    NodeUnavailable(String),

    #[error("Unknown node: {0}")]
    NodeNotFound(String),

    #[error("Session {0} has been destroyed")]
    SessionDestroyed(String),

    #[error("Node {node} does not provide the {plugin} plugin")]
    MissingPlugin { node: String, plugin: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl LinkError {
    pub fn config(message: impl Into<String>) -> Self {
        LinkError::Config(message.into())
    }

    pub fn rest(node: impl Into<String>, source: RestError) -> Self {
        LinkError::Rest {
            node: node.into(),
            source,
        }
    }

    pub fn playback(message: impl Into<String>) -> Self {
        LinkError::Playback(message.into())
    }

    /// Erreurs de disponibilité (aucun node, session non connectée)
    pub fn is_availability(&self) -> bool {
        matches!(
            self,
            LinkError::NoNodesAvailable
                | LinkError::NotConnected(_)
                | LinkError::NodeUnavailable(_)
        )
    }

    /// Returns the underlying REST failure, if any
    pub fn rest_error(&self) -> Option<&RestError> {
        match self {
            LinkError::Rest { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_message_from_json_body() {
        let err = RestError::from_status_code(404, r#"{"status":404,"message":"Session not found"}"#);
        assert_eq!(
            err,
            RestError::Status {
                code: 404,
                message: "Session not found".to_string()
            }
        );
        assert!(err.is_status());
        assert!(!err.is_transport());
    }

    #[test]
    fn test_status_message_from_text_body() {
        let err = RestError::from_status_code(500, "boom\n");
        assert_eq!(err.status(), Some(500));
        assert_eq!(err.to_string(), "HTTP 500: boom");
    }

    #[test]
    fn test_status_message_empty_body() {
        let err = RestError::from_status_code(401, "");
        assert_eq!(err.to_string(), "HTTP 401: Unauthorized");
    }

    #[test]
    fn test_timeout_is_transport() {
        let err = RestError::Timeout(Duration::from_secs(1));
        assert!(err.is_transport());
        assert!(err.is_timeout());
        assert_eq!(err.status(), None);
    }

    #[test]
    fn test_availability() {
        assert!(LinkError::NoNodesAvailable.is_availability());
        assert!(LinkError::NotConnected("1".into()).is_availability());
        assert!(!LinkError::playback("x").is_availability());
    }
}
