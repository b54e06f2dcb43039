//! Tâche de connexion au socket de contrôle d'un node.
//!
//! One task per node. It opens the socket, checks the node capabilities,
//! decodes inbound messages and reconnects with exponential backoff. After
//! `reconnect_tries` consecutive failed attempts the node is destroyed and a
//! single [`NodeSignal::Fatal`] is sent.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

use crate::config::RestVersion;
use crate::model::NodeMessage;

use super::{Node, NodeSignal, NodeState, SessionEvent};

enum SessionOutcome {
    /// Destroyed from outside
    Cancelled,
    /// The socket could not be opened
    ConnectFailed(String),
    /// The node cannot be used at all
    Fatal(String),
    Closed {
        code: Option<u16>,
        reason: String,
        was_ready: bool,
    },
}

pub(super) async fn run(node: Arc<Node>, client_id: String, signals: UnboundedSender<NodeSignal>) {
    let name = node.name().to_string();
    let options = Arc::clone(node.options());
    let mut failures: u32 = 0;

    loop {
        if node.cancel_token().is_cancelled() || !node.set_state(NodeState::Connecting) {
            break;
        }

        match session(&node, &client_id, &signals).await {
            SessionOutcome::Cancelled => break,
            SessionOutcome::Fatal(error) => {
                warn!(node = %name, error = %error, "Node is unusable");
                if node.mark_destroyed() {
                    let _ = signals.send(NodeSignal::Fatal { node: name.clone(), error });
                }
                break;
            }
            SessionOutcome::ConnectFailed(error) => {
                warn!(node = %name, error = %error, "Connection failed");
                let _ = signals.send(NodeSignal::Error {
                    node: name.clone(),
                    error,
                });
            }
            SessionOutcome::Closed {
                code,
                reason,
                was_ready,
            } => {
                if was_ready {
                    failures = 0;
                }
                info!(node = %name, code = ?code, reason = %reason, "Socket closed");
                node.set_state(NodeState::Disconnected);
                let _ = signals.send(NodeSignal::Disconnected {
                    node: name.clone(),
                    code,
                    reason,
                });
            }
        }

        if !options.reconnect {
            node.set_state(NodeState::Disconnected);
            break;
        }

        failures += 1;
        if failures > options.reconnect_tries {
            let error = format!(
                "unable to reconnect after {} attempts",
                options.reconnect_tries
            );
            warn!(node = %name, "{}", error);
            if node.mark_destroyed() {
                let _ = signals.send(NodeSignal::Fatal { node: name.clone(), error });
            }
            break;
        }

        let delay = options.reconnect_delay(failures);
        node.set_reconnect_attempts(failures);
        if !node.set_state(NodeState::Reconnecting) {
            break;
        }
        let _ = signals.send(NodeSignal::Reconnecting {
            node: name.clone(),
            attempt: failures,
            delay,
        });
        debug!(node = %name, attempt = failures, ?delay, "Reconnecting");

        tokio::select! {
            _ = node.cancel_token().cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!(node = %name, "Connection task finished");
}

fn build_request(node: &Node, client_id: &str) -> Result<Request, String> {
    let options = node.options();
    let url = node.config().websocket_url(options.rest_version);
    let mut request = url
        .into_client_request()
        .map_err(|e| format!("invalid socket url: {e}"))?;

    let header = |value: &str| {
        HeaderValue::from_str(value).map_err(|e| format!("invalid header value: {e}"))
    };
    let headers = request.headers_mut();
    headers.insert("Authorization", header(&node.config().password)?);
    headers.insert("User-Id", header(client_id)?);
    headers.insert("Client-Name", header(&options.client_name)?);

    if options.resume {
        if let Some(session_id) = node.session_id() {
            let name = match options.rest_version {
                RestVersion::V4 => "Session-Id",
                RestVersion::V3 => "Resume-Key",
            };
            headers.insert(name, header(&session_id)?);
        }
    }
    Ok(request)
}

async fn session(node: &Arc<Node>, client_id: &str, signals: &UnboundedSender<NodeSignal>) -> SessionOutcome {
    let name = node.name().to_string();
    let request = match build_request(node, client_id) {
        Ok(request) => request,
        Err(error) => return SessionOutcome::Fatal(error),
    };

    let stream = tokio::select! {
        _ = node.cancel_token().cancelled() => return SessionOutcome::Cancelled,
        result = tokio_tungstenite::connect_async(request) => match result {
            Ok((stream, _)) => stream,
            Err(e) => return SessionOutcome::ConnectFailed(e.to_string()),
        },
    };

    if !node.set_state(NodeState::Open) {
        return SessionOutcome::Cancelled;
    }
    let _ = signals.send(NodeSignal::Open { node: name.clone() });

    // Capacités du node
    let info = tokio::select! {
        _ = node.cancel_token().cancelled() => return SessionOutcome::Cancelled,
        info = node.rest().fetch_info() => info,
    };
    match info {
        Ok(info) => node.set_info(info),
        Err(e) if node.options().bypass_info_check => {
            warn!(node = %name, error = %e, "Node info unavailable, capabilities unknown");
        }
        Err(e) => return SessionOutcome::Fatal(format!("cannot read node info: {e}")),
    }

    let (mut write, mut read) = stream.split();
    let mut was_ready = false;

    loop {
        tokio::select! {
            _ = node.cancel_token().cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return SessionOutcome::Cancelled;
            }
            message = read.next() => match message {
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                        .unwrap_or((None, String::new()));
                    return SessionOutcome::Closed { code, reason, was_ready };
                }
                Some(Ok(message)) if message.is_text() => {
                    if let Ok(text) = message.to_text() {
                        if handle_text(node, text, signals).await {
                            was_ready = true;
                        }
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return SessionOutcome::Closed {
                        code: None,
                        reason: e.to_string(),
                        was_ready,
                    };
                }
                None => {
                    return SessionOutcome::Closed {
                        code: None,
                        reason: "connection closed".to_string(),
                        was_ready,
                    };
                }
            },
        }
    }
}

/// Returns `true` when the message put the node in `Ready`
async fn handle_text(node: &Arc<Node>, text: &str, signals: &UnboundedSender<NodeSignal>) -> bool {
    let name = node.name().to_string();
    let message = match NodeMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(node = %name, error = %e, "Malformed message from node");
            let _ = signals.send(NodeSignal::Error {
                node: name,
                error: format!("malformed message: {e}"),
            });
            return false;
        }
    };

    match message {
        NodeMessage::Ready {
            session_id,
            resumed,
        } => {
            if node.apply_ready(&session_id) {
                debug!(node = %name, session_id = %session_id, "New session id");
            }
            info!(node = %name, resumed, "Node ready");
            let _ = signals.send(NodeSignal::Ready {
                node: name,
                session_id,
                resumed,
            });
            if node.options().resume {
                // Hors de la boucle de lecture du socket
                tokio::spawn(configure_resuming(Arc::clone(node)));
            }
            true
        }
        NodeMessage::Stats(stats) => {
            node.apply_stats(stats);
            false
        }
        NodeMessage::PlayerUpdate { guild_id, state } => {
            let _ = signals.send(NodeSignal::Session {
                node: name,
                guild_id,
                event: SessionEvent::PlayerUpdate(state),
            });
            false
        }
        NodeMessage::Event(event) => {
            let _ = signals.send(NodeSignal::Session {
                node: name,
                guild_id: event.guild_id().to_string(),
                event: SessionEvent::Track(event),
            });
            false
        }
    }
}

async fn configure_resuming(node: Arc<Node>) {
    let timeout = node.options().resume_timeout_secs;
    tokio::select! {
        _ = node.cancel_token().cancelled() => {}
        result = node.rest().update_session(true, timeout) => {
            if let Err(e) = result {
                warn!(node = %node.name(), error = %e, "Cannot configure session resuming");
            }
        }
    }
}
