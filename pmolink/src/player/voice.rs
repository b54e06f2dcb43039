//! Connexion vocale d'une session
//!
//! The host forwards voice dispatches, the session accumulates them in a
//! [`VoiceConnection`] and hands complete credentials to the node. Playback
//! can only start once the node acknowledged them.

use std::sync::Arc;

use tracing::{debug, info};

use crate::errors::Result;
use crate::gateway::{VoicePacket, VoiceServerUpdate, VoiceStateUpdate};

use super::updates::{PendingUpdate, VoicePayload};
use super::{Player, SessionState};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoiceConnection {
    pub session_id: Option<String>,
    pub token: Option<String>,
    pub endpoint: Option<String>,
    pub channel_id: Option<String>,
    pub self_deaf: bool,
    pub self_mute: bool,
    /// The node accepted the current credentials
    pub connected: bool,
}

impl VoiceConnection {
    /// Returns `true` when the voice session changed
    pub fn apply_state(&mut self, update: &VoiceStateUpdate) -> bool {
        let changed = self.session_id.as_deref() != Some(update.session_id.as_str());
        self.session_id = Some(update.session_id.clone());
        self.channel_id = update.channel_id.clone();
        self.self_deaf = update.self_deaf;
        self.self_mute = update.self_mute;
        changed
    }

    /// Returns `true` when the token or the endpoint changed
    pub fn apply_server(&mut self, update: &VoiceServerUpdate) -> bool {
        let changed = self.token.as_deref() != Some(update.token.as_str())
            || self.endpoint != update.endpoint;
        self.token = Some(update.token.clone());
        self.endpoint = update.endpoint.clone();
        changed
    }

    /// Credentials to forward, once all three parts are known
    pub fn payload(&self) -> Option<VoicePayload> {
        Some(VoicePayload {
            token: self.token.clone()?,
            endpoint: self.endpoint.clone()?,
            session_id: self.session_id.clone()?,
        })
    }

    pub fn reset(&mut self) {
        *self = VoiceConnection {
            self_deaf: self.self_deaf,
            self_mute: self.self_mute,
            ..VoiceConnection::default()
        };
    }
}

impl Player {
    pub(crate) async fn handle_voice(self: &Arc<Self>, packet: VoicePacket) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_usable()?;

        let changed = match &packet {
            VoicePacket::State(update) => {
                if update.channel_id.is_none() {
                    info!(guild = %self.guild_id, "Left voice channel");
                    state.voice.reset();
                    state.voice_channel = None;
                    state.playing = false;
                    return Ok(());
                }
                state.voice_channel = update.channel_id.clone();
                state.voice.apply_state(update)
            }
            VoicePacket::Server(update) => state.voice.apply_server(update),
        };

        if !changed && state.voice.connected {
            return Ok(());
        }
        self.push_voice_locked(&mut state).await
    }

    /// Forwards the voice credentials to the node and replays a pending restart.
    pub(super) async fn push_voice_locked(&self, state: &mut SessionState) -> Result<()> {
        let Some(payload) = state.voice.payload() else {
            debug!(guild = %self.guild_id, "Voice credentials incomplete");
            return Ok(());
        };

        self.send_update_now(PendingUpdate::voice(payload)).await?;
        state.voice.connected = true;
        debug!(guild = %self.guild_id, node = %self.node_name(), "Voice connected");

        if state.pending_restart {
            state.pending_restart = false;
            state.paused = state.resume_paused;
            self.restart_locked(state).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_update(session: &str) -> VoiceStateUpdate {
        VoiceStateUpdate {
            guild_id: "1".into(),
            user_id: "bot".into(),
            session_id: session.into(),
            channel_id: Some("c".into()),
            self_deaf: true,
            self_mute: false,
        }
    }

    #[test]
    fn test_payload_requires_all_parts() {
        let mut voice = VoiceConnection::default();
        assert!(voice.apply_state(&state_update("s1")));
        assert!(voice.payload().is_none());

        assert!(voice.apply_server(&VoiceServerUpdate {
            guild_id: "1".into(),
            token: "tok".into(),
            endpoint: Some("eu.discord.media:443".into()),
        }));
        let payload = voice.payload().unwrap();
        assert_eq!(payload.session_id, "s1");
        assert_eq!(payload.endpoint, "eu.discord.media:443");
    }

    #[test]
    fn test_unchanged_updates() {
        let mut voice = VoiceConnection::default();
        voice.apply_state(&state_update("s1"));
        assert!(!voice.apply_state(&state_update("s1")));
        assert!(voice.apply_state(&state_update("s2")));
    }

    #[test]
    fn test_reset_keeps_flags() {
        let mut voice = VoiceConnection::default();
        voice.apply_state(&state_update("s1"));
        voice.connected = true;
        voice.reset();
        assert!(voice.self_deaf);
        assert!(!voice.connected);
        assert!(voice.session_id.is_none());
    }
}
