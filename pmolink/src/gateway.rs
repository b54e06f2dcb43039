//! Voice signaling boundary with the host application.
//!
//! Outbound: the runtime asks the host to join, move or leave a voice
//! channel through [`VoiceGateway::send`]. Inbound: the host forwards the
//! raw `VOICE_STATE_UPDATE` / `VOICE_SERVER_UPDATE` dispatches, parsed by
//! [`VoicePacket::from_gateway`].

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Gateway opcode for voice state updates
pub const VOICE_STATE_OP: u8 = 4;

/// Request to change the bot's voice state in one guild
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceCommand {
    pub guild_id: String,
    /// `None` leaves the channel
    pub channel_id: Option<String>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl VoiceCommand {
    pub fn to_payload(&self) -> Value {
        json!({
            "op": VOICE_STATE_OP,
            "d": {
                "guild_id": self.guild_id,
                "channel_id": self.channel_id,
                "self_mute": self.self_mute,
                "self_deaf": self.self_deaf,
            }
        })
    }
}

/// Le transport de signalisation vocale de l'application hôte
pub trait VoiceGateway: Send + Sync {
    fn send(&self, command: VoiceCommand);
}

impl<F> VoiceGateway for F
where
    F: Fn(VoiceCommand) + Send + Sync,
{
    fn send(&self, command: VoiceCommand) {
        self(command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    pub guild_id: String,
    pub user_id: String,
    pub session_id: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub self_deaf: bool,
    #[serde(default)]
    pub self_mute: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceServerUpdate {
    pub guild_id: String,
    pub token: String,
    /// Absent while the voice server is being reallocated
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Inbound voice dispatch routed to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoicePacket {
    State(VoiceStateUpdate),
    Server(VoiceServerUpdate),
}

impl VoicePacket {
    /// Parses a raw gateway dispatch (`{"t": ..., "d": {...}}`).
    ///
    /// Returns `None` for unrelated or malformed dispatches.
    pub fn from_gateway(packet: &Value) -> Option<Self> {
        let data = packet.get("d")?.clone();
        match packet.get("t")?.as_str()? {
            "VOICE_STATE_UPDATE" => serde_json::from_value(data).ok().map(VoicePacket::State),
            "VOICE_SERVER_UPDATE" => serde_json::from_value(data).ok().map(VoicePacket::Server),
            _ => None,
        }
    }

    pub fn guild_id(&self) -> &str {
        match self {
            VoicePacket::State(state) => &state.guild_id,
            VoicePacket::Server(server) => &server.guild_id,
        }
    }
}
