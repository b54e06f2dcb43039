//! Sauvegarde et restauration de la table des sessions.
//!
//! The file is a pretty printed JSON object mapping guild ids to
//! [`PlayerSnapshot`]s.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::events::LinkEvent;
use crate::manager::LinkManager;
use crate::player::{Player, PlayerSnapshot};

impl LinkManager {
    /// Writes every live session to `path`. Returns the number of sessions saved.
    pub async fn save_state(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let mut table = BTreeMap::new();
        for player in self.players() {
            if player.is_destroyed() {
                continue;
            }
            table.insert(player.guild_id().to_string(), player.to_snapshot().await);
        }

        let json = serde_json::to_string_pretty(&table)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, json).await?;

        info!(path = %path.display(), sessions = table.len(), "Session state saved");
        Ok(table.len())
    }

    /// Rebuilds the sessions saved in `path`.
    ///
    /// A missing file restores nothing. Each session is bound to the best
    /// connected node for its region and asks the host to rejoin its voice
    /// channel; playback restarts once voice is connected. Live sessions
    /// are left untouched, and sessions no node can host are skipped: the
    /// returned count only covers the sessions actually restored.
    pub async fn load_state(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "No saved session state");
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };
        let table: BTreeMap<String, PlayerSnapshot> = serde_json::from_str(&text)?;

        let mut restored = 0;
        for (guild_id, mut snapshot) in table {
            snapshot.guild_id = guild_id;

            let player = {
                let mut players = self.inner.players.write();
                if players
                    .get(&snapshot.guild_id)
                    .is_some_and(|existing| !existing.is_destroyed())
                {
                    debug!(guild = %snapshot.guild_id, "Session already exists, skipping");
                    continue;
                }
                let registry = &self.inner.registry;
                let node = match &snapshot.region {
                    Some(region) => registry.best_for_region(region),
                    None => registry.least_loaded().into_iter().next(),
                };
                let Some(node) = node else {
                    warn!(guild = %snapshot.guild_id, "No connected node, session not restored");
                    continue;
                };

                let player = Player::restore(snapshot, node, self.inner.player_context());
                players.insert(player.guild_id().to_string(), Arc::clone(&player));
                player
            };

            self.inner.events.broadcast(LinkEvent::PlayerCreate {
                guild_id: player.guild_id().to_string(),
                node: player.node_name(),
            });
            if player.voice_channel().await.is_some() {
                if let Err(e) = player.connect().await {
                    warn!(guild = %player.guild_id(), error = %e, "Cannot rejoin voice channel");
                }
            }
            restored += 1;
        }

        info!(path = %path.display(), sessions = restored, "Session state restored");
        Ok(restored)
    }
}
