//! Réaction d'une session aux événements de son node.
//!
//! Handlers never return errors to the node connection: failures are
//! reported on the event bus as [`LinkEvent::PlayerError`].

use std::sync::Arc;

use chrono::Utc;
use rand::seq::IndexedRandom;
use tracing::{debug, info, warn};

use crate::errors::{LinkError, Result};
use crate::events::LinkEvent;
use crate::model::{EventTrack, LoopMode, PlayerUpdateState, Track, TrackEndReason, TrackEvent};
use crate::node::SessionEvent;

use super::updates::{PendingUpdate, TrackUpdate};
use super::{Player, SessionState};

/// Voice close codes after which the gateway voice command is sent again
const RECONNECTABLE_CLOSE_CODES: [u16; 2] = [4015, 4009];

impl Player {
    pub(super) async fn handle_event(self: &Arc<Self>, event: SessionEvent) {
        let result = match event {
            SessionEvent::PlayerUpdate(update) => {
                self.on_player_update(update).await;
                Ok(())
            }
            SessionEvent::Track(event) => self.on_track_event(event).await,
        };
        if let Err(e) = result {
            self.report(e);
        }
    }

    fn report(&self, error: LinkError) {
        warn!(guild = %self.guild_id, error = %error, "Session event handling failed");
        self.ctx.events.broadcast(LinkEvent::PlayerError {
            guild_id: self.guild_id.clone(),
            error: error.to_string(),
        });
    }

    async fn on_player_update(&self, update: PlayerUpdateState) {
        let mut state = self.state.lock().await;
        if self.is_destroyed() {
            return;
        }
        state.position = update.position;
        state.position_at = Some(Utc::now());
        state.ping = update.ping;
        if !update.connected && state.voice.connected {
            debug!(guild = %self.guild_id, "Node reports the voice connection as down");
        }
        state.record_auto_resume();
    }

    async fn on_track_event(self: &Arc<Self>, event: TrackEvent) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.is_destroyed() {
            return Ok(());
        }

        match event {
            TrackEvent::TrackStartEvent { track, .. } => {
                state.playing = !state.paused;
                if let Some(track) = event_track(&state, track) {
                    info!(guild = %self.guild_id, title = %track.title(), "Track started");
                    self.ctx.events.broadcast(LinkEvent::TrackStart {
                        guild_id: self.guild_id.clone(),
                        track,
                    });
                }
            }
            TrackEvent::TrackEndEvent { track, reason, .. } => {
                self.on_track_end(&mut state, track, reason).await;
            }
            TrackEvent::TrackExceptionEvent { track, exception, .. } => {
                warn!(guild = %self.guild_id, exception = %exception, "Track exception");
                self.ctx.events.broadcast(LinkEvent::TrackError {
                    guild_id: self.guild_id.clone(),
                    track: event_track(&state, track),
                    exception,
                });
            }
            TrackEvent::TrackStuckEvent {
                track,
                threshold_ms,
                ..
            } => {
                warn!(guild = %self.guild_id, threshold_ms, "Track stuck, skipping");
                self.ctx.events.broadcast(LinkEvent::TrackStuck {
                    guild_id: self.guild_id.clone(),
                    track: event_track(&state, track),
                    threshold_ms,
                });
                self.queue_update(PendingUpdate {
                    track: Some(TrackUpdate::Stop),
                    ..PendingUpdate::default()
                });
            }
            TrackEvent::WebSocketClosedEvent {
                code,
                reason,
                by_remote,
                ..
            } => {
                self.on_socket_closed(&mut state, code, reason, by_remote);
            }
        }
        Ok(())
    }

    /// Fin de piste: boucle, piste suivante, autoplay ou fin de file
    async fn on_track_end(
        self: &Arc<Self>,
        state: &mut SessionState,
        track: Option<EventTrack>,
        reason: TrackEndReason,
    ) {
        self.ctx.events.broadcast(LinkEvent::TrackEnd {
            guild_id: self.guild_id.clone(),
            track: event_track(state, track),
            reason,
        });
        if reason == TrackEndReason::Replaced {
            return;
        }

        let Some(finished) = state.current.take() else {
            return;
        };
        state.playing = false;
        state.position = 0;
        state.position_at = None;

        if reason.honours_loop() {
            match state.loop_mode {
                LoopMode::Track => state.queue.push_front(finished.clone()),
                LoopMode::Queue => state.queue.push(finished.clone()),
                LoopMode::None => {}
            }
        } else if reason.is_failure() {
            debug!(guild = %self.guild_id, title = %finished.title(), "Dropping failed track");
        }
        state.history.push(finished.clone());

        self.advance_locked(state, finished).await;
    }

    /// Plays the next playable track, or falls back to autoplay / queue end.
    async fn advance_locked(self: &Arc<Self>, state: &mut SessionState, previous: Track) {
        loop {
            match self.play_next_locked(state).await {
                Ok(Some(_)) => return,
                Ok(None) => break,
                Err(e @ LinkError::Playback(_)) => self.report(e),
                Err(e) => {
                    self.report(e);
                    return;
                }
            }
        }

        if state.autoplay {
            let this = Arc::clone(self);
            self.spawn_task(async move { this.run_autoplay(previous).await });
            return;
        }

        info!(guild = %self.guild_id, "Queue ended");
        self.ctx.events.broadcast(LinkEvent::QueueEnd {
            guild_id: self.guild_id.clone(),
            last_track: Some(previous),
        });
    }

    async fn run_autoplay(self: Arc<Self>, previous: Track) {
        let recommended = self.recommend_after(&previous).await;

        let mut state = self.state.lock().await;
        if self.is_destroyed() {
            return;
        }
        let failure = match recommended {
            Ok(track) => {
                info!(guild = %self.guild_id, title = %track.title(), "Autoplay picked a track");
                state.queue.push(track);
                if state.current.is_some() {
                    return;
                }
                match self.play_next_locked(&mut state).await {
                    Ok(Some(_)) => return,
                    Ok(None) => "autoplay track vanished from the queue".to_string(),
                    Err(e) => e.to_string(),
                }
            }
            Err(reason) => reason,
        };

        warn!(guild = %self.guild_id, reason = %failure, "Autoplay failed");
        self.ctx.events.broadcast(LinkEvent::AutoplayFailed {
            guild_id: self.guild_id.clone(),
            reason: failure,
        });
        self.ctx.events.broadcast(LinkEvent::QueueEnd {
            guild_id: self.guild_id.clone(),
            last_track: Some(previous),
        });
    }

    /// Candidate to play after `previous`, never `previous` itself
    async fn recommend_after(&self, previous: &Track) -> std::result::Result<Track, String> {
        let identifier = self
            .ctx
            .recommender
            .recommend(&previous.info)
            .await
            .map_err(|e| e.to_string())?;
        let result = self
            .node()
            .rest()
            .load_tracks(&identifier)
            .await
            .map_err(|e| e.to_string())?;

        let candidates: Vec<&Track> = result
            .tracks
            .iter()
            .filter(|t| t.is_resolved() && t.identifier() != previous.identifier())
            .collect();
        let picked = {
            let mut rng = rand::rng();
            candidates.choose(&mut rng).map(|t| (*t).clone())
        };

        let mut track =
            picked.ok_or_else(|| format!("no recommendation found after '{}'", previous.title()))?;
        track.requester = previous.requester.clone();
        Ok(track)
    }

    /// Socket vocal fermé côté node
    fn on_socket_closed(
        self: &Arc<Self>,
        state: &mut SessionState,
        code: u16,
        reason: String,
        by_remote: bool,
    ) {
        warn!(guild = %self.guild_id, code, reason = %reason, by_remote, "Voice socket closed");
        self.ctx.events.broadcast(LinkEvent::SocketClosed {
            guild_id: self.guild_id.clone(),
            code,
            reason,
            by_remote,
        });
        state.voice.connected = false;

        if RECONNECTABLE_CLOSE_CODES.contains(&code) {
            if let Some(channel) = state.voice_channel.clone() {
                self.ctx.gateway.send(self.voice_command(state, Some(channel)));
            }
        }

        if state.current.is_none() {
            return;
        }
        if !state.pending_restart {
            state.resume_paused = state.paused;
        }
        state.position = state.live_position();
        state.position_at = Some(Utc::now());
        state.paused = true;
        state.playing = false;
        self.queue_update(PendingUpdate::paused(true));

        if state.auto_resume.enabled {
            state.pending_restart = true;
            state.record_auto_resume();
            let this = Arc::clone(self);
            let delay = self.ctx.options.restart_delay();
            self.spawn_task(async move {
                tokio::time::sleep(delay).await;
                this.retry_restart().await;
            });
        }
    }

    /// Delayed restart after a voice socket drop
    async fn retry_restart(&self) {
        let mut state = self.state.lock().await;
        if self.is_destroyed() || !state.pending_restart {
            return;
        }
        if let Err(e) = self.push_voice_locked(&mut state).await {
            self.report(e);
        }
    }
}

/// Track an event refers to, preferring the session's own copy
fn event_track(state: &SessionState, track: Option<EventTrack>) -> Option<Track> {
    let current = state.current.as_ref();
    match track {
        None => current.cloned(),
        Some(track) => {
            if let Some(current) = current {
                if current.encoded.as_deref() == track.encoded() {
                    return Some(current.clone());
                }
            }
            track.into_track()
        }
    }
}
