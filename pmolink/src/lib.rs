//! # pmolink - Client pour une flotte de nodes audio
//!
//! Cette crate pilote des nodes audio distants (socket de contrôle WebSocket
//! + API REST versionnée v3/v4) et maintient une session de lecture par
//! guild, avec bascule automatique quand un node tombe.
//!
//! ## Vue d'ensemble
//!
//! - Registre de nodes avec score de santé mis en cache
//! - Connexion par node : handshake, reprise de session, reconnexion avec backoff
//! - Client REST avec cache TTL et fusion des requêtes identiques en vol
//! - Sessions : file d'attente, boucles, autoplay, mises à jour regroupées
//! - Sauvegarde/restauration de toutes les sessions
//!
//! ## Architecture
//!
//! ```text
//! pmolink/
//! ├── src/
//! │   ├── lib.rs              # Module principal (ce fichier)
//! │   ├── manager.rs          # LinkManager, dispatcher, résolution
//! │   ├── persistence.rs      # save_state / load_state
//! │   ├── registry.rs         # Registre des nodes, sélection
//! │   ├── node/               # Node, socket de contrôle, santé
//! │   ├── rest/               # Client REST, cache
//! │   ├── player/             # Sessions de lecture
//! │   ├── model/              # Pistes, file, stats, filtres, protocole
//! │   ├── gateway.rs          # Signalisation vocale avec l'hôte
//! │   ├── autoplay.rs         # Recommandations
//! │   ├── plugin.rs           # Extensions
//! │   ├── events.rs           # Bus d'événements
//! │   ├── config.rs           # Configuration YAML
//! │   ├── logging.rs          # Subscriber tracing
//! │   └── errors.rs           # Gestion des erreurs
//! ```
//!
//! ## Utilisation
//!
//! ```rust,no_run
//! use pmolink::{LinkConfig, LinkManager, SessionOptions, VoiceCommand};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LinkConfig::load(None::<&str>)?;
//!     let manager = LinkManager::new(config, |command: VoiceCommand| {
//!         // Envoyer command.to_payload() sur la gateway de l'application
//!         println!("{}", command.to_payload());
//!     })?;
//!     manager.init("123456789").await?;
//!
//!     let mut events = manager.subscribe();
//!     let player = manager
//!         .create_session(SessionOptions::new("42").voice_channel("1001"))
//!         .await?;
//!
//!     let result = manager.search("never gonna give you up", None).await?;
//!     if let Some(track) = result.tracks.into_iter().next() {
//!         player.add(track).await;
//!     }
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod autoplay;
pub mod config;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod logging;
pub mod manager;
pub mod model;
pub mod node;
mod persistence;
pub mod player;
pub mod plugin;
pub mod registry;
pub mod rest;

pub use autoplay::{NoRecommender, Recommender, YoutubeMixRecommender};
pub use config::{HistoryPolicy, LinkConfig, LinkOptions, NodeConfig, RestVersion};
pub use errors::{LinkError, RestError, Result};
pub use events::{EventBus, LinkEvent};
pub use gateway::{VoiceCommand, VoiceGateway, VoicePacket, VoiceServerUpdate, VoiceStateUpdate};
pub use logging::init_logging;
pub use manager::{LinkManager, ResolveQuery};
pub use model::{Filters, LoadResult, LoadType, LoopMode, Queue, Track, TrackEndReason, TrackInfo};
pub use node::health::{NodeHealth, SystemHealth};
pub use node::{Node, NodeState};
pub use player::{Player, PlayerSnapshot, PlayerStatus, SessionOptions};
pub use plugin::Plugin;
pub use registry::NodeRegistry;
pub use rest::RestClient;
