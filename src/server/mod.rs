//! Conference server implementation
//!
//! The supervisor owns the six endpoints and the worker lifecycle; the other
//! modules each own one plane:
//!
//! - **Control/chat** (TCP): registration, roster, chat, notifications
//! - **Video** (UDP): opaque-frame fan-out
//! - **Audio** (UDP): windowed mixing with loopback suppression
//! - **Screen** (TCP + UDP): presenter arbitration and frame fan-out
//! - **File** (TCP): in-memory catalog with streamed transfers

pub mod audio;
pub mod chat;
pub mod control;
pub mod files;
pub mod registry;
pub mod screen;
pub mod supervisor;
pub mod video;

pub use audio::AudioMixer;
pub use chat::{ChatRouter, SystemEvent};
pub use files::FileCatalog;
pub use registry::{Plane, SessionRegistry};
pub use screen::{PresenterArbiter, ScreenRouter};
pub use supervisor::ConferenceServer;
pub use video::VideoRouter;

use std::sync::Arc;

use tracing::debug;

use crate::config::ServerConfig;
use crate::stats::ServerStats;

/// Shared state wired through every plane
#[derive(Debug)]
pub struct ServerState {
    pub config: ServerConfig,
    pub stats: Arc<ServerStats>,
    pub registry: Arc<SessionRegistry>,
    pub chat: Arc<ChatRouter>,
    pub catalog: Arc<FileCatalog>,
    pub arbiter: Arc<PresenterArbiter>,
    pub mixer: Arc<AudioMixer>,
    pub video: Arc<VideoRouter>,
    pub screen: Arc<ScreenRouter>,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let stats = Arc::new(ServerStats::new());
        let registry = Arc::new(SessionRegistry::new(&config));
        let chat = Arc::new(ChatRouter::new(Arc::clone(&registry)));
        let arbiter = Arc::new(PresenterArbiter::new(Arc::clone(&chat)));
        let mixer = Arc::new(AudioMixer::new(
            Arc::clone(&registry),
            Arc::clone(&stats),
            config.audio_stale_after,
        ));
        let video = Arc::new(VideoRouter::new(Arc::clone(&registry), Arc::clone(&stats)));
        let screen = Arc::new(ScreenRouter::new(
            Arc::clone(&registry),
            Arc::clone(&arbiter),
            Arc::clone(&stats),
            config.max_screen_datagram,
        ));
        Arc::new(Self {
            config,
            stats,
            registry,
            chat,
            catalog: Arc::new(FileCatalog::new()),
            arbiter,
            mixer,
            video,
            screen,
        })
    }

    /// Remove a participant and cascade the cleanup across every plane
    ///
    /// Idempotent: only the call that actually removes the registry entry
    /// runs the cascade and announces the departure.
    pub async fn remove_participant(&self, id: u32) {
        let Some(participant) = self.registry.remove(id).await else {
            return;
        };
        self.video.remove(id).await;
        self.screen.remove(id).await;
        self.mixer.remove(id).await;
        self.arbiter.vacate(id).await;
        let _ = self
            .chat
            .emit_system(SystemEvent::Leave {
                username: participant.username.clone(),
            })
            .await;
        let _ = self.chat.emit_system(SystemEvent::RosterUpdate).await;
        debug!(id, "Removal cascade complete");
    }
}
