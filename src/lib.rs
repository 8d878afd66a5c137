//! Huddle - LAN Conferencing Server
//!
//! This library implements the server side of a LAN conferencing session:
//! roster management and chat over a reliable control plane, best-effort
//! video fan-out, windowed audio mixing with loopback suppression, exclusive
//! screen sharing with presenter arbitration, and an in-memory shared-file
//! catalog.
//!
//! ## Endpoint layout
//!
//! Six endpoints on one host interface:
//!
//! - **Control/Chat** (TCP): registration, roster, chat, notifications
//! - **Video** (UDP): opaque frames in, fan-out to every other participant
//! - **Audio** (UDP): PCM chunks in, per-recipient mixes out
//! - **Screen control** (TCP): presenter request/release
//! - **Screen data** (UDP): presenter frames, fanned out to subscribers
//! - **File** (TCP): one upload/download/delete command per connection
//!
//! Media payloads are opaque; the server never decodes a frame. Only chat,
//! file commands, and raw PCM audio are parsed.
//!
//! ## Example
//!
//! ```rust,ignore
//! use huddle::{ConferenceServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = ConferenceServer::start(ServerConfig::default()).await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod stats;

pub use config::{CHUNK_SAMPLES, SAMPLE_RATE, ServerConfig};
pub use error::{Result, ServerError};
pub use server::supervisor::{ConferenceServer, EndpointAddrs};
pub use server::{
    AudioMixer, ChatRouter, FileCatalog, Plane, PresenterArbiter, ScreenRouter, ServerState,
    SessionRegistry, SystemEvent, VideoRouter,
};
pub use stats::{ServerStats, StatsSnapshot};

/// Wall-clock `HH:MM:SS`, used for chat lines and file metadata
pub fn wall_clock_hms() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}
