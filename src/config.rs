//! Server configuration
//!
//! Defaults follow the documented LAN deployment; every endpoint can be
//! overridden from the environment. Port 0 requests an OS-assigned port,
//! which tests use to avoid collisions.

use std::net::IpAddr;
use std::time::Duration;

/// Audio sample rate in Hz (mono, 16-bit signed little-endian)
pub const SAMPLE_RATE: u32 = 44_100;

/// Samples per audio chunk; one chunk is one mixer tick worth of PCM
pub const CHUNK_SAMPLES: usize = 1024;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface all six endpoints bind to
    pub bind_addr: IpAddr,
    /// Control/chat TCP port
    pub control_port: u16,
    /// Video UDP port
    pub video_port: u16,
    /// Audio UDP port
    pub audio_port: u16,
    /// Screen-control TCP port
    pub screen_control_port: u16,
    /// Screen-data UDP port
    pub screen_data_port: u16,
    /// File-transfer TCP port
    pub file_port: u16,
    /// Maximum concurrent participants
    pub max_users: usize,
    /// Maximum accepted upload size in bytes
    pub max_file_size: usize,
    /// Screen datagrams larger than this are dropped
    pub max_screen_datagram: usize,
    /// Window for the registration line on a new control connection
    pub register_timeout: Duration,
    /// Idle window for each read/write during a file transfer
    pub transfer_idle_timeout: Duration,
    /// Bound on a single control-plane write; exceeding it removes the peer
    pub control_write_timeout: Duration,
    /// A datagram endpoint may be rebound only after this much silence
    pub rebind_grace: Duration,
    /// Audio buckets unrefreshed for this long are evicted
    pub audio_stale_after: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            control_port: 5000,
            video_port: 5001,
            audio_port: 5002,
            screen_control_port: 5003,
            screen_data_port: 5004,
            file_port: 5005,
            max_users: 10,
            max_file_size: 100 * 1024 * 1024,
            max_screen_datagram: 65_000,
            register_timeout: Duration::from_secs(5),
            transfer_idle_timeout: Duration::from_secs(30),
            control_write_timeout: Duration::from_secs(5),
            rebind_grace: Duration::from_secs(5),
            audio_stale_after: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    /// Build a configuration from the environment, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HUDDLE_BIND_ADDR") {
            if let Ok(parsed) = addr.parse::<IpAddr>() {
                config.bind_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HUDDLE_BIND_ADDR, using default");
            }
        }

        env_port("HUDDLE_CONTROL_PORT", &mut config.control_port);
        env_port("HUDDLE_VIDEO_PORT", &mut config.video_port);
        env_port("HUDDLE_AUDIO_PORT", &mut config.audio_port);
        env_port("HUDDLE_SCREEN_CONTROL_PORT", &mut config.screen_control_port);
        env_port("HUDDLE_SCREEN_DATA_PORT", &mut config.screen_data_port);
        env_port("HUDDLE_FILE_PORT", &mut config.file_port);

        if let Ok(val) = std::env::var("HUDDLE_MAX_USERS") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_users = n;
            }
        }

        if let Ok(val) = std::env::var("HUDDLE_MAX_FILE_SIZE") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_file_size = n;
            }
        }

        config
    }

    /// The mixer emission period: one chunk of samples at the fixed rate
    pub fn mixer_tick(&self) -> Duration {
        Duration::from_micros((CHUNK_SAMPLES as u64 * 1_000_000) / SAMPLE_RATE as u64)
    }
}

fn env_port(name: &str, slot: &mut u16) {
    if let Ok(val) = std::env::var(name) {
        if let Ok(port) = val.parse::<u16>() {
            *slot = port;
        } else {
            tracing::warn!(var = name, value = %val, "Invalid port, using default");
        }
    }
}
