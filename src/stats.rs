//! Packet and delivery counters
//!
//! Media planes never report failures to peers; dropped or failed traffic is
//! tallied here instead.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters, updated with relaxed ordering on hot paths
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Video datagrams that could not be attributed to a live participant
    pub video_unattributed: AtomicU64,
    /// Video datagrams fanned out (one count per recipient)
    pub video_forwarded: AtomicU64,
    /// Video fan-out sends that failed
    pub video_send_failures: AtomicU64,
    /// Audio datagrams dropped for an invalid chunk length
    pub audio_dropped_len: AtomicU64,
    /// Audio datagrams that could not be attributed to a live participant
    pub audio_unattributed: AtomicU64,
    /// Per-recipient mixes emitted
    pub mixes_sent: AtomicU64,
    /// Screen datagrams shorter than the id header
    pub screen_dropped_len: AtomicU64,
    /// Screen datagrams that could not be attributed to a live participant
    pub screen_unattributed: AtomicU64,
    /// Screen frames from a publisher that is not the current presenter
    pub screen_not_presenter: AtomicU64,
    /// Screen datagrams over the configured size ceiling
    pub screen_oversized: AtomicU64,
    /// Screen frames fanned out (one count per recipient)
    pub screen_forwarded: AtomicU64,
    /// Datagram packets refused because their endpoint rebind was within grace
    pub rebinds_refused: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub video_unattributed: u64,
    pub video_forwarded: u64,
    pub video_send_failures: u64,
    pub audio_dropped_len: u64,
    pub audio_unattributed: u64,
    pub mixes_sent: u64,
    pub screen_dropped_len: u64,
    pub screen_unattributed: u64,
    pub screen_not_presenter: u64,
    pub screen_oversized: u64,
    pub screen_forwarded: u64,
    pub rebinds_refused: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            video_unattributed: self.video_unattributed.load(Ordering::Relaxed),
            video_forwarded: self.video_forwarded.load(Ordering::Relaxed),
            video_send_failures: self.video_send_failures.load(Ordering::Relaxed),
            audio_dropped_len: self.audio_dropped_len.load(Ordering::Relaxed),
            audio_unattributed: self.audio_unattributed.load(Ordering::Relaxed),
            mixes_sent: self.mixes_sent.load(Ordering::Relaxed),
            screen_dropped_len: self.screen_dropped_len.load(Ordering::Relaxed),
            screen_unattributed: self.screen_unattributed.load(Ordering::Relaxed),
            screen_not_presenter: self.screen_not_presenter.load(Ordering::Relaxed),
            screen_oversized: self.screen_oversized.load(Ordering::Relaxed),
            screen_forwarded: self.screen_forwarded.load(Ordering::Relaxed),
            rebinds_refused: self.rebinds_refused.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_and_snapshot() {
        let stats = ServerStats::new();
        ServerStats::bump(&stats.video_forwarded);
        ServerStats::bump(&stats.video_forwarded);
        ServerStats::bump(&stats.screen_oversized);

        let snap = stats.snapshot();
        assert_eq!(snap.video_forwarded, 2);
        assert_eq!(snap.screen_oversized, 1);
        assert_eq!(snap.audio_dropped_len, 0);
    }
}
