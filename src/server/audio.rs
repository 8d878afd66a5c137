//! Time-windowed audio mixing
//!
//! The receiver stores the latest chunk per publisher; the mixer ticks once
//! per chunk duration and emits one mix per recipient, excluding that
//! recipient's own audio. Buckets are copied out under the lock and all
//! sends happen after it is released.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config::CHUNK_SAMPLES;
use crate::protocol::datagram::{decode_pcm_chunk, encode_pcm, split_media};
use crate::server::registry::{Plane, Resolution, SessionRegistry};
use crate::stats::ServerStats;

#[derive(Debug)]
struct Bucket {
    samples: Vec<i16>,
    received_at: Instant,
    /// Cleared once a tick has consumed this chunk
    fresh: bool,
}

/// Latest-chunk buckets plus the periodic mixer
#[derive(Debug)]
pub struct AudioMixer {
    registry: Arc<SessionRegistry>,
    stats: Arc<ServerStats>,
    buckets: Mutex<HashMap<u32, Bucket>>,
    stale_after: Duration,
}

impl AudioMixer {
    pub fn new(
        registry: Arc<SessionRegistry>,
        stats: Arc<ServerStats>,
        stale_after: Duration,
    ) -> Self {
        Self {
            registry,
            stats,
            buckets: Mutex::new(HashMap::new()),
            stale_after,
        }
    }

    /// Receive audio uplink datagrams until the socket fails
    pub async fn receive_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        info!("Audio receiver started");
        let mut buf = vec![0u8; 65535];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, addr)) => self.ingest(&buf[..len], addr).await,
                Err(e) => {
                    warn!(error = %e, "Audio receive failed");
                    return;
                }
            }
        }
    }

    /// Emit mixes on a fixed cadence
    pub async fn mix_loop(self: Arc<Self>, socket: Arc<UdpSocket>, tick: Duration) {
        info!(tick_ms = tick.as_millis() as u64, "Audio mixer started");
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.tick(&socket).await;
        }
    }

    /// Validate, attribute, and store one uplink datagram
    pub async fn ingest(&self, datagram: &[u8], addr: SocketAddr) {
        let Some((claimed_id, payload)) = split_media(datagram) else {
            ServerStats::bump(&self.stats.audio_dropped_len);
            return;
        };
        let Some(samples) = decode_pcm_chunk(payload) else {
            ServerStats::bump(&self.stats.audio_dropped_len);
            return;
        };
        match self
            .registry
            .resolve_or_bind(Plane::Audio, addr, claimed_id)
            .await
        {
            Resolution::Bound(id) => {
                self.buckets.lock().await.insert(
                    id,
                    Bucket {
                        samples,
                        received_at: Instant::now(),
                        fresh: true,
                    },
                );
            }
            Resolution::RebindRefused => ServerStats::bump(&self.stats.rebinds_refused),
            Resolution::Unattributed => ServerStats::bump(&self.stats.audio_unattributed),
        }
    }

    /// One mixer tick: copy out the fresh chunks, then emit per-recipient
    /// mixes with the lock released
    pub async fn tick(&self, socket: &UdpSocket) {
        let fresh: Vec<(u32, Vec<i16>)> = {
            let mut buckets = self.buckets.lock().await;
            buckets.retain(|_, b| b.received_at.elapsed() <= self.stale_after);
            buckets
                .iter_mut()
                .filter_map(|(id, b)| {
                    if b.fresh {
                        b.fresh = false;
                        Some((*id, b.samples.clone()))
                    } else {
                        None
                    }
                })
                .collect()
        };
        if fresh.is_empty() {
            return;
        }

        for (recipient, addr) in self.registry.endpoints(Plane::Audio).await {
            let chunks: Vec<&[i16]> = fresh
                .iter()
                .filter(|(publisher, _)| *publisher != recipient)
                .map(|(_, samples)| samples.as_slice())
                .collect();
            let Some(mix) = mix_chunks(&chunks) else {
                // Nothing but the recipient's own audio this tick
                continue;
            };
            let payload = encode_pcm(&mix);
            if socket.send_to(&payload, addr).await.is_ok() {
                ServerStats::bump(&self.stats.mixes_sent);
            }
        }
    }

    /// Drop a departing participant's bucket
    pub async fn remove(&self, id: u32) {
        self.buckets.lock().await.remove(&id);
    }

    #[cfg(test)]
    async fn bucket_count(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

/// Average the chunks sample-wise in widened arithmetic, clamped to i16
///
/// Returns `None` for an empty publisher set; silence is never synthesized.
pub fn mix_chunks(chunks: &[&[i16]]) -> Option<Vec<i16>> {
    if chunks.is_empty() {
        return None;
    }
    let count = chunks.len() as i32;
    let mix = (0..CHUNK_SAMPLES)
        .map(|i| {
            let sum: i32 = chunks.iter().map(|c| c[i] as i32).sum();
            (sum / count).clamp(i16::MIN as i32, i16::MAX as i32) as i16
        })
        .collect();
    Some(mix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::protocol::datagram::encode_media;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn constant_chunk(value: i16) -> Vec<i16> {
        vec![value; CHUNK_SAMPLES]
    }

    fn audio_datagram(id: u32, value: i16) -> Vec<u8> {
        encode_media(id, &encode_pcm(&constant_chunk(value))).to_vec()
    }

    #[test]
    fn test_mix_averages_in_widened_arithmetic() {
        let a = constant_chunk(200);
        let b = constant_chunk(300);
        let mix = mix_chunks(&[&a, &b]).unwrap();
        assert!(mix.iter().all(|&s| s == 250));

        let c = constant_chunk(100);
        let mix = mix_chunks(&[&a, &b, &c]).unwrap();
        assert!(mix.iter().all(|&s| s == 200));
    }

    #[test]
    fn test_mix_of_extremes_stays_in_range() {
        let lo = constant_chunk(i16::MIN);
        let hi = constant_chunk(i16::MAX);
        let mix = mix_chunks(&[&lo, &lo]).unwrap();
        assert!(mix.iter().all(|&s| s == i16::MIN));
        let mix = mix_chunks(&[&hi, &hi, &hi]).unwrap();
        assert!(mix.iter().all(|&s| s == i16::MAX));
    }

    #[test]
    fn test_mix_empty_set_is_none() {
        assert!(mix_chunks(&[]).is_none());
    }

    async fn mixer_with(stale_after: Duration) -> (Arc<SessionRegistry>, AudioMixer) {
        let config = ServerConfig::default();
        let registry = Arc::new(SessionRegistry::new(&config));
        let mixer = AudioMixer::new(
            Arc::clone(&registry),
            Arc::new(ServerStats::new()),
            stale_after,
        );
        (registry, mixer)
    }

    async fn admit(registry: &SessionRegistry, name: &str) -> u32 {
        registry
            .admit(name, mpsc::unbounded_channel().0)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_wrong_length_chunk_dropped() {
        let (registry, mixer) = mixer_with(Duration::from_secs(1)).await;
        let id = admit(&registry, "alice").await;
        let addr = SocketAddr::from(([127, 0, 0, 1], 4000));

        let mut short = audio_datagram(id, 7);
        short.truncate(short.len() - 2);
        mixer.ingest(&short, addr).await;
        assert_eq!(mixer.bucket_count().await, 0);

        mixer.ingest(&audio_datagram(id, 7), addr).await;
        assert_eq!(mixer.bucket_count().await, 1);
    }

    #[tokio::test]
    async fn test_unattributed_chunk_dropped() {
        let (_registry, mixer) = mixer_with(Duration::from_secs(1)).await;
        let addr = SocketAddr::from(([127, 0, 0, 1], 4000));
        mixer.ingest(&audio_datagram(42, 7), addr).await;
        assert_eq!(mixer.bucket_count().await, 0);
    }

    #[tokio::test]
    async fn test_tick_mixes_with_loopback_exclusion() {
        let (registry, mixer) = mixer_with(Duration::from_secs(1)).await;

        // Three clients on real sockets so the mixes can be observed
        let mut clients = Vec::new();
        for (name, value) in [("a", 100i16), ("b", 200), ("c", 300)] {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let id = admit(&registry, name).await;
            let addr = socket.local_addr().unwrap();
            mixer.ingest(&audio_datagram(id, value), addr).await;
            clients.push((socket, value));
        }

        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        mixer.tick(&server).await;

        let expected = [250i16, 200, 150];
        for ((socket, _), want) in clients.iter().zip(expected) {
            let mut buf = vec![0u8; 65535];
            let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
                .await
                .expect("mix not delivered")
                .unwrap();
            let samples = decode_pcm_chunk(&buf[..len]).expect("mix is one exact chunk");
            assert!(samples.iter().all(|&s| s == want));
        }
    }

    #[tokio::test]
    async fn test_consumed_chunks_not_remixed() {
        let (registry, mixer) = mixer_with(Duration::from_secs(5)).await;

        let alice_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let alice = admit(&registry, "alice").await;
        mixer
            .ingest(&audio_datagram(alice, 50), alice_sock.local_addr().unwrap())
            .await;

        let bob_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bob = admit(&registry, "bob").await;
        mixer
            .ingest(&audio_datagram(bob, 80), bob_sock.local_addr().unwrap())
            .await;

        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        mixer.tick(&server).await;

        let mut buf = vec![0u8; 65535];
        let (len, _) = timeout(Duration::from_secs(2), alice_sock.recv_from(&mut buf))
            .await
            .expect("first tick mix missing")
            .unwrap();
        assert_eq!(len, CHUNK_SAMPLES * 2);

        // No publisher sent since the last tick, so the next tick is silent
        mixer.tick(&server).await;
        let quiet = timeout(Duration::from_millis(200), alice_sock.recv_from(&mut buf)).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn test_stale_buckets_evicted() {
        let (registry, mixer) = mixer_with(Duration::from_millis(20)).await;
        let id = admit(&registry, "alice").await;
        mixer
            .ingest(
                &audio_datagram(id, 9),
                SocketAddr::from(([127, 0, 0, 1], 4000)),
            )
            .await;
        assert_eq!(mixer.bucket_count().await, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        mixer.tick(&server).await;
        assert_eq!(mixer.bucket_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_clears_bucket() {
        let (registry, mixer) = mixer_with(Duration::from_secs(1)).await;
        let id = admit(&registry, "alice").await;
        mixer
            .ingest(
                &audio_datagram(id, 9),
                SocketAddr::from(([127, 0, 0, 1], 4000)),
            )
            .await;
        mixer.remove(id).await;
        assert_eq!(mixer.bucket_count().await, 0);
    }
}
