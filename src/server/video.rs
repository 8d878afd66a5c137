//! Video fan-out
//!
//! Frames are opaque: the router attributes each datagram to its publisher,
//! keeps the latest frame per publisher, and forwards the datagram unchanged
//! to every other participant with a bound video endpoint. Nothing is ever
//! decoded or retried.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::protocol::datagram::split_media;
use crate::server::registry::{Plane, Resolution, SessionRegistry};
use crate::stats::ServerStats;

/// Receives and fans out opaque video frames
#[derive(Debug)]
pub struct VideoRouter {
    registry: Arc<SessionRegistry>,
    stats: Arc<ServerStats>,
    /// Latest frame per publisher, replaced in place
    frames: Mutex<HashMap<u32, Bytes>>,
}

impl VideoRouter {
    pub fn new(registry: Arc<SessionRegistry>, stats: Arc<ServerStats>) -> Self {
        Self {
            registry,
            stats,
            frames: Mutex::new(HashMap::new()),
        }
    }

    /// Receive video datagrams until the socket fails
    pub async fn receive_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        info!("Video receiver started");
        let mut buf = vec![0u8; 65535];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, addr)) => self.handle(&buf[..len], addr, &socket).await,
                Err(e) => {
                    warn!(error = %e, "Video receive failed");
                    return;
                }
            }
        }
    }

    /// Attribute one datagram, stash the frame, and fan it out
    pub async fn handle(&self, datagram: &[u8], addr: SocketAddr, socket: &UdpSocket) {
        let Some((claimed_id, payload)) = split_media(datagram) else {
            ServerStats::bump(&self.stats.video_unattributed);
            return;
        };
        let publisher = match self
            .registry
            .resolve_or_bind(Plane::Video, addr, claimed_id)
            .await
        {
            Resolution::Bound(id) => id,
            Resolution::RebindRefused => {
                ServerStats::bump(&self.stats.rebinds_refused);
                return;
            }
            Resolution::Unattributed => {
                ServerStats::bump(&self.stats.video_unattributed);
                return;
            }
        };

        self.frames
            .lock()
            .await
            .insert(publisher, Bytes::copy_from_slice(payload));

        for (recipient, endpoint) in self.registry.endpoints(Plane::Video).await {
            if recipient == publisher {
                continue;
            }
            match socket.send_to(datagram, endpoint).await {
                Ok(_) => ServerStats::bump(&self.stats.video_forwarded),
                Err(_) => ServerStats::bump(&self.stats.video_send_failures),
            }
        }
    }

    /// Drop a departing participant's frame slot
    pub async fn remove(&self, id: u32) {
        self.frames.lock().await.remove(&id);
    }

    /// Latest frame published by a participant, if any
    pub async fn latest_frame(&self, id: u32) -> Option<Bytes> {
        self.frames.lock().await.get(&id).cloned()
    }
}
