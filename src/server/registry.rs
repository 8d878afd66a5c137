//! Session registry: live participants and their endpoints
//!
//! The registry is the authoritative map of connected participants. Control
//! connections own participant lifetime; datagram endpoints are learned
//! lazily from the first attributable packet on each media plane.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::protocol::line::RosterEntry;

/// The three datagram planes whose endpoints are learned per participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    Video,
    Audio,
    Screen,
}

impl Plane {
    fn index(self) -> usize {
        match self {
            Plane::Video => 0,
            Plane::Audio => 1,
            Plane::Screen => 2,
        }
    }
}

/// Outcome of attributing a datagram to a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The packet belongs to this live participant
    Bound(u32),
    /// The endpoint or declared id could not be attributed
    Unattributed,
    /// The declared id is bound elsewhere and that endpoint is still live
    RebindRefused,
}

#[derive(Debug, Clone, Copy)]
struct MediaBinding {
    addr: SocketAddr,
    last_seen: Instant,
}

/// A live participant
#[derive(Debug)]
pub struct Participant {
    pub id: u32,
    pub username: String,
    /// Control-plane outbox, drained FIFO by the connection's writer task
    pub outbound: mpsc::UnboundedSender<String>,
    pub joined_at: Instant,
    media: [Option<MediaBinding>; 3],
}

#[derive(Debug, Default)]
struct RegistryInner {
    participants: HashMap<u32, Participant>,
    /// Per-plane reverse maps for O(1) datagram attribution
    by_endpoint: [HashMap<SocketAddr, u32>; 3],
}

/// Authoritative participant map; all mutations serialize on one lock
#[derive(Debug)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
    next_client_id: AtomicU32,
    max_users: usize,
    rebind_grace: Duration,
}

impl SessionRegistry {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            next_client_id: AtomicU32::new(0),
            max_users: config.max_users,
            rebind_grace: config.rebind_grace,
        }
    }

    /// Admit a participant, assigning the next client id
    ///
    /// Ids are monotonic and never reused within a server run.
    pub async fn admit(
        &self,
        username: &str,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Result<u32> {
        let mut inner = self.inner.write().await;
        if inner.participants.len() >= self.max_users {
            return Err(ServerError::capacity("Server full"));
        }
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        inner.participants.insert(
            id,
            Participant {
                id,
                username: username.to_string(),
                outbound,
                joined_at: Instant::now(),
                media: [None, None, None],
            },
        );
        info!(id, username, "Participant admitted");
        Ok(id)
    }

    /// Remove a participant, releasing its endpoint bindings
    pub async fn remove(&self, id: u32) -> Option<Participant> {
        let mut inner = self.inner.write().await;
        let participant = inner.participants.remove(&id)?;
        for (plane, binding) in participant.media.iter().enumerate() {
            if let Some(binding) = binding {
                inner.by_endpoint[plane].remove(&binding.addr);
            }
        }
        info!(id, username = %participant.username, "Participant removed");
        Some(participant)
    }

    /// Attribute a datagram source to a participant, learning the endpoint
    /// on first contact
    ///
    /// An endpoint already bound to a different id is never re-attributed
    /// (spoof defense). A live id reappearing from a new endpoint rebinds
    /// only once the previous endpoint has been silent for the grace
    /// interval.
    pub async fn resolve_or_bind(
        &self,
        plane: Plane,
        addr: SocketAddr,
        claimed_id: u32,
    ) -> Resolution {
        let mut inner = self.inner.write().await;
        let idx = plane.index();

        let bound = inner.by_endpoint[idx].get(&addr).copied();
        if let Some(bound_id) = bound {
            if bound_id != claimed_id {
                return Resolution::Unattributed;
            }
            if let Some(participant) = inner.participants.get_mut(&bound_id) {
                if let Some(binding) = participant.media[idx].as_mut() {
                    binding.last_seen = Instant::now();
                }
            }
            return Resolution::Bound(bound_id);
        }

        let grace = self.rebind_grace;
        let Some(participant) = inner.participants.get_mut(&claimed_id) else {
            return Resolution::Unattributed;
        };

        let old_addr = match participant.media[idx] {
            None => None,
            Some(binding) if binding.last_seen.elapsed() >= grace => Some(binding.addr),
            Some(_) => return Resolution::RebindRefused,
        };
        participant.media[idx] = Some(MediaBinding {
            addr,
            last_seen: Instant::now(),
        });
        if let Some(old_addr) = old_addr {
            inner.by_endpoint[idx].remove(&old_addr);
            debug!(id = claimed_id, ?plane, %addr, "Endpoint rebound");
        } else {
            debug!(id = claimed_id, ?plane, %addr, "Endpoint learned");
        }
        inner.by_endpoint[idx].insert(addr, claimed_id);
        Resolution::Bound(claimed_id)
    }

    /// Roster snapshot ordered by id for deterministic broadcasts
    pub async fn snapshot(&self) -> Vec<RosterEntry> {
        let inner = self.inner.read().await;
        let mut entries: Vec<RosterEntry> = inner
            .participants
            .values()
            .map(|p| RosterEntry {
                id: p.id,
                username: p.username.clone(),
            })
            .collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    /// Clone every participant's control-plane outbox
    pub async fn senders(&self) -> Vec<(u32, mpsc::UnboundedSender<String>)> {
        let inner = self.inner.read().await;
        let mut senders: Vec<_> = inner
            .participants
            .values()
            .map(|p| (p.id, p.outbound.clone()))
            .collect();
        senders.sort_by_key(|(id, _)| *id);
        senders
    }

    /// One participant's control-plane outbox
    pub async fn sender_of(&self, id: u32) -> Option<mpsc::UnboundedSender<String>> {
        let inner = self.inner.read().await;
        inner.participants.get(&id).map(|p| p.outbound.clone())
    }

    pub async fn contains(&self, id: u32) -> bool {
        self.inner.read().await.participants.contains_key(&id)
    }

    pub async fn username(&self, id: u32) -> Option<String> {
        let inner = self.inner.read().await;
        inner.participants.get(&id).map(|p| p.username.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.participants.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.participants.is_empty()
    }

    /// Bound endpoints on one plane, for fan-out
    pub async fn endpoints(&self, plane: Plane) -> Vec<(u32, SocketAddr)> {
        let inner = self.inner.read().await;
        let idx = plane.index();
        let mut endpoints: Vec<_> = inner
            .participants
            .values()
            .filter_map(|p| p.media[idx].map(|b| (p.id, b.addr)))
            .collect();
        endpoints.sort_by_key(|(id, _)| *id);
        endpoints
    }

    /// One participant's bound endpoint on a plane, if learned
    pub async fn endpoint(&self, id: u32, plane: Plane) -> Option<SocketAddr> {
        let inner = self.inner.read().await;
        inner
            .participants
            .get(&id)
            .and_then(|p| p.media[plane.index()].map(|b| b.addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(max_users: usize, rebind_grace: Duration) -> SessionRegistry {
        let config = ServerConfig {
            max_users,
            rebind_grace,
            ..ServerConfig::default()
        };
        SessionRegistry::new(&config)
    }

    fn outbox() -> mpsc::UnboundedSender<String> {
        mpsc::unbounded_channel().0
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_ids_unique_and_never_reused() {
        let registry = registry_with(10, Duration::from_secs(5));
        let a = registry.admit("alice", outbox()).await.unwrap();
        let b = registry.admit("bob", outbox()).await.unwrap();
        assert_ne!(a, b);

        registry.remove(a).await.unwrap();
        let c = registry.admit("carol", outbox()).await.unwrap();
        assert_ne!(c, a);
        assert_ne!(c, b);
    }

    #[tokio::test]
    async fn test_capacity_rejects_but_keeps_incumbents() {
        let registry = registry_with(2, Duration::from_secs(5));
        registry.admit("alice", outbox()).await.unwrap();
        registry.admit("bob", outbox()).await.unwrap();

        let err = registry.admit("carol", outbox()).await.unwrap_err();
        assert!(matches!(err, ServerError::Capacity(_)));
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_snapshot_ordered_by_id() {
        let registry = registry_with(10, Duration::from_secs(5));
        registry.admit("alice", outbox()).await.unwrap();
        registry.admit("bob", outbox()).await.unwrap();
        registry.admit("carol", outbox()).await.unwrap();

        let snapshot = registry.snapshot().await;
        let ids: Vec<u32> = snapshot.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(snapshot[1].username, "bob");
    }

    #[tokio::test]
    async fn test_first_packet_learns_endpoint() {
        let registry = registry_with(10, Duration::from_secs(5));
        let id = registry.admit("alice", outbox()).await.unwrap();

        assert_eq!(
            registry.resolve_or_bind(Plane::Video, addr(4000), id).await,
            Resolution::Bound(id)
        );
        assert_eq!(registry.endpoint(id, Plane::Video).await, Some(addr(4000)));
        // Planes are independent
        assert_eq!(registry.endpoint(id, Plane::Audio).await, None);
    }

    #[tokio::test]
    async fn test_unknown_id_and_spoofed_prefix_drop() {
        let registry = registry_with(10, Duration::from_secs(5));
        let alice = registry.admit("alice", outbox()).await.unwrap();
        let bob = registry.admit("bob", outbox()).await.unwrap();

        assert_eq!(
            registry.resolve_or_bind(Plane::Video, addr(4000), 99).await,
            Resolution::Unattributed
        );

        registry.resolve_or_bind(Plane::Video, addr(4000), alice).await;
        // Bob's id claimed from Alice's endpoint
        assert_eq!(
            registry.resolve_or_bind(Plane::Video, addr(4000), bob).await,
            Resolution::Unattributed
        );
    }

    #[tokio::test]
    async fn test_rebind_refused_within_grace() {
        let registry = registry_with(10, Duration::from_secs(5));
        let id = registry.admit("alice", outbox()).await.unwrap();

        registry.resolve_or_bind(Plane::Audio, addr(4000), id).await;
        assert_eq!(
            registry.resolve_or_bind(Plane::Audio, addr(4001), id).await,
            Resolution::RebindRefused
        );
        assert_eq!(registry.endpoint(id, Plane::Audio).await, Some(addr(4000)));
    }

    #[tokio::test]
    async fn test_rebind_allowed_after_grace() {
        let registry = registry_with(10, Duration::from_millis(20));
        let id = registry.admit("alice", outbox()).await.unwrap();

        registry.resolve_or_bind(Plane::Audio, addr(4000), id).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(
            registry.resolve_or_bind(Plane::Audio, addr(4001), id).await,
            Resolution::Bound(id)
        );
        assert_eq!(registry.endpoint(id, Plane::Audio).await, Some(addr(4001)));
        // The stale endpoint no longer attributes
        assert_eq!(
            registry.resolve_or_bind(Plane::Audio, addr(4000), id).await,
            Resolution::RebindRefused
        );
    }

    #[tokio::test]
    async fn test_remove_releases_bindings() {
        let registry = registry_with(10, Duration::from_secs(5));
        let id = registry.admit("alice", outbox()).await.unwrap();
        registry.resolve_or_bind(Plane::Video, addr(4000), id).await;
        registry.resolve_or_bind(Plane::Screen, addr(4001), id).await;

        registry.remove(id).await.unwrap();
        assert!(registry.endpoints(Plane::Video).await.is_empty());
        assert!(registry.endpoints(Plane::Screen).await.is_empty());
        assert_eq!(
            registry.resolve_or_bind(Plane::Video, addr(4000), id).await,
            Resolution::Unattributed
        );
    }
}
