//! Screen sharing: presenter arbitration and frame fan-out
//!
//! The arbiter enforces a single active presenter over the reliable
//! screen-control stream; the datagram router forwards only frames whose
//! publisher is the current presenter, with no echo back to the presenter.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, ServerError};
use crate::protocol::datagram::split_media;
use crate::protocol::line::{self, ScreenCommand};
use crate::server::chat::{ChatRouter, SystemEvent};
use crate::server::registry::{Plane, Resolution, SessionRegistry};
use crate::stats::ServerStats;

#[derive(Debug)]
struct PresenterState {
    current: Option<u32>,
    since: Instant,
}

/// Mutual exclusion over the presenter role
///
/// State transitions and their `presenter_change` notifications happen under
/// one lock, so every participant observes grants and releases in the same
/// order they were decided.
#[derive(Debug)]
pub struct PresenterArbiter {
    state: Mutex<PresenterState>,
    chat: Arc<ChatRouter>,
}

impl PresenterArbiter {
    pub fn new(chat: Arc<ChatRouter>) -> Self {
        Self {
            state: Mutex::new(PresenterState {
                current: None,
                since: Instant::now(),
            }),
            chat,
        }
    }

    /// Grant the presenter role if it is free or already held by `id`
    ///
    /// A repeated request from the current presenter is idempotent: granted
    /// again with no notification.
    pub async fn request(&self, id: u32) -> bool {
        let mut state = self.state.lock().await;
        match state.current {
            Some(current) => current == id,
            None => {
                state.current = Some(id);
                state.since = Instant::now();
                info!(id, "Presenter granted");
                let _ = self
                    .chat
                    .emit_system(SystemEvent::PresenterChange(Some(id)))
                    .await;
                true
            }
        }
    }

    /// Release the role if `id` holds it; used by explicit release, by
    /// screen-control stream closure, and by the removal cascade
    pub async fn vacate(&self, id: u32) -> bool {
        let mut state = self.state.lock().await;
        if state.current != Some(id) {
            return false;
        }
        state.current = None;
        state.since = Instant::now();
        info!(id, "Presenter released");
        let _ = self
            .chat
            .emit_system(SystemEvent::PresenterChange(None))
            .await;
        true
    }

    /// The participant currently holding the role
    pub async fn current(&self) -> Option<u32> {
        self.state.lock().await.current
    }

    /// How long the current state has been in effect
    pub async fn held_since(&self) -> Instant {
        self.state.lock().await.since
    }
}

/// One accepted screen-control stream
///
/// The first line must be `HELLO:<client_id>` naming a live participant;
/// afterwards the stream carries presenter requests and releases. Closing
/// the stream while holding the role releases it.
pub async fn handle_screen_control(
    stream: TcpStream,
    arbiter: Arc<PresenterArbiter>,
    registry: Arc<SessionRegistry>,
) -> Result<()> {
    let peer = stream.peer_addr()?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let client_id = match lines.next_line().await? {
        Some(first) => match line::parse_screen(first.trim_end())? {
            ScreenCommand::Hello { client_id } => client_id,
            _ => {
                return Err(ServerError::protocol(
                    "Screen-control stream must open with HELLO",
                ));
            }
        },
        None => return Ok(()),
    };
    if !registry.contains(client_id).await {
        return Err(ServerError::protocol(format!(
            "HELLO from unknown participant {}",
            client_id
        )));
    }
    debug!(id = client_id, %peer, "Screen-control stream bound");

    let result = async {
        while let Some(raw) = lines.next_line().await? {
            match line::parse_screen(raw.trim_end())? {
                ScreenCommand::Hello { .. } => {
                    return Err(ServerError::protocol("Duplicate HELLO"));
                }
                ScreenCommand::Request => {
                    let granted = arbiter.request(client_id).await;
                    let reply = if granted {
                        line::PRESENTER_OK
                    } else {
                        line::PRESENTER_DENIED
                    };
                    write_half.write_all(reply.as_bytes()).await?;
                }
                ScreenCommand::Release => {
                    arbiter.vacate(client_id).await;
                }
            }
        }
        Ok(())
    }
    .await;

    // A dropped stream ends the presentation
    arbiter.vacate(client_id).await;
    result
}

/// Receives and fans out presenter frames on the screen datagram plane
#[derive(Debug)]
pub struct ScreenRouter {
    registry: Arc<SessionRegistry>,
    arbiter: Arc<PresenterArbiter>,
    stats: Arc<ServerStats>,
    frames: Mutex<HashMap<u32, Bytes>>,
    max_datagram: usize,
}

impl ScreenRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        arbiter: Arc<PresenterArbiter>,
        stats: Arc<ServerStats>,
        max_datagram: usize,
    ) -> Self {
        Self {
            registry,
            arbiter,
            stats,
            frames: Mutex::new(HashMap::new()),
            max_datagram,
        }
    }

    /// Receive screen datagrams until the socket fails
    pub async fn receive_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        info!("Screen receiver started");
        let mut buf = vec![0u8; 65535];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, addr)) => self.handle(&buf[..len], addr, &socket).await,
                Err(e) => {
                    warn!(error = %e, "Screen receive failed");
                    return;
                }
            }
        }
    }

    /// Attribute one datagram and fan it out if it comes from the presenter
    ///
    /// Header-only datagrams bind the sender's endpoint (how subscribers
    /// announce where to deliver) and are never forwarded.
    pub async fn handle(&self, datagram: &[u8], addr: SocketAddr, socket: &UdpSocket) {
        if datagram.len() > self.max_datagram {
            ServerStats::bump(&self.stats.screen_oversized);
            return;
        }
        let Some((claimed_id, payload)) = split_media(datagram) else {
            ServerStats::bump(&self.stats.screen_dropped_len);
            return;
        };
        let publisher = match self
            .registry
            .resolve_or_bind(Plane::Screen, addr, claimed_id)
            .await
        {
            Resolution::Bound(id) => id,
            Resolution::RebindRefused => {
                ServerStats::bump(&self.stats.rebinds_refused);
                return;
            }
            Resolution::Unattributed => {
                ServerStats::bump(&self.stats.screen_unattributed);
                return;
            }
        };
        if payload.is_empty() {
            return;
        }
        if self.arbiter.current().await != Some(publisher) {
            ServerStats::bump(&self.stats.screen_not_presenter);
            return;
        }

        self.frames
            .lock()
            .await
            .insert(publisher, Bytes::copy_from_slice(payload));

        for (recipient, endpoint) in self.registry.endpoints(Plane::Screen).await {
            if recipient == publisher {
                continue;
            }
            if socket.send_to(datagram, endpoint).await.is_ok() {
                ServerStats::bump(&self.stats.screen_forwarded);
            }
        }
    }

    /// Drop a departing participant's frame slot
    pub async fn remove(&self, id: u32) {
        self.frames.lock().await.remove(&id);
    }

    #[cfg(test)]
    async fn latest_frame(&self, id: u32) -> Option<Bytes> {
        self.frames.lock().await.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::protocol::datagram::encode_media;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct Harness {
        registry: Arc<SessionRegistry>,
        arbiter: Arc<PresenterArbiter>,
        router: ScreenRouter,
        stats: Arc<ServerStats>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(SessionRegistry::new(&ServerConfig::default()));
        let chat = Arc::new(ChatRouter::new(Arc::clone(&registry)));
        let arbiter = Arc::new(PresenterArbiter::new(chat));
        let stats = Arc::new(ServerStats::new());
        let router = ScreenRouter::new(
            Arc::clone(&registry),
            Arc::clone(&arbiter),
            Arc::clone(&stats),
            65_000,
        );
        Harness {
            registry,
            arbiter,
            router,
            stats,
        }
    }

    async fn admit(h: &Harness, name: &str) -> (u32, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (h.registry.admit(name, tx).await.unwrap(), rx)
    }

    #[tokio::test]
    async fn test_exclusive_grant_and_denial() {
        let h = harness();
        let (alice, _arx) = admit(&h, "alice").await;
        let (bob, _brx) = admit(&h, "bob").await;

        assert!(h.arbiter.request(alice).await);
        assert!(!h.arbiter.request(bob).await);
        assert_eq!(h.arbiter.current().await, Some(alice));
    }

    #[tokio::test]
    async fn test_repeat_request_is_idempotent() {
        let h = harness();
        let (alice, mut rx) = admit(&h, "alice").await;

        assert!(h.arbiter.request(alice).await);
        assert!(h.arbiter.request(alice).await);

        let mut presenter_lines = 0;
        while let Ok(line) = rx.try_recv() {
            if line.starts_with("PRESENTER:") {
                presenter_lines += 1;
            }
        }
        assert_eq!(presenter_lines, 1);
    }

    #[tokio::test]
    async fn test_vacate_notifies_and_frees_role() {
        let h = harness();
        let (alice, _arx) = admit(&h, "alice").await;
        let (bob, mut brx) = admit(&h, "bob").await;

        h.arbiter.request(alice).await;
        assert!(h.arbiter.vacate(alice).await);
        // Vacating an id that does not hold the role is a no-op
        assert!(!h.arbiter.vacate(alice).await);
        assert!(h.arbiter.request(bob).await);

        let lines: Vec<String> = std::iter::from_fn(|| brx.try_recv().ok()).collect();
        let presenters: Vec<&str> = lines
            .iter()
            .filter(|l| l.starts_with("PRESENTER:"))
            .map(String::as_str)
            .collect();
        assert_eq!(
            presenters,
            vec!["PRESENTER:0\n", "PRESENTER:NONE\n", "PRESENTER:1\n"]
        );
    }

    #[tokio::test]
    async fn test_only_presenter_frames_fan_out() {
        let h = harness();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (alice, _arx) = admit(&h, "alice").await;
        let (bob, _brx) = admit(&h, "bob").await;

        let alice_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bob_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Both announce their endpoints with header-only datagrams
        h.router
            .handle(
                &encode_media(alice, b""),
                alice_sock.local_addr().unwrap(),
                &server,
            )
            .await;
        h.router
            .handle(
                &encode_media(bob, b""),
                bob_sock.local_addr().unwrap(),
                &server,
            )
            .await;

        // Bob is not presenting, so his frame is dropped
        let forged = encode_media(bob, b"not presenting");
        h.router
            .handle(&forged, bob_sock.local_addr().unwrap(), &server)
            .await;
        assert_eq!(h.stats.snapshot().screen_not_presenter, 1);

        h.arbiter.request(alice).await;
        let frame = encode_media(alice, b"desktop");
        h.router
            .handle(&frame, alice_sock.local_addr().unwrap(), &server)
            .await;

        let mut buf = vec![0u8; 65535];
        let (len, _) = timeout(Duration::from_secs(2), bob_sock.recv_from(&mut buf))
            .await
            .expect("presenter frame not forwarded")
            .unwrap();
        assert_eq!(&buf[..len], &frame[..]);
        assert_eq!(h.router.latest_frame(alice).await.unwrap(), &b"desktop"[..]);

        // No echo to the presenter
        let echo = timeout(Duration::from_millis(200), alice_sock.recv_from(&mut buf)).await;
        assert!(echo.is_err());
    }

    #[tokio::test]
    async fn test_oversized_datagram_dropped() {
        let registry = Arc::new(SessionRegistry::new(&ServerConfig::default()));
        let chat = Arc::new(ChatRouter::new(Arc::clone(&registry)));
        let arbiter = Arc::new(PresenterArbiter::new(chat));
        let stats = Arc::new(ServerStats::new());
        let router = ScreenRouter::new(
            Arc::clone(&registry),
            Arc::clone(&arbiter),
            Arc::clone(&stats),
            64,
        );

        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let id = registry
            .admit("alice", mpsc::unbounded_channel().0)
            .await
            .unwrap();
        arbiter.request(id).await;

        let big = encode_media(id, &vec![0u8; 128]);
        router
            .handle(&big, SocketAddr::from(([127, 0, 0, 1], 4000)), &server)
            .await;
        assert_eq!(stats.snapshot().screen_oversized, 1);
        assert!(router.latest_frame(id).await.is_none());
    }
}
