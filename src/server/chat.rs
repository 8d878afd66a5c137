//! Chat and notification routing over the control plane
//!
//! All reliable deliveries go through each participant's outbox channel, so
//! per-recipient order is FIFO while no sender ever blocks on a slow peer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::protocol::line;
use crate::server::registry::SessionRegistry;
use crate::wall_clock_hms;

/// Message category, matching the wire rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Group,
    Private,
    System,
}

/// One delivered chat entry
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub seq: u64,
    pub kind: ChatKind,
    /// Absent for system messages
    pub sender_id: Option<u32>,
    pub recipients: Vec<u32>,
    pub timestamp: String,
    pub body: String,
    /// Wire form, cached for history replay
    rendered: String,
}

/// System events delivered to every participant
#[derive(Debug, Clone)]
pub enum SystemEvent {
    Join { username: String },
    Leave { username: String },
    RosterUpdate,
    PresenterChange(Option<u32>),
    FileOffer {
        file_id: u32,
        filename: String,
        size: usize,
        uploader_name: String,
        uploader_id: u32,
    },
    FileDeleted { file_id: u32 },
}

/// Reliable fan-out of chat and system events
#[derive(Debug)]
pub struct ChatRouter {
    registry: Arc<SessionRegistry>,
    history: Mutex<Vec<ChatMessage>>,
    next_seq: AtomicU64,
}

impl ChatRouter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            history: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Deliver a group message to every participant, the sender included
    /// (the echo doubles as the send confirmation), and append it to history.
    pub async fn broadcast_group(&self, sender_id: u32, body: &str) -> Result<()> {
        let Some(username) = self.registry.username(sender_id).await else {
            // Sender raced its own removal; nothing to deliver
            return Ok(());
        };
        let timestamp = wall_clock_hms();
        let rendered = line::chat_line(sender_id, &username, &timestamp, body);
        let recipients: Vec<u32> = self.registry.snapshot().await.iter().map(|e| e.id).collect();

        let message = ChatMessage {
            seq: self.next_seq(),
            kind: ChatKind::Group,
            sender_id: Some(sender_id),
            recipients,
            timestamp,
            body: body.to_string(),
            rendered: rendered.clone(),
        };
        self.history.lock().await.push(message);

        self.deliver_to_all(&rendered).await;
        Ok(())
    }

    /// Deliver a private message to the resolved recipients and echo it to
    /// the sender. Unknown ids are dropped; private traffic never enters
    /// history.
    pub async fn send_private(
        &self,
        sender_id: u32,
        recipient_ids: &[u32],
        body: &str,
    ) -> Result<()> {
        let Some(username) = self.registry.username(sender_id).await else {
            return Ok(());
        };

        let mut resolved: Vec<(u32, String)> = Vec::new();
        for &id in recipient_ids {
            if id == sender_id || resolved.iter().any(|(r, _)| *r == id) {
                continue;
            }
            if let Some(name) = self.registry.username(id).await {
                resolved.push((id, name));
            }
        }

        let names = resolved
            .iter()
            .map(|(_, name)| name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let timestamp = wall_clock_hms();
        let rendered = line::private_line(sender_id, &username, &timestamp, &names, body);
        let _ = self.next_seq();

        for (id, _) in &resolved {
            if let Some(sender) = self.registry.sender_of(*id).await {
                let _ = sender.send(rendered.clone());
            }
        }
        if let Some(sender) = self.registry.sender_of(sender_id).await {
            let _ = sender.send(rendered);
        }
        Ok(())
    }

    /// Deliver a system event to every participant
    ///
    /// Join and leave notices are retained in history; roster, presenter,
    /// and file events describe state that would be stale on replay.
    pub async fn emit_system(&self, event: SystemEvent) -> Result<()> {
        let seq = self.next_seq();
        let rendered = match &event {
            SystemEvent::Join { username } => line::system_line(&format!("{} joined", username)),
            SystemEvent::Leave { username } => line::system_line(&format!("{} left", username)),
            SystemEvent::RosterUpdate => line::roster_line(&self.registry.snapshot().await)?,
            SystemEvent::PresenterChange(presenter) => line::presenter_line(*presenter),
            SystemEvent::FileOffer {
                file_id,
                filename,
                size,
                uploader_name,
                uploader_id,
            } => line::file_offer_line(*file_id, filename, *size, uploader_name, *uploader_id),
            SystemEvent::FileDeleted { file_id } => line::file_deleted_line(*file_id),
        };

        if matches!(event, SystemEvent::Join { .. } | SystemEvent::Leave { .. }) {
            let message = ChatMessage {
                seq,
                kind: ChatKind::System,
                sender_id: None,
                recipients: Vec::new(),
                timestamp: wall_clock_hms(),
                body: rendered.trim_end().to_string(),
                rendered: rendered.clone(),
            };
            self.history.lock().await.push(message);
        }

        debug!(?event, "System event");
        self.deliver_to_all(&rendered).await;
        Ok(())
    }

    /// Replay the retained history to one participant, bracketed by the
    /// framing markers. Sent through the participant's outbox so it lands
    /// before any message broadcast afterwards.
    pub async fn send_history(&self, id: u32) {
        let Some(sender) = self.registry.sender_of(id).await else {
            return;
        };
        let history = self.history.lock().await;
        let _ = sender.send(line::HISTORY_BEGIN.to_string());
        for message in history.iter() {
            let _ = sender.send(message.rendered.clone());
        }
        let _ = sender.send(line::HISTORY_END.to_string());
    }

    /// Number of retained history entries
    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }

    async fn deliver_to_all(&self, rendered: &str) {
        for (_, sender) in self.registry.senders().await {
            // A closed outbox means the participant is mid-removal; its own
            // writer task drives the cleanup
            let _ = sender.send(rendered.to_string());
        }
    }
}
