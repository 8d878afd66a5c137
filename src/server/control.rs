//! Control-plane connection handling
//!
//! Each accepted control connection runs two tasks: this reader, which owns
//! registration and the command loop, and a writer draining the participant's
//! outbox. The connection owns the participant's lifetime; when either side
//! fails, the removal cascade runs exactly once.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Result, ServerError};
use crate::protocol::line::{self, ControlCommand};
use crate::server::ServerState;
use crate::server::chat::SystemEvent;

/// Serve one control connection from accept to cleanup
pub async fn handle_control(stream: TcpStream, state: Arc<ServerState>) -> Result<()> {
    let peer = stream.peer_addr()?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // The registration line must arrive within the handshake window
    let first = match timeout(state.config.register_timeout, lines.next_line()).await {
        Ok(Ok(Some(first))) => first,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            debug!(%peer, "Registration window expired");
            return Err(ServerError::timeout("No registration received"));
        }
    };
    let username = match line::parse_control(first.trim_end()) {
        Ok(ControlCommand::Register { username }) => username,
        Ok(_) => {
            reject(&mut write_half, "Malformed registration").await;
            return Err(ServerError::protocol("First message was not REGISTER"));
        }
        Err(e) => {
            reject(&mut write_half, "Malformed registration").await;
            return Err(e);
        }
    };

    let (outbound, outbox) = mpsc::unbounded_channel();
    let id = match state.registry.admit(&username, outbound.clone()).await {
        Ok(id) => id,
        Err(e) => {
            reject(&mut write_half, e.wire_reason()).await;
            return Err(e);
        }
    };
    info!(id, username = %username, %peer, "Control connection registered");

    let writer = tokio::spawn(writer_loop(
        write_half,
        outbox,
        state.config.control_write_timeout,
        Arc::clone(&state),
        id,
    ));

    // Admission sequence: the id, then the retained history, then the join
    // notice and fresh roster to everyone (the new participant included)
    let _ = outbound.send(line::id_line(id));
    state.chat.send_history(id).await;
    let _ = state
        .chat
        .emit_system(SystemEvent::Join {
            username: username.clone(),
        })
        .await;
    let _ = state.chat.emit_system(SystemEvent::RosterUpdate).await;

    let result = command_loop(&mut lines, id, &outbound, &state).await;

    state.remove_participant(id).await;
    // With the registry entry gone, dropping the local handle closes the
    // outbox and lets the writer drain out
    drop(outbound);
    let _ = timeout(Duration::from_secs(1), writer).await;
    debug!(id, %peer, "Control connection closed");
    result
}

async fn command_loop(
    lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    id: u32,
    outbound: &mpsc::UnboundedSender<String>,
    state: &Arc<ServerState>,
) -> Result<()> {
    while let Some(raw) = lines.next_line().await? {
        let command = match line::parse_control(raw.trim_end()) {
            Ok(command) => command,
            Err(e) => {
                let _ = outbound.send(line::error_line(e.wire_reason()));
                return Err(e);
            }
        };
        match command {
            ControlCommand::Chat { body } => {
                state.chat.broadcast_group(id, &body).await?;
            }
            ControlCommand::PrivateChat { recipients, body } => {
                state.chat.send_private(id, &recipients, &body).await?;
            }
            ControlCommand::Ping => {
                let _ = outbound.send(line::PONG.to_string());
            }
            ControlCommand::Register { .. } => {
                let _ = outbound.send(line::error_line("Already registered"));
                return Err(ServerError::protocol("Repeated REGISTER"));
            }
        }
    }
    Ok(())
}

/// Drain the outbox onto the socket; a bounded write that fails or times out
/// deems the recipient dead and removes it
async fn writer_loop(
    mut write_half: OwnedWriteHalf,
    mut outbox: mpsc::UnboundedReceiver<String>,
    write_timeout: Duration,
    state: Arc<ServerState>,
    id: u32,
) {
    while let Some(message) = outbox.recv().await {
        match timeout(write_timeout, write_half.write_all(message.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(id, error = %e, "Control write failed, removing participant");
                outbox.close();
                state.remove_participant(id).await;
                return;
            }
            Err(_) => {
                warn!(id, "Control write stalled, removing participant");
                outbox.close();
                state.remove_participant(id).await;
                return;
            }
        }
    }
}

async fn reject(write_half: &mut OwnedWriteHalf, reason: &str) {
    let _ = write_half
        .write_all(line::error_line(reason).as_bytes())
        .await;
    let _ = write_half.shutdown().await;
}
