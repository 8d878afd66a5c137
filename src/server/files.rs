//! In-memory file catalog and per-connection transfer handling
//!
//! Each accepted transfer stream carries exactly one ASCII command line and
//! then, for uploads and downloads, a binary body. A file id exists only
//! once the full declared size has been received; partial uploads leave no
//! trace in the catalog.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::protocol::line::{self, FileCommand};
use crate::server::chat::{ChatRouter, SystemEvent};
use crate::server::registry::SessionRegistry;
use crate::wall_clock_hms;

/// Bytes moved per read/write during a transfer body
const TRANSFER_CHUNK: usize = 64 * 1024;

/// One published file
#[derive(Debug)]
pub struct FileEntry {
    pub file_id: u32,
    pub filename: String,
    pub size: usize,
    pub uploader_id: u32,
    pub uploader_name: String,
    pub created_at: String,
    /// Immutable once the entry is published
    pub bytes: Vec<u8>,
}

/// file_id → entry; ids are assigned only after a complete upload
#[derive(Debug)]
pub struct FileCatalog {
    entries: RwLock<HashMap<u32, Arc<FileEntry>>>,
    next_file_id: AtomicU32,
}

impl FileCatalog {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_file_id: AtomicU32::new(0),
        }
    }

    /// Publish a fully received upload, assigning its file id
    pub async fn publish(
        &self,
        filename: String,
        uploader_id: u32,
        uploader_name: String,
        bytes: Vec<u8>,
    ) -> Arc<FileEntry> {
        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(FileEntry {
            file_id,
            filename,
            size: bytes.len(),
            uploader_id,
            uploader_name,
            created_at: wall_clock_hms(),
            bytes,
        });
        self.entries
            .write()
            .await
            .insert(file_id, Arc::clone(&entry));
        info!(
            file_id,
            filename = %entry.filename,
            size = entry.size,
            uploader = entry.uploader_id,
            "File published"
        );
        entry
    }

    pub async fn get(&self, file_id: u32) -> Option<Arc<FileEntry>> {
        self.entries.read().await.get(&file_id).cloned()
    }

    /// Remove an entry if `requester` uploaded it
    pub async fn delete(&self, file_id: u32, requester: u32) -> Result<Arc<FileEntry>> {
        let mut entries = self.entries.write().await;
        match entries.remove(&file_id) {
            Some(entry) if entry.uploader_id == requester => {
                info!(file_id, "File deleted");
                Ok(entry)
            }
            Some(entry) => {
                entries.insert(file_id, entry);
                Err(ServerError::permission("Not authorized"))
            }
            None => Err(ServerError::protocol("File not found")),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for FileCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve one accepted transfer stream to completion
pub async fn handle_transfer(
    stream: TcpStream,
    catalog: Arc<FileCatalog>,
    registry: Arc<SessionRegistry>,
    chat: Arc<ChatRouter>,
    config: &ServerConfig,
) -> Result<()> {
    let peer = stream.peer_addr()?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut header = String::new();
    timeout(config.transfer_idle_timeout, reader.read_line(&mut header)).await??;
    let command = match line::parse_file_command(header.trim_end()) {
        Ok(command) => command,
        Err(e) => {
            let _ = write_half
                .write_all(line::error_line(e.wire_reason()).as_bytes())
                .await;
            return Err(e);
        }
    };
    debug!(%peer, ?command, "Transfer command");

    match command {
        FileCommand::Upload {
            client_id,
            username,
            filename,
            size,
        } => {
            if size > config.max_file_size {
                write_half
                    .write_all(line::error_line("File too large").as_bytes())
                    .await?;
                return Err(ServerError::capacity(format!(
                    "Upload of {} bytes exceeds limit",
                    size
                )));
            }
            if !registry.contains(client_id).await {
                write_half
                    .write_all(line::error_line("Unknown client").as_bytes())
                    .await?;
                return Err(ServerError::protocol(format!(
                    "Upload from unknown participant {}",
                    client_id
                )));
            }
            write_half.write_all(line::READY.as_bytes()).await?;

            let bytes = match read_body(&mut reader, size, config).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(%peer, filename = %filename, error = %e, "Upload abandoned");
                    let _ = write_half
                        .write_all(line::error_line("Incomplete upload").as_bytes())
                        .await;
                    return Err(e);
                }
            };

            let entry = catalog.publish(filename, client_id, username, bytes).await;
            write_half
                .write_all(line::upload_success_line(entry.file_id).as_bytes())
                .await?;
            chat.emit_system(SystemEvent::FileOffer {
                file_id: entry.file_id,
                filename: entry.filename.clone(),
                size: entry.size,
                uploader_name: entry.uploader_name.clone(),
                uploader_id: entry.uploader_id,
            })
            .await?;
        }
        FileCommand::Download { file_id } => {
            let Some(entry) = catalog.get(file_id).await else {
                write_half
                    .write_all(line::error_line("File not found").as_bytes())
                    .await?;
                return Ok(());
            };
            write_half
                .write_all(line::download_header_line(&entry.filename, entry.size).as_bytes())
                .await?;
            // The body follows the header immediately; a client READY is
            // neither required nor awaited
            write_body(&mut write_half, &entry.bytes, config).await?;
            write_half.flush().await?;
            debug!(file_id, size = entry.size, "Download served");
        }
        FileCommand::Delete { file_id, client_id } => match catalog.delete(file_id, client_id).await
        {
            Ok(entry) => {
                write_half
                    .write_all(line::delete_success_line(entry.file_id).as_bytes())
                    .await?;
                chat.emit_system(SystemEvent::FileDeleted {
                    file_id: entry.file_id,
                })
                .await?;
            }
            Err(e) => {
                write_half
                    .write_all(line::error_line(e.wire_reason()).as_bytes())
                    .await?;
                return Err(e);
            }
        },
    }
    Ok(())
}

/// Read exactly `size` bytes, each read bounded by the idle window
async fn read_body<R>(reader: &mut R, size: usize, config: &ServerConfig) -> Result<Vec<u8>>
where
    R: AsyncReadExt + Unpin,
{
    let mut bytes = vec![0u8; size];
    let mut received = 0;
    while received < size {
        let end = (received + TRANSFER_CHUNK).min(size);
        let n = timeout(
            config.transfer_idle_timeout,
            reader.read(&mut bytes[received..end]),
        )
        .await??;
        if n == 0 {
            return Err(ServerError::incomplete(format!(
                "Upload ended at {} of {} bytes",
                received, size
            )));
        }
        received += n;
    }
    Ok(bytes)
}

/// Write the blob, each write bounded so a stalled recipient aborts the
/// transfer rather than pinning the worker
async fn write_body(
    write_half: &mut OwnedWriteHalf,
    bytes: &[u8],
    config: &ServerConfig,
) -> Result<()> {
    for chunk in bytes.chunks(TRANSFER_CHUNK) {
        timeout(config.transfer_idle_timeout, write_half.write_all(chunk)).await??;
    }
    Ok(())
}
