//! Line-oriented wire format for the reliable planes
//!
//! Every message is one UTF-8 line terminated by `\n`. Fields are separated
//! by `:`; the body, being the last field, is taken verbatim to end of line
//! and may itself contain colons. Parsers receive lines with the terminator
//! already stripped.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};

/// Longest accepted username, in bytes
pub const MAX_USERNAME_LEN: usize = 64;

/// Opens the chat-history replay on a fresh control connection
pub const HISTORY_BEGIN: &str = "HISTORY_BEGIN\n";
/// Closes the chat-history replay
pub const HISTORY_END: &str = "HISTORY_END\n";
/// Keepalive reply on the control plane
pub const PONG: &str = "PONG\n";
/// Go-ahead for an upload body
pub const READY: &str = "READY\n";
/// Grant reply on the screen-control plane
pub const PRESENTER_OK: &str = "PRESENTER_OK\n";
/// Denial reply on the screen-control plane
pub const PRESENTER_DENIED: &str = "PRESENTER_DENIED\n";

/// Inbound commands on a control connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// `REGISTER:<username>`, required as the first line on the connection
    Register { username: String },
    /// `CHAT_MESSAGE:<body>` group chat
    Chat { body: String },
    /// `PRIVATE_CHAT:<id1>,<id2>,...:<body>` addressed chat
    PrivateChat { recipients: Vec<u32>, body: String },
    /// `PING` keepalive
    Ping,
}

/// Inbound commands on a screen-control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenCommand {
    /// `HELLO:<client_id>` binds the stream to a participant
    Hello { client_id: u32 },
    /// `REQUEST_PRESENTER`
    Request,
    /// `RELEASE_PRESENTER`
    Release,
}

/// The single command accepted on a file-transfer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileCommand {
    Upload {
        client_id: u32,
        username: String,
        filename: String,
        size: usize,
    },
    Download {
        file_id: u32,
    },
    Delete {
        file_id: u32,
        client_id: u32,
    },
}

/// One `[id, username]` pair in a roster snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: u32,
    pub username: String,
}

/// Parse one line from a control connection
pub fn parse_control(line: &str) -> Result<ControlCommand> {
    if line == "PING" {
        return Ok(ControlCommand::Ping);
    }
    if let Some(username) = line.strip_prefix("REGISTER:") {
        let username = username.trim();
        if username.is_empty() {
            return Err(ServerError::protocol("Empty username"));
        }
        if username.len() > MAX_USERNAME_LEN {
            return Err(ServerError::protocol("Username too long"));
        }
        return Ok(ControlCommand::Register {
            username: username.to_string(),
        });
    }
    if let Some(body) = line.strip_prefix("CHAT_MESSAGE:") {
        return Ok(ControlCommand::Chat {
            body: body.to_string(),
        });
    }
    if let Some(rest) = line.strip_prefix("PRIVATE_CHAT:") {
        let (ids, body) = rest
            .split_once(':')
            .ok_or_else(|| ServerError::protocol("Missing private chat body"))?;
        // Tokens that do not parse as decimal ids are skipped, like unknown ids
        let recipients = ids
            .split(',')
            .filter_map(|tok| tok.trim().parse::<u32>().ok())
            .collect();
        return Ok(ControlCommand::PrivateChat {
            recipients,
            body: body.to_string(),
        });
    }
    Err(ServerError::protocol(format!(
        "Unrecognized control command: {}",
        truncate_for_log(line)
    )))
}

/// Parse one line from a screen-control connection
pub fn parse_screen(line: &str) -> Result<ScreenCommand> {
    match line {
        "REQUEST_PRESENTER" => Ok(ScreenCommand::Request),
        "RELEASE_PRESENTER" => Ok(ScreenCommand::Release),
        _ => {
            if let Some(id) = line.strip_prefix("HELLO:") {
                let client_id = id
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| ServerError::protocol("Invalid client id in HELLO"))?;
                Ok(ScreenCommand::Hello { client_id })
            } else {
                Err(ServerError::protocol(format!(
                    "Unrecognized screen command: {}",
                    truncate_for_log(line)
                )))
            }
        }
    }
}

/// Parse the single command line of a file-transfer connection
///
/// `UPLOAD` carries the declared size as the final field so the filename may
/// contain colons; the client id and username may not.
pub fn parse_file_command(line: &str) -> Result<FileCommand> {
    if let Some(rest) = line.strip_prefix("UPLOAD:") {
        let (id, rest) = rest
            .split_once(':')
            .ok_or_else(|| ServerError::protocol("Malformed upload command"))?;
        let (username, rest) = rest
            .split_once(':')
            .ok_or_else(|| ServerError::protocol("Malformed upload command"))?;
        let (filename, size) = rest
            .rsplit_once(':')
            .ok_or_else(|| ServerError::protocol("Malformed upload command"))?;
        if filename.is_empty() {
            return Err(ServerError::protocol("Empty filename"));
        }
        let client_id = id
            .parse::<u32>()
            .map_err(|_| ServerError::protocol("Invalid client id"))?;
        let size = size
            .parse::<usize>()
            .map_err(|_| ServerError::protocol("Invalid file size"))?;
        return Ok(FileCommand::Upload {
            client_id,
            username: username.to_string(),
            filename: filename.to_string(),
            size,
        });
    }
    if let Some(id) = line.strip_prefix("DOWNLOAD:") {
        let file_id = id
            .trim()
            .parse::<u32>()
            .map_err(|_| ServerError::protocol("Invalid file id"))?;
        return Ok(FileCommand::Download { file_id });
    }
    if let Some(rest) = line.strip_prefix("DELETE:") {
        let (fid, cid) = rest
            .split_once(':')
            .ok_or_else(|| ServerError::protocol("Malformed delete command"))?;
        let file_id = fid
            .parse::<u32>()
            .map_err(|_| ServerError::protocol("Invalid file id"))?;
        let client_id = cid
            .parse::<u32>()
            .map_err(|_| ServerError::protocol("Invalid client id"))?;
        return Ok(FileCommand::Delete { file_id, client_id });
    }
    Err(ServerError::protocol(format!(
        "Unrecognized file command: {}",
        truncate_for_log(line)
    )))
}

/// `ID:<client_id>` sent immediately after admission
pub fn id_line(id: u32) -> String {
    format!("ID:{}\n", id)
}

/// `ROSTER:<json>`: the snapshot is serialized as a compact JSON array;
/// string escaping keeps the line free of raw newlines
pub fn roster_line(entries: &[RosterEntry]) -> Result<String> {
    Ok(format!("ROSTER:{}\n", serde_json::to_string(entries)?))
}

/// `CHAT:<sender_id>:<username>:<HH:MM:SS>:<body>`
pub fn chat_line(sender_id: u32, username: &str, timestamp: &str, body: &str) -> String {
    format!("CHAT:{}:{}:{}:{}\n", sender_id, username, timestamp, body)
}

/// `PRIVATE:<sender_id>:<username>:<HH:MM:SS>:<recipient_names>:<body>`
pub fn private_line(
    sender_id: u32,
    username: &str,
    timestamp: &str,
    recipient_names: &str,
    body: &str,
) -> String {
    format!(
        "PRIVATE:{}:{}:{}:{}:{}\n",
        sender_id, username, timestamp, recipient_names, body
    )
}

/// `SYSTEM:<body>`
pub fn system_line(body: &str) -> String {
    format!("SYSTEM:{}\n", body)
}

/// `PRESENTER:<client_id>` or `PRESENTER:NONE`
pub fn presenter_line(presenter: Option<u32>) -> String {
    match presenter {
        Some(id) => format!("PRESENTER:{}\n", id),
        None => "PRESENTER:NONE\n".to_string(),
    }
}

/// `FILE_OFFER:<file_id>:<filename>:<size>:<uploader_name>:<uploader_id>`
pub fn file_offer_line(
    file_id: u32,
    filename: &str,
    size: usize,
    uploader_name: &str,
    uploader_id: u32,
) -> String {
    format!(
        "FILE_OFFER:{}:{}:{}:{}:{}\n",
        file_id, filename, size, uploader_name, uploader_id
    )
}

/// `FILE_DELETED:<file_id>`
pub fn file_deleted_line(file_id: u32) -> String {
    format!("FILE_DELETED:{}\n", file_id)
}

/// `ERROR:<reason>`
pub fn error_line(reason: &str) -> String {
    format!("ERROR:{}\n", reason)
}

/// `SUCCESS:<file_id>` closing a completed upload
pub fn upload_success_line(file_id: u32) -> String {
    format!("SUCCESS:{}\n", file_id)
}

/// `FILE:<filename>:<size>` announcing a download body
pub fn download_header_line(filename: &str, size: usize) -> String {
    format!("FILE:{}:{}\n", filename, size)
}

/// `DELETE_SUCCESS:<file_id>`
pub fn delete_success_line(file_id: u32) -> String {
    format!("DELETE_SUCCESS:{}\n", file_id)
}

fn truncate_for_log(line: &str) -> &str {
    let end = line
        .char_indices()
        .nth(32)
        .map(|(i, _)| i)
        .unwrap_or(line.len());
    &line[..end]
}
