//! Wire formats for the conference server
//!
//! This module provides:
//! - Line-oriented parsing/rendering for the control, screen-control, and
//!   file-transfer planes
//! - Datagram framing for the media planes

pub mod datagram;
pub mod line;

pub use datagram::{
    AUDIO_DATAGRAM_LEN, MEDIA_HEADER_LEN, decode_pcm_chunk, encode_media, encode_pcm, split_media,
};
pub use line::{ControlCommand, FileCommand, RosterEntry, ScreenCommand};
