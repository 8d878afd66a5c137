//! Media datagram framing
//!
//! Every uplink datagram on the video, audio, and screen planes is
//! `[4-byte big-endian publisher_id][payload]`. Video and screen payloads
//! are opaque; audio payloads must be exactly one PCM chunk (mono, 16-bit
//! signed little-endian) or the datagram is dropped. Audio downlink mixes
//! carry raw PCM with no id header.

use bytes::{BufMut, BytesMut};

use crate::config::CHUNK_SAMPLES;

/// Length of the publisher-id prefix
pub const MEDIA_HEADER_LEN: usize = 4;

/// The only accepted length for an audio uplink datagram
pub const AUDIO_DATAGRAM_LEN: usize = MEDIA_HEADER_LEN + CHUNK_SAMPLES * 2;

/// Frame a payload with its publisher id
pub fn encode_media(publisher_id: u32, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(MEDIA_HEADER_LEN + payload.len());
    buf.put_u32(publisher_id);
    buf.put_slice(payload);
    buf
}

/// Split a datagram into its publisher id and payload
///
/// Returns `None` for datagrams shorter than the id header.
pub fn split_media(datagram: &[u8]) -> Option<(u32, &[u8])> {
    if datagram.len() < MEDIA_HEADER_LEN {
        return None;
    }
    let id = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
    Some((id, &datagram[MEDIA_HEADER_LEN..]))
}

/// Decode the PCM chunk of an audio datagram payload
///
/// Returns `None` unless the payload is exactly `CHUNK_SAMPLES` samples.
pub fn decode_pcm_chunk(payload: &[u8]) -> Option<Vec<i16>> {
    if payload.len() != CHUNK_SAMPLES * 2 {
        return None;
    }
    Some(
        payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect(),
    )
}

/// Encode samples as the raw PCM body of a downlink mix
pub fn encode_pcm(samples: &[i16]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for sample in samples {
        buf.put_i16_le(*sample);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_round_trip() {
        let framed = encode_media(0xDEAD_BEEF, b"frame bytes");
        let (id, payload) = split_media(&framed).unwrap();
        assert_eq!(id, 0xDEAD_BEEF);
        assert_eq!(payload, b"frame bytes");
    }

    #[test]
    fn test_header_is_big_endian() {
        let framed = encode_media(1, b"");
        assert_eq!(&framed[..], &[0, 0, 0, 1]);
    }

    #[test]
    fn test_short_datagram_rejected() {
        assert!(split_media(&[0, 1, 2]).is_none());
        let (id, payload) = split_media(&[0, 0, 0, 5]).unwrap();
        assert_eq!(id, 5);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_pcm_chunk_length_is_exact() {
        assert!(decode_pcm_chunk(&vec![0u8; CHUNK_SAMPLES * 2 - 2]).is_none());
        assert!(decode_pcm_chunk(&vec![0u8; CHUNK_SAMPLES * 2 + 2]).is_none());
        assert!(decode_pcm_chunk(&vec![0u8; CHUNK_SAMPLES * 2]).is_some());
    }

    #[test]
    fn test_pcm_round_trip_little_endian() {
        let samples: Vec<i16> = (0..CHUNK_SAMPLES as i16).map(|n| n - 512).collect();
        let encoded = encode_pcm(&samples);
        assert_eq!(encoded.len(), CHUNK_SAMPLES * 2);
        assert_eq!(encoded[0], (samples[0] as u16 & 0xFF) as u8);
        let decoded = decode_pcm_chunk(&encoded).unwrap();
        assert_eq!(decoded, samples);
    }
}
