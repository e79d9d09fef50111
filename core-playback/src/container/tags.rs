//! Tag parsing: ID3v2 (MP3/ADTS prefixes), Vorbis comments (Ogg, FLAC,
//! Matroska Vorbis) and the gain conventions they carry.
//!
//! Only the fields surfaced in [`ContainerMetadata`] are extracted.

use super::bytes::{be_u32, le_u32};
use crate::types::{ContainerMetadata, ReplayGain};
use tracing::debug;

/// Tag blocks larger than this are skipped instead of buffered.
pub const MAX_TAG_BYTES: u64 = 128 * 1024;

/// R128 gains are relative to -23 LUFS, ReplayGain to roughly -18 LUFS.
const R128_TO_REPLAYGAIN_DB: f32 = 5.0;

// ============================================================================
// ID3v2
// ============================================================================

/// Parsed 10-byte ID3v2 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Id3Header {
    pub major: u8,
    pub flags: u8,
    /// Tag body size, excluding header and footer.
    pub size: u32,
}

impl Id3Header {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 10 || &data[..3] != b"ID3" {
            return None;
        }
        let major = data[3];
        if !(2..=4).contains(&major) || data[4] == 0xFF {
            return None;
        }
        let size = syncsafe(&data[6..10])?;
        Some(Self {
            major,
            flags: data[5],
            size,
        })
    }

    /// Bytes from the start of the header to the first byte after the tag.
    pub fn total_len(&self) -> u64 {
        let footer = if self.major == 4 && self.flags & 0x10 != 0 {
            10
        } else {
            0
        };
        10 + self.size as u64 + footer
    }
}

fn syncsafe(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < 4 || bytes.iter().any(|b| b & 0x80 != 0) {
        return None;
    }
    Some(bytes[..4].iter().fold(0u32, |acc, &b| (acc << 7) | b as u32))
}

/// Extracts title, artist, ISRC and ReplayGain from an ID3v2 tag body.
pub fn parse_id3v2(header: &Id3Header, body: &[u8]) -> ContainerMetadata {
    let mut meta = ContainerMetadata::default();

    let owned;
    let mut body = body;
    if header.flags & 0x80 != 0 && header.major < 4 {
        owned = remove_unsync(body);
        body = &owned;
    }

    let mut pos = 0usize;
    if header.flags & 0x40 != 0 && header.major >= 3 {
        let ext_len = match header.major {
            3 => be_u32(body, 0).map(|n| n as usize + 4),
            _ => syncsafe(body.get(..4).unwrap_or_default()).map(|n| n as usize),
        };
        match ext_len {
            Some(len) if len <= body.len() => pos = len,
            _ => return meta,
        }
    }

    let (id_len, header_len) = if header.major == 2 { (3, 6) } else { (4, 10) };
    while pos + header_len <= body.len() {
        let id = &body[pos..pos + id_len];
        if id[0] == 0 {
            break;
        }
        let size = match header.major {
            2 => super::bytes::be_uint(body, pos + 3, 3).map(|n| n as usize),
            3 => be_u32(body, pos + 4).map(|n| n as usize),
            _ => syncsafe(&body[pos + 4..pos + 8]).map(|n| n as usize),
        };
        let Some(size) = size else { break };
        let flags = if header.major == 2 {
            0
        } else {
            super::bytes::be_u16(body, pos + 8).unwrap_or(0)
        };
        let start = pos + header_len;
        let end = match start.checked_add(size) {
            Some(end) if end <= body.len() => end,
            _ => break,
        };
        pos = end;

        // Compressed, encrypted and (v2.4) unsynchronised frames are skipped.
        let skip = match header.major {
            3 => flags & 0x00C0 != 0,
            4 => flags & 0x000E != 0,
            _ => false,
        };
        if skip {
            continue;
        }

        let content = &body[start..end];
        match id {
            b"TIT2" | b"TT2" => meta.title = meta.title.or_else(|| id3_text(content)),
            b"TPE1" | b"TP1" => meta.artist = meta.artist.or_else(|| id3_text(content)),
            b"TSRC" | b"TRC" => meta.isrc = meta.isrc.or_else(|| id3_text(content)),
            b"TXXX" | b"TXX" => {
                if let Some((desc, value)) = id3_user_text(content) {
                    if desc.eq_ignore_ascii_case("REPLAYGAIN_TRACK_GAIN") {
                        meta.replay_gain = parse_gain_db(&value)
                            .map(|db| ReplayGain { track_gain_db: db })
                            .or(meta.replay_gain);
                    }
                }
            }
            _ => {}
        }
    }
    meta
}

fn remove_unsync(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut prev = 0u8;
    for &b in data {
        if !(prev == 0xFF && b == 0x00) {
            out.push(b);
        }
        prev = b;
    }
    out
}

fn decode_text(encoding: u8, bytes: &[u8]) -> String {
    match encoding {
        0 => bytes.iter().map(|&b| b as char).collect(),
        1 | 2 => {
            let (big_endian, bytes) = match bytes {
                [0xFE, 0xFF, rest @ ..] => (true, rest),
                [0xFF, 0xFE, rest @ ..] => (false, rest),
                _ => (encoding == 2, bytes),
            };
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|c| {
                    if big_endian {
                        u16::from_be_bytes([c[0], c[1]])
                    } else {
                        u16::from_le_bytes([c[0], c[1]])
                    }
                })
                .collect();
            String::from_utf16_lossy(&units)
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn trim_text(text: String) -> Option<String> {
    let trimmed = text.trim_end_matches('\0').trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn id3_text(content: &[u8]) -> Option<String> {
    let (&encoding, rest) = content.split_first()?;
    // Multiple values are NUL separated; keep the first.
    let first = decode_text(encoding, rest);
    trim_text(first.split('\0').next().unwrap_or_default().to_string())
}

fn id3_user_text(content: &[u8]) -> Option<(String, String)> {
    let (&encoding, rest) = content.split_first()?;
    let text = decode_text(encoding, rest);
    let mut parts = text.splitn(2, '\0');
    let desc = parts.next()?.to_string();
    let value = trim_text(parts.next()?.to_string())?;
    Some((desc, value))
}

// ============================================================================
// Vorbis comments
// ============================================================================

/// Parses a Vorbis comment block (without any packet-type prefix).
pub fn parse_vorbis_comment(data: &[u8]) -> ContainerMetadata {
    let mut meta = ContainerMetadata::default();
    let mut r128_gain = None;

    let Some(vendor_len) = le_u32(data, 0) else {
        return meta;
    };
    let mut pos = 4usize.saturating_add(vendor_len as usize);
    let Some(count) = le_u32(data, pos) else {
        return meta;
    };
    pos += 4;

    for _ in 0..count {
        let Some(len) = le_u32(data, pos) else { break };
        pos += 4;
        let Some(comment) = pos
            .checked_add(len as usize)
            .and_then(|end| data.get(pos..end))
        else {
            break;
        };
        pos += len as usize;

        let comment = String::from_utf8_lossy(comment);
        let Some((key, value)) = comment.split_once('=') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.to_ascii_uppercase().as_str() {
            "TITLE" if meta.title.is_none() => meta.title = Some(value.to_string()),
            "ARTIST" if meta.artist.is_none() => meta.artist = Some(value.to_string()),
            "ISRC" if meta.isrc.is_none() => meta.isrc = Some(value.to_string()),
            "REPLAYGAIN_TRACK_GAIN" => {
                if let Some(db) = parse_gain_db(value) {
                    meta.replay_gain = Some(ReplayGain { track_gain_db: db });
                }
            }
            "R128_TRACK_GAIN" => {
                r128_gain = value
                    .parse::<i16>()
                    .ok()
                    .map(|q| q78_to_db(q) + R128_TO_REPLAYGAIN_DB);
            }
            _ => {}
        }
    }

    if meta.replay_gain.is_none() {
        meta.replay_gain = r128_gain.map(|db| ReplayGain { track_gain_db: db });
    }
    debug!(
        has_title = meta.title.is_some(),
        has_gain = meta.replay_gain.is_some(),
        "Parsed Vorbis comments"
    );
    meta
}

/// Parses `"-6.20 dB"` style gain strings.
pub fn parse_gain_db(value: &str) -> Option<f32> {
    let trimmed = value.trim();
    let number = trimmed
        .strip_suffix("dB")
        .or_else(|| trimmed.strip_suffix("db"))
        .or_else(|| trimmed.strip_suffix("DB"))
        .unwrap_or(trimmed)
        .trim();
    number.parse::<f32>().ok().filter(|db| db.is_finite())
}

/// Q7.8 fixed point (Opus header gain, R128 tags) to dB.
pub fn q78_to_db(value: i16) -> f32 {
    value as f32 / 256.0
}
