// EMV Book 3, Annex B: Rules for BER-TLV Data Objects
use log::{trace, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// Templates nest a handful of levels in practice (6F > A5 > BF0C > 61).
const MAX_TEMPLATE_DEPTH: usize = 8;

// Tags whose constructed bit is set on some cards but which always carry
// a flat tag/length list (data object lists, tag lists).
const ALWAYS_PRIMITIVE_TAGS: &[&str] = &["8C", "8D", "97", "9F38", "9F49", "9F4A", "9F4F"];

// EMV templates that are expanded regardless of what the first value byte looks like.
const KNOWN_TEMPLATE_TAGS: &[&str] = &[
    "61", "6F", "70", "73", "77", "A5", "BF0C", "E1", "E2",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TlvError {
    #[error("unexpected end of data while parsing tag at offset {offset}")]
    UnexpectedEndTag { offset: usize },

    #[error("unexpected end of data while parsing length at offset {offset}")]
    UnexpectedEndLength { offset: usize },

    #[error("unsupported length byte {byte:02X} at offset {offset}")]
    InvalidLength { offset: usize, byte: u8 },

    #[error("value of {length} bytes at offset {offset} overruns buffer ({available} bytes left)")]
    ValueOverrun {
        offset: usize,
        length: usize,
        available: usize,
    },

    #[error("invalid tag {0:?}")]
    InvalidTag(String),
}

/// BER tag identifier, kept as normalized uppercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TlvTag {
    hex: String,
    constructed: bool,
}

impl TlvTag {
    pub fn from_bytes(bytes: &[u8]) -> TlvTag {
        TlvTag {
            hex: hex::encode_upper(bytes),
            constructed: bytes.first().map_or(false, |b| b & 0x20 != 0),
        }
    }

    /// Parses a hex tag name such as `"9f38"` and checks that it is one complete BER tag.
    pub fn parse(tag_name: &str) -> Result<TlvTag, TlvError> {
        let bytes =
            hex::decode(tag_name.trim()).map_err(|_| TlvError::InvalidTag(tag_name.to_string()))?;

        match read_tag(&bytes, 0) {
            Ok(end) if end == bytes.len() => Ok(TlvTag::from_bytes(&bytes)),
            _ => Err(TlvError::InvalidTag(tag_name.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.hex
    }

    pub fn is_constructed(&self) -> bool {
        self.constructed
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // hex was produced by encode_upper or validated in parse
        hex::decode(&self.hex).unwrap_or_default()
    }
}

impl fmt::Display for TlvTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

impl TryFrom<String> for TlvTag {
    type Error = TlvError;

    fn try_from(tag_name: String) -> Result<Self, Self::Error> {
        TlvTag::parse(&tag_name)
    }
}

impl From<TlvTag> for String {
    fn from(tag: TlvTag) -> Self {
        tag.hex
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvEntry {
    pub tag: TlvTag,
    pub raw_value: Vec<u8>,
    pub decoded_value: Option<String>,
    pub is_template: bool,
}

impl TlvEntry {
    pub fn new(tag: TlvTag, raw_value: Vec<u8>) -> TlvEntry {
        TlvEntry {
            tag,
            raw_value,
            decoded_value: None,
            is_template: false,
        }
    }
}

// Returns the offset one past the last tag byte.
fn read_tag(data: &[u8], offset: usize) -> Result<usize, TlvError> {
    let first = *data
        .get(offset)
        .ok_or(TlvError::UnexpectedEndTag { offset })?;

    let mut i = offset + 1;
    if first & 0x1F == 0x1F {
        loop {
            let b = *data.get(i).ok_or(TlvError::UnexpectedEndTag { offset })?;
            i += 1;
            if b & 0x80 == 0 {
                break;
            }
        }
    }

    Ok(i)
}

// Returns (value length, offset of the first value byte).
fn read_length(data: &[u8], offset: usize) -> Result<(usize, usize), TlvError> {
    let first = *data
        .get(offset)
        .ok_or(TlvError::UnexpectedEndLength { offset })?;

    if first < 0x80 {
        return Ok((first as usize, offset + 1));
    }

    let count = (first & 0x7F) as usize;
    if count == 0 || count > 3 {
        return Err(TlvError::InvalidLength {
            offset,
            byte: first,
        });
    }

    let bytes = data
        .get(offset + 1..offset + 1 + count)
        .ok_or(TlvError::UnexpectedEndLength { offset })?;
    let length = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);

    Ok((length, offset + 1 + count))
}

/// Reads one tag and its length header at `offset`.
///
/// Returns the tag, the value length and the offset of the first value byte.
/// Used by data object list parsing, where no value follows the length.
pub fn read_header(data: &[u8], offset: usize) -> Result<(TlvTag, usize, usize), TlvError> {
    let tag_end = read_tag(data, offset)?;
    let (length, value_start) = read_length(data, tag_end)?;

    Ok((TlvTag::from_bytes(&data[offset..tag_end]), length, value_start))
}

/// Minimal BER length encoding.
pub fn encode_length(length: usize) -> Vec<u8> {
    match length {
        0..=0x7F => vec![length as u8],
        0x80..=0xFF => vec![0x81, length as u8],
        0x100..=0xFFFF => vec![0x82, (length >> 8) as u8, length as u8],
        _ => vec![
            0x83,
            (length >> 16) as u8,
            (length >> 8) as u8,
            length as u8,
        ],
    }
}

pub fn encode_entry(tag: &TlvTag, value: &[u8]) -> Vec<u8> {
    let mut output = tag.to_bytes();
    output.extend(encode_length(value.len()));
    output.extend_from_slice(value);

    output
}

/// Serializes entries back to back. Template entries are written from their
/// raw value, so callers pass only one nesting level.
pub fn encode(entries: &[TlvEntry]) -> Vec<u8> {
    entries
        .iter()
        .flat_map(|entry| encode_entry(&entry.tag, &entry.raw_value))
        .collect()
}

/// Decides whether a constructed-looking entry is expanded as a template.
///
/// Allow-listed data object lists stay primitive, known EMV templates are
/// always expanded, and any other tag is trusted on its constructed bit only
/// when the value does not start with a padding byte.
pub fn is_template_candidate(tag: &TlvTag, value: &[u8]) -> bool {
    if ALWAYS_PRIMITIVE_TAGS.contains(&tag.as_str()) {
        return false;
    }

    if KNOWN_TEMPLATE_TAGS.contains(&tag.as_str()) {
        return true;
    }

    tag.is_constructed() && matches!(value.first(), Some(b) if *b != 0x00 && *b != 0xFF)
}

fn parse_level(
    data: &[u8],
    depth: usize,
    recurse: bool,
    output: &mut Vec<TlvEntry>,
) -> Option<TlvError> {
    let mut first_error: Option<TlvError> = None;
    let mut i = 0;

    while i < data.len() {
        // 00 and FF may pad between data objects
        if data[i] == 0x00 || data[i] == 0xFF {
            i += 1;
            continue;
        }

        let (tag, length, value_start) = match read_header(data, i) {
            Ok(header) => header,
            Err(err) => {
                warn!("Skipping malformed TLV: {}", err);
                first_error.get_or_insert(err);
                i += 2;
                continue;
            }
        };

        let available = data.len() - value_start;
        if length > available {
            let err = TlvError::ValueOverrun {
                offset: i,
                length,
                available,
            };
            warn!("Skipping malformed TLV: {}", err);
            first_error.get_or_insert(err);
            i += 2;
            continue;
        }

        let value = &data[value_start..value_start + length];
        i = value_start + length;

        let mut entry = TlvEntry::new(tag, value.to_vec());

        if recurse && depth < MAX_TEMPLATE_DEPTH && is_template_candidate(&entry.tag, value) {
            let mut children: Vec<TlvEntry> = Vec::new();
            let child_error = parse_level(value, depth + 1, true, &mut children);

            // known templates tolerate a damaged tail, other tags must nest cleanly
            let lenient = KNOWN_TEMPLATE_TAGS.contains(&entry.tag.as_str());
            if child_error.is_none() || (lenient && !children.is_empty()) {
                entry.is_template = true;
                output.push(entry);
                output.extend(children);
                continue;
            }

            trace!(
                "Tag {} looks constructed but does not nest TLV, keeping it as a leaf",
                entry.tag
            );
        }

        output.push(entry);
    }

    first_error
}

/// Decodes a buffer into a flat, ordered list of entries.
///
/// Each template entry is followed by its (recursively decoded) children.
/// Malformed data mid-buffer is logged and skipped; an error is returned only
/// when nothing could be decoded at all.
pub fn decode(data: &[u8]) -> Result<Vec<TlvEntry>, TlvError> {
    collect(data, true)
}

/// Decodes only the top level of a buffer, leaving templates unexpanded.
pub fn decode_shallow(data: &[u8]) -> Result<Vec<TlvEntry>, TlvError> {
    collect(data, false)
}

fn collect(data: &[u8], recurse: bool) -> Result<Vec<TlvEntry>, TlvError> {
    let mut entries: Vec<TlvEntry> = Vec::new();

    match parse_level(data, 0, recurse, &mut entries) {
        Some(err) if entries.is_empty() => Err(err),
        _ => Ok(entries),
    }
}

/// First entry carrying `tag`, searching nested templates too.
pub fn find<'a>(entries: &'a [TlvEntry], tag: &str) -> Option<&'a TlvEntry> {
    entries.iter().find(|entry| entry.tag.as_str() == tag)
}
