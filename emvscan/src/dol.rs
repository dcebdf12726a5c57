// EMV Book 3, 5.4 Rules for Using a Data Object List (DOL)
use crate::tags::TagDictionary;
use crate::terminal::TransactionValueSource;
use crate::tlv::{self, TlvTag};
use log::{debug, warn};
use std::fmt::Write;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DolBuildError {
    #[error("tag {tag} value is {actual} bytes but {expected} were requested, keeping the rightmost bytes")]
    Truncated {
        tag: String,
        actual: usize,
        expected: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DolEntry {
    pub tag: TlvTag,
    pub expected_length: u16,
}

/// Splits a DOL into (tag, length) pairs. A malformed tail is logged and
/// dropped; the pairs read before it are kept.
pub fn parse_dol(bytes: &[u8]) -> Vec<DolEntry> {
    let mut entries: Vec<DolEntry> = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match tlv::read_header(bytes, i) {
            Ok((tag, length, next)) => {
                if length > u16::MAX as usize {
                    warn!("DOL entry {} requests {} bytes, ignoring the rest", tag, length);
                    break;
                }
                entries.push(DolEntry {
                    tag,
                    expected_length: length as u16,
                });
                i = next;
            }
            Err(err) => {
                warn!("Incorrect DOL at offset {}: {}", i, err);
                break;
            }
        }
    }

    entries
}

pub fn encode_dol(dol: &[DolEntry]) -> Vec<u8> {
    let mut output: Vec<u8> = Vec::new();
    for entry in dol {
        output.extend(entry.tag.to_bytes());
        output.extend(tlv::encode_length(entry.expected_length as usize));
    }

    output
}

/// Sizes a value to exactly `expected_length` bytes: shorter values are
/// left-padded with zeros, longer ones keep their rightmost bytes.
pub fn fit_value(entry: &DolEntry, value: &[u8]) -> (Vec<u8>, Option<DolBuildError>) {
    let expected = entry.expected_length as usize;

    if value.len() > expected {
        let error = DolBuildError::Truncated {
            tag: entry.tag.to_string(),
            actual: value.len(),
            expected,
        };
        return (value[value.len() - expected..].to_vec(), Some(error));
    }

    let mut output = vec![0u8; expected - value.len()];
    output.extend_from_slice(value);

    (output, None)
}

/// Concatenates the terminal values requested by `dol`, in DOL order.
/// Tags without a known value are zero filled.
pub fn build(dol: &[DolEntry], values: &TransactionValueSource) -> Vec<u8> {
    let mut output: Vec<u8> = Vec::new();

    for entry in dol {
        let value: &[u8] = match values.get(entry.tag.as_str()) {
            Some(value) => value,
            None => {
                debug!("tag {} has no value, filling with zeros", entry.tag);
                &[]
            }
        };

        let (field, error) = fit_value(entry, value);
        if let Some(error) = error {
            warn!("{}", error);
        }
        output.extend(field);
    }

    output
}

pub fn describe(dol: &[DolEntry], dictionary: &TagDictionary) -> String {
    let mut output = String::new();
    for entry in dol {
        let _ = write!(
            output,
            "{} - {} ({}b); ",
            entry.tag,
            dictionary.name(entry.tag.as_str()),
            entry.expected_length
        );
    }

    output
}
