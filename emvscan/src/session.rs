use crate::afl::ReadInstruction;
use crate::status::StatusWord;
use crate::tags::TagDictionary;
use crate::tlv::{self, TlvEntry, TlvTag};
use crate::workflow::{ApplicationCandidate, Phase, PhaseOutcome};
use chrono::{DateTime, Utc};
use log::{debug, log, warn, Level};
use rand::prelude::*;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Insertion-ordered tag map. A later value for a tag replaces the earlier
/// one in place, so AFL data read first keeps its position.
#[derive(Debug, Default, Clone)]
pub struct TagStore {
    entries: Vec<TlvEntry>,
    index: HashMap<String, usize>,
}

impl TagStore {
    pub fn new() -> TagStore {
        TagStore::default()
    }

    pub fn insert(&mut self, entry: TlvEntry) -> Option<TlvEntry> {
        match self.index.get(entry.tag.as_str()) {
            Some(&i) => Some(std::mem::replace(&mut self.entries[i], entry)),
            None => {
                self.index
                    .insert(entry.tag.as_str().to_string(), self.entries.len());
                self.entries.push(entry);
                None
            }
        }
    }

    pub fn get(&self, tag: &str) -> Option<&TlvEntry> {
        self.index.get(tag).map(|&i| &self.entries[i])
    }

    pub fn value(&self, tag: &str) -> Option<&[u8]> {
        self.get(tag).map(|entry| entry.raw_value.as_slice())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.index.contains_key(tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TlvEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApduLogEntry {
    pub phase: Phase,
    #[serde(with = "crate::hex_bytes")]
    pub command: Vec<u8>,
    #[serde(with = "crate::hex_bytes")]
    pub response: Vec<u8>,
    pub status: StatusWord,
    pub elapsed_ms: u64,
    pub description: String,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordSource {
    Directory,
    Afl,
    Fallback,
    ExtendedScan,
    TransactionLog,
}

#[derive(Debug, Clone)]
pub struct RecordSnapshot {
    pub sfi: u8,
    pub record: u8,
    pub source: RecordSource,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct AidAttempt {
    pub aid: Vec<u8>,
    pub status: StatusWord,
    pub response: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct GetDataSnapshot {
    pub tag: TlvTag,
    pub status: StatusWord,
    pub data: Vec<u8>,
}

/// Raw responses per phase, kept verbatim next to the parsed tag map.
#[derive(Debug, Clone, Default)]
pub struct PhaseSnapshots {
    pub ppse: Option<Vec<u8>>,
    pub aid_attempts: Vec<AidAttempt>,
    pub gpo: Option<Vec<u8>>,
    pub records: Vec<RecordSnapshot>,
    pub cryptogram: Option<Vec<u8>>,
    pub get_data: Vec<GetDataSnapshot>,
    pub log_records: Vec<RecordSnapshot>,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApduCounters {
    pub sent: u32,
    pub succeeded: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub outcome: PhaseOutcome,
}

/// Captured tag in the shape external exporters consume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedTag {
    pub tag: String,
    pub raw: String,
    pub decoded: Option<String>,
}

/// Everything learned from one card session.
#[derive(Debug)]
pub struct SessionScanData {
    pub session_id: String,
    pub card_uid: Option<Vec<u8>>,
    pub started_at: DateTime<Utc>,
    pub tags: TagStore,
    pub apdu_log: Vec<ApduLogEntry>,
    pub snapshots: PhaseSnapshots,
    pub counters: ApduCounters,
    pub phases: Vec<PhaseReport>,
    pub selected_application: Option<ApplicationCandidate>,
}

impl SessionScanData {
    pub fn new(card_uid: Option<Vec<u8>>) -> SessionScanData {
        let started_at = Utc::now();
        let session_id = format!(
            "{}-{:08X}",
            started_at.format("%Y%m%dT%H%M%S"),
            ChaCha20Rng::from_entropy().next_u32()
        );

        SessionScanData {
            session_id,
            card_uid,
            started_at,
            tags: TagStore::new(),
            apdu_log: Vec::new(),
            snapshots: PhaseSnapshots::default(),
            counters: ApduCounters::default(),
            phases: Vec::new(),
            selected_application: None,
        }
    }

    pub fn value(&self, tag: &str) -> Option<&[u8]> {
        self.tags.value(tag)
    }

    /// Decodes a response and stores its leaf entries.
    ///
    /// Returns the tags stored. With `verbose` unset the entries are only
    /// traced, which keeps exploratory reads out of the debug log.
    pub fn merge_tlv(
        &mut self,
        dictionary: &TagDictionary,
        data: &[u8],
        censor: bool,
        verbose: bool,
    ) -> Vec<TlvTag> {
        let entries = match tlv::decode(data) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("Could not parse response as TLV: {}", err);
                return Vec::new();
            }
        };

        let level = if verbose { Level::Debug } else { Level::Trace };
        let mut stored: Vec<TlvTag> = Vec::new();

        for mut entry in entries {
            log!(level, "-{}: {}", entry.tag, dictionary.name(entry.tag.as_str()));
            if entry.is_template {
                continue;
            }

            log!(
                level,
                " -data: {}",
                dictionary.display_value(entry.tag.as_str(), &entry.raw_value, censor)
            );

            dictionary.annotate(&mut entry);
            stored.push(entry.tag.clone());
            self.tags.insert(entry);
        }

        stored
    }

    /// Stores a value the card returned outside of a TLV wrapper.
    pub fn insert_value(
        &mut self,
        dictionary: &TagDictionary,
        tag: TlvTag,
        value: Vec<u8>,
        censor: bool,
    ) {
        debug!(
            "-{}: {}\n -data: {}",
            tag,
            dictionary.name(tag.as_str()),
            dictionary.display_value(tag.as_str(), &value, censor)
        );

        let mut entry = TlvEntry::new(tag, value);
        dictionary.annotate(&mut entry);
        self.tags.insert(entry);
    }

    pub fn record_snapshot(&mut self, read: &ReadInstruction, source: RecordSource, data: Vec<u8>) {
        let snapshot = RecordSnapshot {
            sfi: read.sfi,
            record: read.record,
            source,
            data,
        };

        match source {
            RecordSource::TransactionLog => self.snapshots.log_records.push(snapshot),
            _ => self.snapshots.records.push(snapshot),
        }
    }

    pub fn record_phase(&mut self, phase: Phase, outcome: PhaseOutcome) {
        self.phases.push(PhaseReport { phase, outcome });
    }

    pub fn phase_outcome(&self, phase: Phase) -> Option<&PhaseOutcome> {
        self.phases
            .iter()
            .find(|report| report.phase == phase)
            .map(|report| &report.outcome)
    }

    pub fn exported_tags(&self) -> Vec<ExportedTag> {
        self.tags
            .iter()
            .map(|entry| ExportedTag {
                tag: entry.tag.to_string(),
                raw: hex::encode_upper(&entry.raw_value),
                decoded: entry.decoded_value.clone(),
            })
            .collect()
    }
}
