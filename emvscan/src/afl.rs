// EMV Book 3, 10.2 Read Application Data
use serde::{Deserialize, Serialize};
use thiserror::Error;

const AFL_ENTRY_LENGTH: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AflError {
    #[error("AFL is empty")]
    Empty,

    #[error("AFL length {0} is not a multiple of 4")]
    Length(usize),

    #[error("AFL entry {index}: SFI {sfi} outside 1..=30")]
    InvalidSfi { index: usize, sfi: u8 },

    #[error("AFL entry {index}: invalid record range {start}..={end}")]
    InvalidRecordRange { index: usize, start: u8, end: u8 },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AflEntry {
    pub sfi: u8,
    pub start_record: u8,
    pub end_record: u8,
    pub offline_auth_record_count: u8,
}

/// One READ RECORD to issue.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadInstruction {
    pub sfi: u8,
    pub record: u8,
    pub p2: u8,
}

impl ReadInstruction {
    pub fn new(sfi: u8, record: u8) -> ReadInstruction {
        ReadInstruction {
            sfi,
            record,
            p2: p2_for_sfi(sfi),
        }
    }
}

/// READ RECORD P2: SFI in the upper five bits, `100` = P1 is a record number.
pub fn p2_for_sfi(sfi: u8) -> u8 {
    (sfi << 3) | 0x04
}

pub fn parse(afl_bytes: &[u8]) -> Result<Vec<AflEntry>, AflError> {
    if afl_bytes.is_empty() {
        return Err(AflError::Empty);
    }

    if afl_bytes.len() % AFL_ENTRY_LENGTH != 0 {
        return Err(AflError::Length(afl_bytes.len()));
    }

    afl_bytes
        .chunks(AFL_ENTRY_LENGTH)
        .enumerate()
        .map(|(index, chunk)| {
            let entry = AflEntry {
                sfi: chunk[0] >> 3,
                start_record: chunk[1],
                end_record: chunk[2],
                offline_auth_record_count: chunk[3],
            };

            if !(1..=30).contains(&entry.sfi) {
                return Err(AflError::InvalidSfi {
                    index,
                    sfi: entry.sfi,
                });
            }

            if entry.start_record == 0 || entry.end_record < entry.start_record {
                return Err(AflError::InvalidRecordRange {
                    index,
                    start: entry.start_record,
                    end: entry.end_record,
                });
            }

            Ok(entry)
        })
        .collect()
}

pub fn plan_reads(entries: &[AflEntry]) -> Vec<ReadInstruction> {
    entries
        .iter()
        .flat_map(|entry| {
            (entry.start_record..=entry.end_record)
                .map(move |record| ReadInstruction::new(entry.sfi, record))
        })
        .collect()
}

/// Records probed when the card gives no usable AFL: SFI 1-3, records 1-3.
pub fn fallback_plan() -> Vec<ReadInstruction> {
    (1..=3)
        .flat_map(|sfi| (1..=3).map(move |record| ReadInstruction::new(sfi, record)))
        .collect()
}
