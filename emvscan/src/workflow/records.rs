use super::{Phase, PhaseOutcome, PhaseResult, TransactionWorkflow};
use crate::afl::{self, ReadInstruction};
use crate::dol;
use crate::session::RecordSource;
use crate::status::StatusWord;
use crate::tlv::{self, TlvTag};
use crate::transport::commands;
use crate::ApplicationInterchangeProfile;
use log::{debug, info, warn};

/// Tags needed for offline authentication and CVM analysis.
const EXTENDED_SCAN_TARGETS: [&str; 7] = ["8E", "8C", "8D", "8F", "9F32", "9F47", "93"];
const EXTENDED_SCAN_SFIS: std::ops::RangeInclusive<u8> = 1..=3;
const EXTENDED_SCAN_RECORDS: std::ops::RangeInclusive<u8> = 1..=16;

/// GPO response Format 1 (80): AIP followed by the AFL.
fn split_format1(value: &[u8]) -> Option<(&[u8], &[u8])> {
    if value.len() < 2 {
        return None;
    }
    Some(value.split_at(2))
}

/// Logs are only read when the card reports a log format (9F4F). A log
/// entry (9F4D) next to it names SFI and record count directly.
fn log_location(log_entry: Option<&[u8]>, log_format: Option<&[u8]>) -> Option<(u8, u8)> {
    match (log_format?, log_entry) {
        (_, Some([sfi, count, ..])) => Some((*sfi, *count)),
        ([b0, b1, ..], _) => Some((b0 >> 3, b1 & 0x1F)),
        _ => None,
    }
}

impl<'a> TransactionWorkflow<'a> {
    pub(super) fn get_processing_options(&mut self) -> PhaseResult {
        let pdol = self.session.value("9F38").map(dol::parse_dol).unwrap_or_default();
        if !pdol.is_empty() {
            debug!("PDOL: {}", dol::describe(&pdol, &self.context.tags));
        }

        let pdol_data = dol::build(&pdol, &self.values);
        let response = self.exchange(Phase::Gpo, &commands::get_processing_options(&pdol_data)?)?;
        if !response.is_success() {
            return Ok(PhaseOutcome::Failed(self.channel.describe(response.status)));
        }

        self.session.snapshots.gpo = Some(response.data.clone());

        let format1 = match response.data.first() {
            Some(0x80) => tlv::decode_shallow(&response.data)
                .ok()
                .and_then(|entries| tlv::find(&entries, "80").map(|e| e.raw_value.clone())),
            _ => None,
        };

        let (aip, afl) = if let Some(value) = format1 {
            let (aip, afl) = match split_format1(&value) {
                Some(parts) => parts,
                None => {
                    return Ok(PhaseOutcome::Failed(
                        "GPO response format 1 too short".to_string(),
                    ))
                }
            };

            let tags = &self.context.tags;
            for (tag, value) in [("82", aip), ("94", afl)] {
                if let Ok(tag) = TlvTag::parse(tag) {
                    self.session.insert_value(tags, tag, value.to_vec(), self.censor);
                }
            }
            (aip.to_vec(), afl.to_vec())
        } else {
            self.session
                .merge_tlv(&self.context.tags, &response.data, self.censor, true);

            match self.session.value("82") {
                Some(aip) => (
                    aip.to_vec(),
                    self.session.value("94").map(|afl| afl.to_vec()).unwrap_or_default(),
                ),
                None => {
                    return Ok(PhaseOutcome::Failed(
                        "unrecognised GPO response".to_string(),
                    ))
                }
            }
        };

        match ApplicationInterchangeProfile::try_from(&aip[..]) {
            Ok(profile) => info!("Application Interchange Profile:\n{}", profile),
            Err(err) => warn!("Invalid AIP {:02X?}: {}", aip, err),
        }

        if let Some(atc) = self.session.value("9F36") {
            self.values.echo_card_value("9F36", atc);
        }

        self.afl = Some(afl);
        Ok(PhaseOutcome::Completed)
    }

    pub(super) fn read_application_data(&mut self) -> PhaseResult {
        let (plan, source) = match self.afl.as_deref().map(afl::parse) {
            Some(Ok(entries)) if !entries.is_empty() => (afl::plan_reads(&entries), RecordSource::Afl),
            Some(Ok(_)) => {
                warn!("Empty AFL, probing default record layout");
                (afl::fallback_plan(), RecordSource::Fallback)
            }
            Some(Err(err)) => {
                warn!("Malformed AFL ({}), probing default record layout", err);
                (afl::fallback_plan(), RecordSource::Fallback)
            }
            None => {
                info!("No AFL, probing default record layout");
                (afl::fallback_plan(), RecordSource::Fallback)
            }
        };

        let mut records_read = 0;
        for read in plan.iter() {
            debug!("Reading SFI {} record {}", read.sfi, read.record);
            let (response, _) = self.read_record(Phase::AflRecordRead, read, source, true)?;
            if response.is_success() {
                records_read += 1;
            } else {
                debug!(
                    "SFI {} record {}: {}",
                    read.sfi,
                    read.record,
                    self.channel.describe(response.status)
                );
            }
        }

        if records_read == 0 {
            return Ok(PhaseOutcome::Failed(format!(
                "none of {} planned records could be read",
                plan.len()
            )));
        }

        Ok(PhaseOutcome::Completed)
    }

    /// Probes records the AFL did not list, looking for authentication data.
    pub(super) fn extended_record_scan(&mut self) -> PhaseResult {
        let mut missing: Vec<&str> = EXTENDED_SCAN_TARGETS
            .iter()
            .copied()
            .filter(|tag| !self.session.tags.contains(tag))
            .collect();

        if missing.is_empty() {
            return Ok(PhaseOutcome::Skipped("all target tags present".to_string()));
        }

        info!("Scanning for missing tags {:?}", missing);

        'sfi: for sfi in EXTENDED_SCAN_SFIS {
            for record in EXTENDED_SCAN_RECORDS {
                if self.read_records.contains(&(sfi, record)) {
                    continue;
                }

                let read = ReadInstruction::new(sfi, record);
                let (response, stored) =
                    self.read_record(Phase::ExtendedRecordScan, &read, RecordSource::ExtendedScan, false)?;

                if response.status == StatusWord::FILE_NOT_FOUND {
                    debug!("SFI {} not present", sfi);
                    continue 'sfi;
                }

                let found: Vec<&str> = missing
                    .iter()
                    .copied()
                    .filter(|tag| stored.iter().any(|s| s.as_str() == *tag))
                    .collect();
                if found.is_empty() {
                    continue;
                }

                for tag in found.iter() {
                    if let Some(value) = self.session.value(tag) {
                        debug!(
                            "SFI {} record {} -{}: {}\n -data: {}",
                            sfi,
                            record,
                            tag,
                            self.context.tags.name(tag),
                            self.context.tags.display_value(tag, value, self.censor)
                        );
                    }
                }
                missing.retain(|tag| !found.contains(tag));

                if missing.is_empty() {
                    info!("All target tags found");
                    return Ok(PhaseOutcome::Completed);
                }
            }
        }

        if !missing.is_empty() {
            info!("Tags not found on card: {:?}", missing);
        }

        Ok(PhaseOutcome::Completed)
    }

    pub(super) fn read_transaction_logs(&mut self) -> PhaseResult {
        let (sfi, count) = match log_location(self.session.value("9F4D"), self.session.value("9F4F")) {
            Some(location) => location,
            None => return Ok(PhaseOutcome::Skipped("no log format".to_string())),
        };

        if !(1..=30).contains(&sfi) || count == 0 {
            return Ok(PhaseOutcome::Skipped(format!(
                "log location SFI {} with {} records",
                sfi, count
            )));
        }

        info!("Reading {} transaction log records from SFI {}", count, sfi);

        for record in 1..=count {
            let read = ReadInstruction::new(sfi, record);
            let response = self.exchange(Phase::TransactionLogs, &commands::read_record(&read))?;

            if response.status == StatusWord::RECORD_NOT_FOUND
                || response.status == StatusWord::FILE_NOT_FOUND
            {
                debug!("No more log records after {}", record - 1);
                break;
            }

            if response.is_success() {
                debug!("Log record {}: {:02X?}", record, response.data);
                self.session
                    .record_snapshot(&read, RecordSource::TransactionLog, response.data);
            }
        }

        Ok(PhaseOutcome::Completed)
    }
}
