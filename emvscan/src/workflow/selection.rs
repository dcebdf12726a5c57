use super::{ApplicationCandidate, Phase, PhaseError, PhaseOutcome, PhaseResult, TransactionWorkflow};
use crate::afl::ReadInstruction;
use crate::session::{AidAttempt, RecordSource};
use crate::tlv::{self, TlvEntry};
use crate::transport::{commands, TransportError};
use log::{debug, info, warn};

const PPSE_NAME: &[u8] = b"2PAY.SYS.DDF01";
const PSE_NAME: &[u8] = b"1PAY.SYS.DDF01";

// EMV Book 1, 12.2.3: directory records live at most at record 16.
const MAX_DIRECTORY_RECORDS: u8 = 16;

fn label_text(value: &[u8]) -> String {
    String::from_utf8_lossy(value).trim().to_string()
}

/// Application candidates from every Application Template (61) in a decoded
/// FCI or directory record.
fn candidates_from(entries: &[TlvEntry]) -> Vec<ApplicationCandidate> {
    entries
        .iter()
        .filter(|entry| entry.tag.as_str() == "61")
        .filter_map(|template| {
            let children = tlv::decode(&template.raw_value).ok()?;
            let aid = match tlv::find(&children, "4F") {
                Some(aid) => aid.raw_value.clone(),
                None => {
                    warn!("Directory entry without AID: {:02X?}", template.raw_value);
                    return None;
                }
            };

            Some(ApplicationCandidate {
                aid,
                label: tlv::find(&children, "50")
                    .map(|label| label_text(&label.raw_value))
                    .unwrap_or_else(|| "UNKNOWN".to_string()),
                preferred_name: tlv::find(&children, "9F12")
                    .map(|name| label_text(&name.raw_value)),
                priority: tlv::find(&children, "87")
                    .and_then(|priority| priority.raw_value.first())
                    .map_or(0, |priority| priority & 0x0F),
            })
        })
        .collect()
}

/// Lowest priority number first, unprioritized (0) entries last, card order otherwise.
fn sort_candidates(candidates: &mut [ApplicationCandidate]) {
    candidates.sort_by_key(|candidate| match candidate.priority {
        0 => u8::MAX,
        priority => priority,
    });
}

impl<'a> TransactionWorkflow<'a> {
    pub(super) fn select_payment_environment(&mut self) -> PhaseResult {
        for name in [PPSE_NAME, PSE_NAME] {
            let environment = String::from_utf8_lossy(name).to_string();
            info!("Selecting {}", environment);

            let response = self.exchange(Phase::Ppse, &commands::select(name)?)?;
            if !response.is_success() {
                warn!(
                    "{} not available: {}",
                    environment,
                    self.channel.describe(response.status)
                );
                continue;
            }

            self.session.snapshots.ppse = Some(response.data.clone());
            self.session
                .merge_tlv(&self.context.tags, &response.data, self.censor, true);

            let entries = match tlv::decode(&response.data) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("Could not parse {} FCI: {}", environment, err);
                    continue;
                }
            };

            let mut candidates = candidates_from(&entries);
            if candidates.is_empty() {
                if let Some(sfi) = tlv::find(&entries, "88").and_then(|e| e.raw_value.first()) {
                    candidates = self.read_directory(*sfi)?;
                }
            }

            if candidates.is_empty() {
                warn!("{} lists no applications", environment);
                continue;
            }

            sort_candidates(&mut candidates);
            for candidate in candidates.iter() {
                info!(
                    "Found application {} ({}), priority {}",
                    hex::encode_upper(&candidate.aid),
                    candidate.label,
                    candidate.priority
                );
            }
            self.candidates = candidates;

            return Ok(PhaseOutcome::Completed);
        }

        Err(PhaseError::Abort(
            "no payment system environment with applications".to_string(),
        ))
    }

    fn read_directory(&mut self, sfi: u8) -> Result<Vec<ApplicationCandidate>, TransportError> {
        debug!("Reading payment system directory from SFI {}", sfi);
        let mut candidates = Vec::new();

        for record in 1..=MAX_DIRECTORY_RECORDS {
            let read = ReadInstruction::new(sfi, record);
            let response = self.exchange(Phase::Ppse, &commands::read_record(&read))?;
            if !response.is_success() {
                break;
            }

            self.session
                .record_snapshot(&read, RecordSource::Directory, response.data.clone());
            match tlv::decode(&response.data) {
                Ok(entries) => candidates.extend(candidates_from(&entries)),
                Err(err) => warn!("Could not parse directory record {}: {}", record, err),
            }
        }

        Ok(candidates)
    }

    pub(super) fn select_application(&mut self) -> PhaseResult {
        for candidate in self.candidates.clone() {
            info!(
                "Selecting application {} ({})",
                hex::encode_upper(&candidate.aid),
                candidate.label
            );

            let command = match commands::select(&candidate.aid) {
                Ok(command) => command,
                Err(err) => {
                    warn!("Skipping {}: {}", candidate.label, err);
                    continue;
                }
            };
            let response = self.exchange(Phase::AidSelection, &command)?;
            self.session.snapshots.aid_attempts.push(AidAttempt {
                aid: candidate.aid.clone(),
                status: response.status,
                response: response.data.clone(),
            });

            if response.is_success() {
                self.session
                    .merge_tlv(&self.context.tags, &response.data, self.censor, true);
                self.session.selected_application = Some(candidate);
                return Ok(PhaseOutcome::Completed);
            }

            warn!(
                "Could not select {}: {}",
                candidate.label,
                self.channel.describe(response.status)
            );
        }

        Err(PhaseError::Abort(format!(
            "none of {} applications could be selected",
            self.candidates.len()
        )))
    }
}
