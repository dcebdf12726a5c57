mod cryptogram;
mod records;
mod selection;

use crate::afl::ReadInstruction;
use crate::keys::{self, CapturedKey};
use crate::roca::RocaFinding;
use crate::session::{RecordSource, SessionScanData};
use crate::terminal::TransactionValueSource;
use crate::tlv::TlvTag;
use crate::transport::commands::{self, CommandError};
use crate::transport::{ApduInterface, ApduResponse, CardChannel, TransportError};
use crate::{ConfigError, ScanContext};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Ppse,
    AidSelection,
    Gpo,
    AflRecordRead,
    ExtendedRecordScan,
    GenerateAc,
    GetDataPrimitives,
    TransactionLogs,
    Finalize,
    Aborted,
}

impl Phase {
    pub fn next(self) -> Phase {
        match self {
            Phase::Ppse => Phase::AidSelection,
            Phase::AidSelection => Phase::Gpo,
            Phase::Gpo => Phase::AflRecordRead,
            Phase::AflRecordRead => Phase::ExtendedRecordScan,
            Phase::ExtendedRecordScan => Phase::GenerateAc,
            Phase::GenerateAc => Phase::GetDataPrimitives,
            Phase::GetDataPrimitives => Phase::TransactionLogs,
            Phase::TransactionLogs => Phase::Finalize,
            Phase::Finalize => Phase::Finalize,
            Phase::Aborted => Phase::Aborted,
        }
    }

    /// Phases whose failure ends the scan without a session.
    pub fn is_critical(self) -> bool {
        matches!(self, Phase::Ppse | Phase::AidSelection)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseOutcome {
    Completed,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationCandidate {
    #[serde(with = "crate::hex_bytes")]
    pub aid: Vec<u8>,
    pub label: String,
    pub preferred_name: Option<String>,
    pub priority: u8,
}

/// Cancellation flag shared with whoever drives the scan. Checked between phases.
#[derive(Debug, Clone, Default)]
pub struct ScanAbort(Arc<AtomicBool>);

impl ScanAbort {
    pub fn new() -> ScanAbort {
        ScanAbort::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("card connection failed: {0}")]
    Transport(#[from] TransportError),

    #[error("scan aborted in {phase}: {reason}")]
    Aborted { phase: Phase, reason: String },

    #[error("scan cancelled before {phase}")]
    Cancelled {
        phase: Phase,
        session: Box<SessionScanData>,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug)]
pub struct ScanReport {
    pub session: SessionScanData,
    pub keys: Vec<CapturedKey>,
    pub findings: Vec<RocaFinding>,
}

/// Persistence collaborator receiving the finished scan.
pub trait ScanSink {
    fn persist(&mut self, report: &ScanReport) -> Result<(), Box<dyn Error>>;
}

enum PhaseError {
    Abort(String),
    Transport(TransportError),
    Command(CommandError),
}

impl From<TransportError> for PhaseError {
    fn from(err: TransportError) -> Self {
        PhaseError::Transport(err)
    }
}

impl From<CommandError> for PhaseError {
    fn from(err: CommandError) -> Self {
        PhaseError::Command(err)
    }
}

type PhaseResult = Result<PhaseOutcome, PhaseError>;

/// One card session, driven phase by phase over a single channel.
pub struct TransactionWorkflow<'a> {
    context: &'a ScanContext,
    channel: CardChannel<'a>,
    abort: ScanAbort,
    sink: Option<&'a mut dyn ScanSink>,
    values: TransactionValueSource,
    session: SessionScanData,
    censor: bool,
    candidates: Vec<ApplicationCandidate>,
    afl: Option<Vec<u8>>,
    read_records: HashSet<(u8, u8)>,
}

impl<'a> TransactionWorkflow<'a> {
    pub fn new(
        context: &'a ScanContext,
        interface: &'a mut dyn ApduInterface,
        abort: ScanAbort,
    ) -> Result<TransactionWorkflow<'a>, ScanError> {
        let censor = context.settings.censor_sensitive_fields;

        Ok(TransactionWorkflow {
            context,
            channel: CardChannel::new(interface, &context.status_words, censor),
            abort,
            sink: None,
            values: TransactionValueSource::from_settings(&context.settings)?,
            session: SessionScanData::new(None),
            censor,
            candidates: Vec::new(),
            afl: None,
            read_records: HashSet::new(),
        })
    }

    pub fn with_sink(mut self, sink: &'a mut dyn ScanSink) -> TransactionWorkflow<'a> {
        self.sink = Some(sink);
        self
    }

    pub fn run(mut self) -> Result<ScanReport, ScanError> {
        self.session.card_uid = self.channel.connect()?;
        info!(
            "Scan session {} started, card UID {:02X?}",
            self.session.session_id, self.session.card_uid
        );

        let mut phase = Phase::Ppse;
        while phase != Phase::Finalize {
            if self.abort.is_aborted() {
                warn!("Scan cancelled before {}", phase);
                self.channel.close();
                return Err(ScanError::Cancelled {
                    phase,
                    session: Box::new(self.session),
                });
            }

            debug!("Entering phase {}", phase);

            match self.run_phase(phase) {
                Ok(outcome) => {
                    match &outcome {
                        PhaseOutcome::Completed => info!("{} completed", phase),
                        PhaseOutcome::Skipped(reason) => info!("{} skipped: {}", phase, reason),
                        PhaseOutcome::Failed(reason) => warn!("{} failed: {}", phase, reason),
                    }
                    self.session.record_phase(phase, outcome);
                    phase = phase.next();
                }
                Err(PhaseError::Abort(reason)) => return Err(self.abort_scan(phase, reason)),
                Err(PhaseError::Transport(err)) if phase.is_critical() => {
                    return Err(self.abort_scan(phase, err.to_string()))
                }
                Err(PhaseError::Transport(err)) => {
                    error!("Transport failure in {}: {}", phase, err);
                    self.session
                        .record_phase(phase, PhaseOutcome::Failed(err.to_string()));
                    phase = Phase::Finalize;
                }
                Err(PhaseError::Command(err)) if phase.is_critical() => {
                    return Err(self.abort_scan(phase, err.to_string()))
                }
                Err(PhaseError::Command(err)) => {
                    warn!("{} failed: {}", phase, err);
                    self.session
                        .record_phase(phase, PhaseOutcome::Failed(err.to_string()));
                    phase = phase.next();
                }
            }
        }

        Ok(self.finalize())
    }

    fn run_phase(&mut self, phase: Phase) -> PhaseResult {
        match phase {
            Phase::Ppse => self.select_payment_environment(),
            Phase::AidSelection => self.select_application(),
            Phase::Gpo => self.get_processing_options(),
            Phase::AflRecordRead => self.read_application_data(),
            Phase::ExtendedRecordScan => self.extended_record_scan(),
            Phase::GenerateAc => self.generate_application_cryptogram(),
            Phase::GetDataPrimitives => self.get_data_primitives(),
            Phase::TransactionLogs => self.read_transaction_logs(),
            Phase::Finalize | Phase::Aborted => Ok(PhaseOutcome::Completed),
        }
    }

    fn abort_scan(&mut self, phase: Phase, reason: String) -> ScanError {
        error!("Aborting scan in {}: {}", phase, reason);
        self.session
            .record_phase(phase, PhaseOutcome::Failed(reason.clone()));
        self.session
            .record_phase(Phase::Aborted, PhaseOutcome::Completed);
        self.channel.close();

        ScanError::Aborted { phase, reason }
    }

    fn finalize(mut self) -> ScanReport {
        self.channel.close();

        let keys = keys::capture_keys(&self.session, &self.context.ca_keys);
        let findings: Vec<RocaFinding> = keys
            .iter()
            .map(|key| self.context.roca.analyze_key(key))
            .collect();

        for finding in findings.iter().filter(|f| f.is_vulnerable) {
            warn!(
                "{} key matches ROCA fingerprint ({:?} confidence, factored: {})",
                finding.tag_source,
                finding.confidence,
                finding.factorization.is_some()
            );
        }

        self.session
            .record_phase(Phase::Finalize, PhaseOutcome::Completed);
        info!(
            "Scan session {} finished: {} tags, {}/{} APDUs succeeded",
            self.session.session_id,
            self.session.tags.len(),
            self.session.counters.succeeded,
            self.session.counters.sent
        );

        let report = ScanReport {
            session: self.session,
            keys,
            findings,
        };

        if let Some(sink) = self.sink {
            if let Err(err) = sink.persist(&report) {
                warn!("Could not persist scan session {}: {}", report.session.session_id, err);
            }
        }

        report
    }

    fn exchange(&mut self, phase: Phase, apdu: &[u8]) -> Result<ApduResponse, TransportError> {
        self.channel.exchange(&mut self.session, phase, apdu)
    }

    /// READ RECORD with the response merged into the session. Returns the
    /// response and the tags it contributed.
    fn read_record(
        &mut self,
        phase: Phase,
        read: &ReadInstruction,
        source: RecordSource,
        verbose: bool,
    ) -> Result<(ApduResponse, Vec<TlvTag>), TransportError> {
        let response = self.exchange(phase, &commands::read_record(read))?;
        self.read_records.insert((read.sfi, read.record));

        if !response.is_success() {
            return Ok((response, Vec::new()));
        }

        self.session
            .record_snapshot(read, source, response.data.clone());
        let stored = self.session.merge_tlv(
            &self.context.tags,
            &response.data,
            self.censor,
            verbose,
        );

        Ok((response, stored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RecordSource;
    use crate::keys::{CaKeyStore, CertificateAuthority, RsaPublicKey};
    use crate::roca::Confidence;
    use crate::testing::{init_logging, sign_certificate, DummySmartCardConnection, SETTINGS_FILE};
    use crate::tlv;
    use crate::{parse_yaml, Settings};
    use num_bigint_dig::BigUint;
    use openssl::rsa::Rsa;
    use std::collections::HashMap;

    fn context() -> ScanContext {
        let mut settings: Settings =
            parse_yaml(SETTINGS_FILE, include_str!("../../config/settings.yaml")).unwrap();
        settings.terminal.use_random = false;
        settings.roca.factorization_budget_ms = 100;
        ScanContext::from_settings(settings).unwrap()
    }

    fn read_records_sent(interface: &DummySmartCardConnection) -> Vec<String> {
        interface
            .sent_hex()
            .into_iter()
            .filter(|apdu| apdu.starts_with("00B2"))
            .collect()
    }

    struct RecordingSink {
        sessions: Vec<String>,
        fail: bool,
    }

    impl ScanSink for RecordingSink {
        fn persist(&mut self, report: &ScanReport) -> Result<(), Box<dyn Error>> {
            if self.fail {
                return Err("disk full".into());
            }
            self.sessions.push(report.session.session_id.clone());
            Ok(())
        }
    }

    #[test]
    fn test_nominal_scan() -> Result<(), ScanError> {
        init_logging();
        let context = context();
        let mut interface = DummySmartCardConnection::new("test_data/nominal.yaml");
        let mut sink = RecordingSink {
            sessions: Vec::new(),
            fail: false,
        };

        let report = TransactionWorkflow::new(&context, &mut interface, ScanAbort::new())?
            .with_sink(&mut sink)
            .run()?;
        let session = &report.session;

        assert_eq!(sink.sessions, vec![session.session_id.clone()]);
        assert_eq!(session.card_uid, Some(vec![0x04, 0x5A, 0x3B, 0x12]));

        let selected = session.selected_application.as_ref().unwrap();
        assert_eq!(selected.aid, hex::decode("A0000000031010").unwrap());
        assert_eq!(selected.label, "VISA");

        // exactly the one AFL record, the extended scan has nothing left to find
        assert_eq!(read_records_sent(&interface)[0], "00B2011400");
        assert_eq!(
            session.phase_outcome(Phase::ExtendedRecordScan),
            Some(&PhaseOutcome::Skipped("all target tags present".to_string()))
        );
        assert!(session
            .apdu_log
            .iter()
            .all(|entry| entry.phase != Phase::ExtendedRecordScan));

        assert_eq!(session.snapshots.records.len(), 1);
        assert_eq!(session.snapshots.records[0].source, RecordSource::Afl);
        assert!(session.tags.contains("57"));
        assert_eq!(session.value("82"), Some(&[0x19, 0x80][..]));
        assert_eq!(session.value("94"), Some(&[0x10, 0x01, 0x01, 0x01][..]));

        // GET CHALLENGE feeds the CDOL1, Format 1 cryptogram is split
        assert!(interface.sent_hex().contains(&"0084000000".to_string()));
        assert_eq!(session.phase_outcome(Phase::GenerateAc), Some(&PhaseOutcome::Completed));
        assert_eq!(session.value("9F27"), Some(&[0x80][..]));
        assert_eq!(session.value("9F26"), Some(&hex::decode("1122334455667788").unwrap()[..]));
        assert_eq!(session.value("9F10"), Some(&hex::decode("06010A03A00000").unwrap()[..]));

        assert_eq!(session.value("9F17"), Some(&[0x03][..]));
        assert_eq!(session.value("9F36"), Some(&[0x00, 0x2A][..]));
        assert_eq!(session.snapshots.get_data.len(), 9);

        // two log records, then record not found
        assert_eq!(session.snapshots.log_records.len(), 2);
        assert!(session.snapshots.log_records.iter().all(|r| r.sfi == 11));
        assert!(!session.tags.contains("9A"));

        let phases: Vec<Phase> = session.phases.iter().map(|p| p.phase).collect();
        assert_eq!(
            phases,
            vec![
                Phase::Ppse,
                Phase::AidSelection,
                Phase::Gpo,
                Phase::AflRecordRead,
                Phase::ExtendedRecordScan,
                Phase::GenerateAc,
                Phase::GetDataPrimitives,
                Phase::TransactionLogs,
                Phase::Finalize
            ]
        );

        assert_eq!(session.counters.sent as usize, session.apdu_log.len());
        assert!(interface.closed);

        Ok(())
    }

    // 70 record template followed by 9000
    fn record_response(entries: &[(&str, &[u8])]) -> String {
        let body: Vec<u8> = entries
            .iter()
            .flat_map(|(tag, value)| tlv::encode_entry(&TlvTag::parse(tag).unwrap(), value))
            .collect();
        let mut response = tlv::encode_entry(&TlvTag::parse("70").unwrap(), &body);
        response.extend_from_slice(&[0x90, 0x00]);
        hex::encode_upper(response)
    }

    #[test]
    fn test_public_keys_recovered_from_records() -> Result<(), Box<dyn std::error::Error>> {
        init_logging();

        let ca = Rsa::generate(1024)?;
        let issuer = Rsa::generate(1024)?;
        let icc = Rsa::generate(1024)?;
        let issuer_modulus = issuer.n().to_vec();
        let icc_modulus = icc.n().to_vec();

        let issuer_certificate = sign_certificate(
            &ca,
            0x02,
            &[0x47, 0x61, 0x73, 0xFF, 0x12, 0x30, 0x00, 0x00, 0x01],
            128,
            &issuer_modulus[..92],
        )?;
        let icc_certificate = sign_certificate(
            &issuer,
            0x04,
            &[
                0x47, 0x61, 0x73, 0x90, 0x01, 0x01, 0x00, 0x10, 0xFF, 0xFF, 0x12, 0x30, 0x00,
                0x00, 0x02,
            ],
            128,
            &icc_modulus[..86],
        )?;

        let mut context = context();
        let mut certificates = HashMap::new();
        certificates.insert(
            "92".to_string(),
            RsaPublicKey::new(&ca.n().to_vec(), &ca.e().to_vec()),
        );
        let mut authorities = HashMap::new();
        authorities.insert(
            "A000000003".to_string(),
            CertificateAuthority {
                issuer: "Test CA".to_string(),
                certificates,
            },
        );
        context.ca_keys = CaKeyStore::new(authorities);

        let cdol1 = hex::decode("9F02069F03069F1A025F2A029F36029F4C08")?;
        let issuer_exponent = issuer.e().to_vec();
        let icc_exponent = icc.e().to_vec();
        let record = record_response(&[
            ("5A", &[0x47u8, 0x61, 0x73, 0x90, 0x01, 0x01, 0x00, 0x10][..]),
            ("8C", &cdol1[..]),
            ("8D", &[0x8Au8, 0x02, 0x9F, 0x37, 0x04][..]),
            ("8E", &[0x00u8; 8][..]),
            ("8F", &[0x92u8][..]),
            ("90", &issuer_certificate[..]),
            ("92", &issuer_modulus[92..]),
            ("9F32", &issuer_exponent[..]),
            ("9F46", &icc_certificate[..]),
            ("9F47", &icc_exponent[..]),
            ("9F48", &icc_modulus[86..]),
            ("93", &[0x6Au8, 0x03, 0xBC][..]),
        ]);
        let mut interface =
            DummySmartCardConnection::new("test_data/nominal.yaml").respond("00B2011400", &record);

        let report = TransactionWorkflow::new(&context, &mut interface, ScanAbort::new())?.run()?;

        assert_eq!(
            report.session.phase_outcome(Phase::ExtendedRecordScan),
            Some(&PhaseOutcome::Skipped("all target tags present".to_string()))
        );

        assert_eq!(report.keys.len(), 2);
        assert_eq!(report.keys[0].tag_source.as_str(), "90");
        assert!(report.keys[0].recovered);
        assert_eq!(report.keys[0].modulus, BigUint::from_bytes_be(&issuer_modulus));
        assert_eq!(report.keys[0].key_size_bits, 1024);
        assert_eq!(report.keys[1].tag_source.as_str(), "9F46");
        assert!(report.keys[1].recovered);
        assert_eq!(report.keys[1].modulus, BigUint::from_bytes_be(&icc_modulus));

        assert_eq!(report.findings.len(), 2);
        for finding in report.findings.iter() {
            assert!(!finding.is_vulnerable);
            assert_eq!(finding.confidence, Confidence::None);
        }

        Ok(())
    }

    #[test]
    fn test_malformed_afl_uses_fallback_plan() -> Result<(), ScanError> {
        init_logging();
        let context = context();
        let mut interface = DummySmartCardConnection::new("test_data/fallback.yaml");

        let report = TransactionWorkflow::new(&context, &mut interface, ScanAbort::new())?.run()?;
        let session = &report.session;

        let reads = read_records_sent(&interface);
        assert_eq!(
            reads[..9],
            [
                "00B2010C00",
                "00B2020C00",
                "00B2030C00",
                "00B2011400",
                "00B2021400",
                "00B2031400",
                "00B2011C00",
                "00B2021C00",
                "00B2031C00"
            ]
        );
        assert_eq!(session.snapshots.records[0].source, RecordSource::Fallback);
        assert!(session.tags.contains("5A"));

        // extended scan skips what was read and stops once every target is found
        assert_eq!(reads[9..], ["00B2040C00", "00B2050C00"]);
        assert_eq!(session.phase_outcome(Phase::ExtendedRecordScan), Some(&PhaseOutcome::Completed));
        assert!(session.tags.contains("9F47"));

        Ok(())
    }

    #[test]
    fn test_generate_ac_unsupported_is_not_fatal() -> Result<(), ScanError> {
        init_logging();
        let context = context();
        let mut interface = DummySmartCardConnection::new("test_data/generate_ac_unsupported.yaml");

        let report = TransactionWorkflow::new(&context, &mut interface, ScanAbort::new())?.run()?;
        let session = &report.session;

        assert!(matches!(
            session.phase_outcome(Phase::GenerateAc),
            Some(PhaseOutcome::Failed(_))
        ));
        assert_eq!(
            session.phase_outcome(Phase::GetDataPrimitives),
            Some(&PhaseOutcome::Completed)
        );
        assert_eq!(session.value("9F17"), Some(&[0x03][..]));

        let sent = interface.sent_hex();
        let generate_ac = sent.iter().position(|apdu| apdu.starts_with("80AE")).unwrap();
        assert!(sent[generate_ac + 1..].iter().any(|apdu| apdu == "80CA9F1700"));

        // a log entry without a log format does not locate any log
        assert_eq!(session.value("9F4D"), Some(&[0x0B, 0x0A][..]));
        assert_eq!(
            session.phase_outcome(Phase::TransactionLogs),
            Some(&PhaseOutcome::Skipped("no log format".to_string()))
        );
        assert!(!sent.iter().any(|apdu| apdu == "00B2015C00"));

        Ok(())
    }

    #[test]
    fn test_oversized_pdol_fails_gpo_only() -> Result<(), ScanError> {
        init_logging();
        let context = context();
        let mut interface = DummySmartCardConnection::new("test_data/oversized_pdol.yaml");

        let report = TransactionWorkflow::new(&context, &mut interface, ScanAbort::new())?.run()?;
        let session = &report.session;

        // DF60 asks for 255 bytes, the 83 template would need 258
        assert_eq!(
            session.phase_outcome(Phase::Gpo),
            Some(&PhaseOutcome::Failed(
                "command data of 258 bytes does not fit a short APDU".to_string()
            ))
        );
        let sent = interface.sent_hex();
        assert!(!sent.iter().any(|apdu| apdu.starts_with("80A8")));

        assert_eq!(read_records_sent(&interface)[..3], ["00B2010C00", "00B2020C00", "00B2030C00"]);
        assert_eq!(session.phases.last().map(|p| p.phase), Some(Phase::Finalize));

        Ok(())
    }

    #[test]
    fn test_ppse_failure_aborts() {
        init_logging();
        let context = context();
        let mut interface = DummySmartCardConnection::new("test_data/empty.yaml");

        let result = TransactionWorkflow::new(&context, &mut interface, ScanAbort::new())
            .and_then(|workflow| workflow.run());

        match result {
            Err(ScanError::Aborted { phase, .. }) => assert_eq!(phase, Phase::Ppse),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(
            interface.sent_hex(),
            vec![
                "00A404000E325041592E5359532E444446303100",
                "00A404000E315041592E5359532E444446303100"
            ]
        );
        assert!(interface.closed);
    }

    #[test]
    fn test_every_aid_failing_aborts() {
        init_logging();
        let context = context();
        let mut interface = DummySmartCardConnection::new("test_data/ppse_only.yaml");

        let result = TransactionWorkflow::new(&context, &mut interface, ScanAbort::new())
            .and_then(|workflow| workflow.run());

        match result {
            Err(ScanError::Aborted { phase, .. }) => assert_eq!(phase, Phase::AidSelection),
            other => panic!("unexpected result {:?}", other),
        }

        // priority 1 before priority 2, unprioritized last
        assert_eq!(
            interface.sent_hex()[1..],
            [
                "00A4040007A000000003101000",
                "00A4040007A000000004101000",
                "00A4040007A000000025010400"
            ]
        );
    }

    #[test]
    fn test_pse_directory_records() -> Result<(), ScanError> {
        init_logging();
        let context = context();
        let mut interface = DummySmartCardConnection::new("test_data/pse_directory.yaml");

        let report = TransactionWorkflow::new(&context, &mut interface, ScanAbort::new())?.run()?;
        let session = &report.session;

        let selected = session.selected_application.as_ref().unwrap();
        assert_eq!(selected.aid, hex::decode("A0000000041010").unwrap());
        assert_eq!(selected.label, "MASTERCARD");
        assert_eq!(selected.preferred_name.as_deref(), Some("Debit Mastercard"));

        assert_eq!(session.snapshots.records[0].source, RecordSource::Directory);
        assert!(matches!(
            session.phase_outcome(Phase::Gpo),
            Some(PhaseOutcome::Failed(_))
        ));
        assert_eq!(session.phases.last().map(|p| p.phase), Some(Phase::Finalize));

        Ok(())
    }

    #[test]
    fn test_card_removed_mid_scan_finalizes() -> Result<(), ScanError> {
        init_logging();
        let context = context();
        let mut interface = DummySmartCardConnection::new("test_data/card_removed.yaml");
        let mut sink = RecordingSink {
            sessions: Vec::new(),
            fail: true,
        };

        let report = TransactionWorkflow::new(&context, &mut interface, ScanAbort::new())?
            .with_sink(&mut sink)
            .run()?;
        let session = &report.session;

        let phases: Vec<Phase> = session.phases.iter().map(|p| p.phase).collect();
        assert_eq!(
            phases,
            vec![
                Phase::Ppse,
                Phase::AidSelection,
                Phase::Gpo,
                Phase::AflRecordRead,
                Phase::Finalize
            ]
        );
        assert!(matches!(
            session.phase_outcome(Phase::AflRecordRead),
            Some(PhaseOutcome::Failed(_))
        ));
        assert!(sink.sessions.is_empty());

        Ok(())
    }

    #[test]
    fn test_cancellation_between_phases() {
        init_logging();
        let context = context();
        let abort = ScanAbort::new();
        let mut interface =
            DummySmartCardConnection::new("test_data/nominal.yaml").abort_after(1, abort.clone());

        let result = TransactionWorkflow::new(&context, &mut interface, abort)
            .and_then(|workflow| workflow.run());

        match result {
            Err(ScanError::Cancelled { phase, session }) => {
                assert_eq!(phase, Phase::AidSelection);
                assert_eq!(session.phase_outcome(Phase::Ppse), Some(&PhaseOutcome::Completed));
                assert_eq!(session.counters.sent, 1);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(interface.closed);
    }

    #[test]
    fn test_phase_order() {
        let mut phase = Phase::Ppse;
        let mut visited = vec![phase];
        while phase != Phase::Finalize {
            phase = phase.next();
            visited.push(phase);
        }
        assert_eq!(visited.len(), 9);
        assert_eq!(Phase::Aborted.next(), Phase::Aborted);
        assert!(Phase::AidSelection.is_critical());
        assert!(!Phase::Gpo.is_critical());
    }
}
