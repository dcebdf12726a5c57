use emvscan::session::{ApduCounters, ApduLogEntry, PhaseReport};
use emvscan::workflow::ApplicationCandidate;
use emvscan::{CapturedKey, ExportedTag, RocaFinding, ScanReport, ScanSink};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

/// On-disk form of one scan session.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionExport {
    pub session_id: String,
    pub card_uid: Option<String>,
    pub started_at: String,
    pub application: Option<ApplicationCandidate>,
    pub tags: Vec<ExportedTag>,
    pub apdu_log: Vec<ApduLogEntry>,
    pub counters: ApduCounters,
    pub phases: Vec<PhaseReport>,
    pub keys: Vec<CapturedKey>,
    pub findings: Vec<RocaFinding>,
}

impl From<&ScanReport> for SessionExport {
    fn from(report: &ScanReport) -> Self {
        let session = &report.session;

        SessionExport {
            session_id: session.session_id.clone(),
            card_uid: session.card_uid.as_ref().map(hex::encode_upper),
            started_at: session.started_at.to_rfc3339(),
            application: session.selected_application.clone(),
            tags: session.exported_tags(),
            apdu_log: session.apdu_log.clone(),
            counters: session.counters,
            phases: session.phases.clone(),
            keys: report.keys.clone(),
            findings: report.findings.clone(),
        }
    }
}

/// Writes each finished scan to `<directory>/<session id>.yaml`.
pub struct YamlSessionSink {
    directory: PathBuf,
}

impl YamlSessionSink {
    pub fn new(directory: PathBuf) -> Result<YamlSessionSink, std::io::Error> {
        fs::create_dir_all(&directory)?;
        Ok(YamlSessionSink { directory })
    }
}

impl ScanSink for YamlSessionSink {
    fn persist(&mut self, report: &ScanReport) -> Result<(), Box<dyn Error>> {
        let export = SessionExport::from(report);
        let path = self.directory.join(format!("{}.yaml", export.session_id));

        fs::write(&path, serde_yaml::to_string(&export)?)?;
        info!("Scan session written to {}", path.display());

        Ok(())
    }
}

/// Loads every session export in a directory, oldest first. Files that do
/// not parse are skipped.
pub fn load_exports(directory: &Path) -> Result<Vec<SessionExport>, std::io::Error> {
    let mut paths: Vec<PathBuf> = fs::read_dir(directory)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().map_or(false, |ext| ext == "yaml"))
        .collect();
    paths.sort();

    let mut exports = Vec::new();
    for path in paths {
        let content = fs::read_to_string(&path)?;
        match serde_yaml::from_str::<SessionExport>(&content) {
            Ok(export) => exports.push(export),
            Err(err) => warn!("Skipping {}: {}", path.display(), err),
        }
    }

    Ok(exports)
}
