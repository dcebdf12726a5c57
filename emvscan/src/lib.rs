use log::debug;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::time::Duration;
use thiserror::Error;

macro_rules! get_bit {
    ($byte:expr, $bit:expr) => {
        if $byte & (1 << $bit) != 0 {
            true
        } else {
            false
        }
    };
}

macro_rules! set_bit {
    ($byte:expr, $bit:expr, $bit_value:expr) => {
        if $bit_value == true {
            $byte |= 1 << $bit;
        } else {
            $byte &= !(1 << $bit);
        }
    };
}

// Reads the configured file, falling back to the copy compiled into the crate.
macro_rules! serialize_yaml {
    ($file:expr, $static_resource:expr) => {
        crate::parse_yaml($file, include_str!($static_resource))
    };
}

pub mod afl;
pub mod batch;
pub mod bcdutil;
pub mod dol;
pub mod keys;
pub mod roca;
pub mod session;
pub mod status;
pub mod tags;
pub mod terminal;
pub mod tlv;
pub mod transport;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use keys::{CaKeyStore, CapturedKey};
pub use roca::{Confidence, RocaAnalyzer, RocaFinding};
pub use session::{ExportedTag, SessionScanData};
pub use status::{StatusWord, StatusWordCatalog};
pub use tags::{EmvTag, TagDictionary};
pub use terminal::{Terminal, TransactionValueSource};
pub use tlv::{TlvEntry, TlvTag};
pub use transport::{ApduInterface, TransportError};
pub use workflow::{ScanAbort, ScanError, ScanReport, ScanSink, TransactionWorkflow};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not parse {file}: {source}")]
    Parse {
        file: String,
        source: serde_yaml::Error,
    },

    #[error("invalid tag name {0:?} in default tags")]
    InvalidTag(String),

    #[error("invalid value for default tag {tag}: {source}")]
    InvalidTagValue {
        tag: String,
        source: hex::FromHexError,
    },

    #[error("could not encode terminal value: {0}")]
    Bcd(#[from] bcdutil::BcdError),
}

pub fn parse_yaml<T: DeserializeOwned>(file: &str, bundled: &str) -> Result<T, ConfigError> {
    match fs::read_to_string(file) {
        Ok(content) => serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            file: file.to_string(),
            source,
        }),
        Err(err) => {
            debug!("Using bundled configuration for {} ({})", file, err);
            serde_yaml::from_str(bundled).map_err(|source| ConfigError::Parse {
                file: format!("{} (bundled)", file),
                source,
            })
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConfigurationFiles {
    pub emv_tags: String,
    pub scheme_ca_public_keys: String,
    pub constants: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RocaSettings {
    pub factorization_budget_ms: u64,
    pub batch_workers: usize,
    pub max_structured_exponent: u32,
    pub max_structured_multiplier: u32,
}

impl Default for RocaSettings {
    fn default() -> Self {
        RocaSettings {
            factorization_budget_ms: 10_000,
            batch_workers: 0,
            max_structured_exponent: 128,
            max_structured_multiplier: 64,
        }
    }
}

impl RocaSettings {
    pub fn factorization_budget(&self) -> Duration {
        Duration::from_millis(self.factorization_budget_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Settings {
    pub censor_sensitive_fields: bool,
    pub configuration_files: ConfigurationFiles,
    pub terminal: Terminal,
    #[serde(default)]
    pub roca: RocaSettings,
    #[serde(default)]
    pub default_tags: HashMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Constants {
    pub numeric_country_codes: HashMap<String, String>,
    pub numeric_currency_codes: HashMap<String, String>,
    pub apdu_status_codes: HashMap<String, String>,
}

/// Load-once tables and settings shared by every scan of a process.
pub struct ScanContext {
    pub settings: Settings,
    pub tags: TagDictionary,
    pub status_words: StatusWordCatalog,
    pub ca_keys: CaKeyStore,
    pub roca: RocaAnalyzer,
}

impl ScanContext {
    pub fn new(settings_file: &str) -> Result<ScanContext, ConfigError> {
        let settings: Settings = serialize_yaml!(settings_file, "../config/settings.yaml")?;
        ScanContext::from_settings(settings)
    }

    pub fn from_settings(settings: Settings) -> Result<ScanContext, ConfigError> {
        let emv_tags: Vec<EmvTag> = serialize_yaml!(
            &settings.configuration_files.emv_tags,
            "../config/emv_tags.yaml"
        )?;
        let constants: Constants = serialize_yaml!(
            &settings.configuration_files.constants,
            "../config/constants.yaml"
        )?;
        let ca_keys: CaKeyStore = serialize_yaml!(
            &settings.configuration_files.scheme_ca_public_keys,
            "../config/scheme_ca_public_keys.yaml"
        )?;

        debug!(
            "Loaded {} tag definitions, {} status words, {} CA keys",
            emv_tags.len(),
            constants.apdu_status_codes.len(),
            ca_keys.len()
        );

        Ok(ScanContext {
            tags: TagDictionary::new(
                emv_tags,
                constants.numeric_country_codes,
                constants.numeric_currency_codes,
            ),
            status_words: StatusWordCatalog::new(constants.apdu_status_codes),
            ca_keys,
            roca: RocaAnalyzer::new(&settings.roca),
            settings,
        })
    }
}

// PCI SSC PAN truncation rules ref. https://d30000001huxdea4.my.salesforce-sites.com/faq/articles/Frequently_Asked_Question/What-are-acceptable-formats-for-truncation-of-primary-account-numbers
pub fn get_truncated_pan(pan: &str) -> String {
    let uncensored_bin_prefix_length = if pan.len() > 15 { 8 } else { 6 };

    pan.chars()
        .enumerate()
        .map(|(i, c)| {
            if i >= uncensored_bin_prefix_length && i + 4 < pan.len() {
                '*'
            } else {
                c
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track2 {
    pub primary_account_number: String,
    pub expiry_year: String,
    pub expiry_month: String,
    pub service_code: String,
    pub discretionary_data: String,
}

impl Track2 {
    pub fn parse(track_data: &str) -> Option<Track2> {
        // Supports human readable and ICC formats
        // human readable: ;4321432143214321=2612101123456789123?
        // ICC: 4321432143214321D2612101123456789123F
        let re = Regex::new(r"^;?(\d+)(=|D)(\d{2})(\d{2})(\d{3})(\d+)F?\??$").ok()?;
        let cap = re.captures(track_data)?;

        Some(Track2 {
            primary_account_number: cap.get(1)?.as_str().to_string(),
            expiry_year: cap.get(3)?.as_str().to_string(),
            expiry_month: cap.get(4)?.as_str().to_string(),
            service_code: cap.get(5)?.as_str().to_string(),
            discretionary_data: cap.get(6)?.as_str().to_string(),
        })
    }

    pub fn censor(&mut self) {
        self.primary_account_number = get_truncated_pan(&self.primary_account_number);
        self.discretionary_data = self.discretionary_data.replace(|_c: char| true, "*");
    }
}

impl fmt::Display for Track2 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            ";{}={}{}{}{}?",
            self.primary_account_number,
            self.expiry_year,
            self.expiry_month,
            self.service_code,
            self.discretionary_data
        )
    }
}

#[repr(u8)]
#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum CryptogramType {
    // bits 6-7 are relevant
    ApplicationAuthenticationCryptogram = 0b0000_0000, // AAC, transaction declined
    AuthorisationRequestCryptogram = 0b1000_0000,      // ARQC, online authorisation requested
    TransactionCertificate = 0b0100_0000,              // TC, transaction approved
}

impl From<CryptogramType> for u8 {
    fn from(orig: CryptogramType) -> Self {
        orig as u8
    }
}

impl TryFrom<u8> for CryptogramType {
    type Error = &'static str;

    fn try_from(orig: u8) -> Result<Self, Self::Error> {
        match orig >> 6 << 6 {
            0b0000_0000 => Ok(CryptogramType::ApplicationAuthenticationCryptogram),
            0b1000_0000 => Ok(CryptogramType::AuthorisationRequestCryptogram),
            0b0100_0000 => Ok(CryptogramType::TransactionCertificate),
            _ => Err("Unknown code!"),
        }
    }
}

// EMV Book 3, C1 Application Interchange Profile
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct ApplicationInterchangeProfile {
    //byte 1
    //bit 8 rfu
    pub sda_supported: bool,
    pub dda_supported: bool,
    pub cardholder_verification_supported: bool,
    pub terminal_risk_management_required: bool,
    pub issuer_authentication_supported: bool,
    //bit 2 rfu
    pub cda_supported: bool,
    //byte 2 rfu for contact, kernel specific for contactless
}

impl TryFrom<&[u8]> for ApplicationInterchangeProfile {
    type Error = &'static str;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        if data.len() != 2 {
            return Err("Invalid data length");
        }

        let b1: u8 = data[0];

        Ok(ApplicationInterchangeProfile {
            sda_supported: get_bit!(b1, 6),
            dda_supported: get_bit!(b1, 5),
            cardholder_verification_supported: get_bit!(b1, 4),
            terminal_risk_management_required: get_bit!(b1, 3),
            issuer_authentication_supported: get_bit!(b1, 2),
            cda_supported: get_bit!(b1, 0),
        })
    }
}

impl fmt::Display for ApplicationInterchangeProfile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let capabilities: Vec<&str> = [
            (self.sda_supported, "SDA"),
            (self.dda_supported, "DDA"),
            (self.cardholder_verification_supported, "cardholder verification"),
            (self.terminal_risk_management_required, "terminal risk management"),
            (self.issuer_authentication_supported, "issuer authentication"),
            (self.cda_supported, "CDA"),
        ]
        .iter()
        .filter(|(enabled, _)| *enabled)
        .map(|(_, name)| *name)
        .collect();

        if capabilities.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", capabilities.join(", "))
        }
    }
}

/// Serde adapter writing byte vectors as uppercase hex strings.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(
        value: &T,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode_upper(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = String::deserialize(deserializer)?;
        hex::decode(value.replace(' ', "")).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter writing big integers as uppercase hex strings.
pub mod hex_biguint {
    use num_bigint_dig::BigUint;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_str_radix(16).to_uppercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let value = String::deserialize(deserializer)?;
        BigUint::parse_bytes(value.as_bytes(), 16)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid hex integer {:?}", value)))
    }
}
