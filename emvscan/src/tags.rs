use crate::bcdutil;
use crate::dol;
use crate::tlv::TlvEntry;
use crate::{get_truncated_pan, ApplicationInterchangeProfile, CryptogramType, Track2};
use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldSensitivity {
    Public,
    SensitiveAuthenticationData,
    Sensitive,
    Track2,
    PrimaryAccountNumber,
    PersonallyIdentifiableInformation,
}

#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldFormat {
    CompressedNumeric,
    Numeric,
    Binary,
    Alphanumeric,
    AlphanumericSpecial,
    ApplicationInterchangeProfile,
    CryptogramInformationData,
    KeyCertificate,
    NumericCountryCode,
    NumericCurrencyCode,
    DataObjectList,
    Track2,
    Date,
    Time,
}

#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldSource {
    Icc,
    Terminal,
    Issuer,
    IssuerOrTerminal,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EmvTag {
    pub tag: String,
    pub name: String,
    pub sensitivity: Option<FieldSensitivity>,
    pub format: Option<FieldFormat>,
    pub source: Option<FieldSource>,
}

/// Static tag metadata plus the numeric code tables used by the decoders.
///
/// Loaded once and shared read-only between scans.
pub struct TagDictionary {
    tags: HashMap<String, EmvTag>,
    country_codes: HashMap<String, String>,
    currency_codes: HashMap<String, String>,
}

impl TagDictionary {
    pub fn new(
        tags: Vec<EmvTag>,
        country_codes: HashMap<String, String>,
        currency_codes: HashMap<String, String>,
    ) -> TagDictionary {
        TagDictionary {
            tags: tags
                .into_iter()
                .map(|tag| (tag.tag.to_uppercase(), tag))
                .collect(),
            country_codes,
            currency_codes,
        }
    }

    pub fn get(&self, tag: &str) -> Option<&EmvTag> {
        self.tags.get(tag)
    }

    pub fn name(&self, tag: &str) -> &str {
        self.tags
            .get(tag)
            .map(|t| t.name.as_str())
            .unwrap_or("Unknown tag")
    }

    pub fn annotate(&self, entry: &mut TlvEntry) {
        if !entry.is_template {
            entry.decoded_value = self.decode_value(entry.tag.as_str(), &entry.raw_value);
        }
    }

    /// Human readable rendering of a value, `None` for binary or unknown data
    /// and for values that do not match their declared format.
    pub fn decode_value(&self, tag: &str, value: &[u8]) -> Option<String> {
        let format = self.tags.get(tag).and_then(|t| t.format)?;

        let decoded = match format {
            FieldFormat::Binary => None,
            FieldFormat::Alphanumeric | FieldFormat::AlphanumericSpecial => {
                match std::str::from_utf8(value) {
                    Ok(text) if text.chars().all(|c| !c.is_control()) => Some(text.to_string()),
                    _ => None,
                }
            }
            FieldFormat::CompressedNumeric => bcdutil::bcd_to_ascii(value).ok(),
            FieldFormat::Numeric => bcdutil::bcd_to_ascii(value).ok().map(|digits| {
                let trimmed = digits.trim_start_matches('0');
                if trimmed.is_empty() {
                    "0".to_string()
                } else {
                    trimmed.to_string()
                }
            }),
            FieldFormat::Date => bcd_triplet(value).map(|(yy, mm, dd)| {
                // FIXME: date format does not take into consideration pre 2000s dates
                format!("20{}-{}-{}", yy, mm, dd)
            }),
            FieldFormat::Time => bcd_triplet(value).map(|(hh, mm, ss)| format!("{}:{}:{}", hh, mm, ss)),
            FieldFormat::NumericCountryCode => lookup_code(value, &self.country_codes),
            FieldFormat::NumericCurrencyCode => lookup_code(value, &self.currency_codes),
            FieldFormat::KeyCertificate => Some(format!("{} bit key", value.len() * 8)),
            FieldFormat::DataObjectList => {
                let entries = dol::parse_dol(value);
                if entries.is_empty() {
                    None
                } else {
                    Some(dol::describe(&entries, self))
                }
            }
            FieldFormat::Track2 => Track2::parse(&hex::encode_upper(value)).map(|t| t.to_string()),
            FieldFormat::ApplicationInterchangeProfile => {
                ApplicationInterchangeProfile::try_from(value)
                    .ok()
                    .map(|aip| aip.to_string())
            }
            FieldFormat::CryptogramInformationData => value
                .first()
                .and_then(|cid| CryptogramType::try_from(*cid).ok())
                .map(|cryptogram| format!("{:?}", cryptogram)),
        };

        if decoded.is_none() && format != FieldFormat::Binary {
            trace!("Tag {} value {:02X?} does not decode as {:?}", tag, value, format);
        }

        decoded
    }

    /// Value rendering for logs, honoring the field sensitivity when censoring.
    pub fn display_value(&self, tag: &str, value: &[u8], censor: bool) -> String {
        let decoded = self.decode_value(tag, value);
        let sensitivity = self.tags.get(tag).and_then(|t| t.sensitivity);

        if !censor {
            return match decoded {
                Some(decoded) => format!("{:02X?} = {}", value, decoded),
                None => format!("{:02X?}", value),
            };
        }

        match (sensitivity, decoded) {
            (Some(FieldSensitivity::PrimaryAccountNumber), Some(pan)) => get_truncated_pan(&pan),
            (Some(FieldSensitivity::Track2), Some(track)) => match Track2::parse(&track) {
                Some(mut track2) => {
                    track2.censor();
                    track2.to_string()
                }
                None => format!("censored {} bytes", value.len()),
            },
            (Some(FieldSensitivity::PersonallyIdentifiableInformation), Some(text)) => {
                // allowing punctuation is primarily to see cardholder name which is separated by '/'
                text.replace(
                    |c: char| !(c.is_ascii_whitespace() || c.is_ascii_punctuation()),
                    "*",
                )
            }
            (Some(FieldSensitivity::Public), Some(decoded)) | (None, Some(decoded)) => {
                format!("{:02X?} = {}", value, decoded)
            }
            (Some(FieldSensitivity::Public), None) | (None, None) => format!("{:02X?}", value),
            _ => format!("censored {} bytes", value.len()),
        }
    }
}

fn bcd_triplet(value: &[u8]) -> Option<(String, String, String)> {
    if value.len() != 3 {
        return None;
    }

    let digits = bcdutil::bcd_to_ascii(value).ok()?;
    if digits.len() != 6 {
        return None;
    }

    Some((
        digits[0..2].to_string(),
        digits[2..4].to_string(),
        digits[4..6].to_string(),
    ))
}

// n3 codes travel as two BCD bytes with a leading zero nibble: 02 46 = 0246,
// looked up as 246
fn lookup_code(value: &[u8], table: &HashMap<String, String>) -> Option<String> {
    let digits = bcdutil::bcd_to_ascii(value).ok()?;
    if digits.len() != 4 {
        return None;
    }

    match table.get(&digits[1..]) {
        Some(name) => Some(format!("{} - {}", digits, name)),
        None => Some(digits),
    }
}
