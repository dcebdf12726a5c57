use crate::bcdutil;
use crate::tlv::TlvTag;
use crate::{ConfigError, Settings};
use chrono::{DateTime, Datelike, Timelike, Utc};
use log::{debug, trace};
use rand::prelude::*;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// EMV Contactless Book A, Table 5-4: Terminal Transaction Qualifier (TTQ)
#[derive(Serialize, Deserialize, Debug, Copy, Clone)]
pub struct TerminalTransactionQualifiers {
    //byte 1
    pub mag_stripe_mode_supported: bool,
    //7bit rfu
    pub emv_mode_supported: bool,
    pub emv_contact_chip_supported: bool,
    pub offline_only_reader: bool,
    pub online_pin_supported: bool,
    pub signature_supported: bool,
    pub offline_data_authentication_for_online_authorizations_supported: bool,

    //byte 2
    pub online_cryptogram_required: bool,
    pub cvm_required: bool,
    pub contact_chip_offline_pin_supported: bool,

    //byte 3
    pub issuer_update_processing_supported: bool,
    pub consumer_device_cvm_supported: bool,
}

impl From<TerminalTransactionQualifiers> for Vec<u8> {
    fn from(ttq: TerminalTransactionQualifiers) -> Self {
        let mut b1: u8 = 0b0000_0000;
        let mut b2: u8 = 0b0000_0000;
        let mut b3: u8 = 0b0000_0000;

        set_bit!(b1, 7, ttq.mag_stripe_mode_supported);
        set_bit!(b1, 5, ttq.emv_mode_supported);
        set_bit!(b1, 4, ttq.emv_contact_chip_supported);
        set_bit!(b1, 3, ttq.offline_only_reader);
        set_bit!(b1, 2, ttq.online_pin_supported);
        set_bit!(b1, 1, ttq.signature_supported);
        set_bit!(
            b1,
            0,
            ttq.offline_data_authentication_for_online_authorizations_supported
        );

        set_bit!(b2, 7, ttq.online_cryptogram_required);
        set_bit!(b2, 6, ttq.cvm_required);
        set_bit!(b2, 5, ttq.contact_chip_offline_pin_supported);

        set_bit!(b3, 7, ttq.issuer_update_processing_supported);
        set_bit!(b3, 6, ttq.consumer_device_cvm_supported);

        //byte 4 RFU
        vec![b1, b2, b3, 0x00]
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Terminal {
    pub use_random: bool,
    pub terminal_transaction_qualifiers: TerminalTransactionQualifiers,
}

/// Terminal-side values that card data object lists may request.
///
/// Seeded from the configured default tags plus per-transaction values
/// (date, time, unpredictable number, TTQ); card values such as the ATC are
/// echoed in as the scan learns them.
#[derive(Debug, Clone, Default)]
pub struct TransactionValueSource {
    values: HashMap<String, Vec<u8>>,
}

impl TransactionValueSource {
    pub fn new() -> TransactionValueSource {
        TransactionValueSource::default()
    }

    pub fn from_settings(settings: &Settings) -> Result<TransactionValueSource, ConfigError> {
        let mut source = TransactionValueSource::new();

        for (tag_name, tag_value) in settings.default_tags.iter() {
            let tag = TlvTag::parse(tag_name)
                .map_err(|_| ConfigError::InvalidTag(tag_name.clone()))?;
            let value = hex::decode(tag_value).map_err(|source| ConfigError::InvalidTagValue {
                tag: tag_name.clone(),
                source,
            })?;
            source.set(tag.as_str(), value);
        }

        source.fill_transaction_values(&settings.terminal, Utc::now())?;

        Ok(source)
    }

    fn fill_transaction_values(
        &mut self,
        terminal: &Terminal,
        now: DateTime<Utc>,
    ) -> Result<(), ConfigError> {
        if !self.contains("9A") {
            let transaction_date_ascii_yymmdd =
                format!("{:02}{:02}{:02}", now.year() % 100, now.month(), now.day());
            self.set("9A", bcdutil::ascii_to_bcd_n(transaction_date_ascii_yymmdd.as_bytes(), 3)?);
        }

        if !self.contains("9F21") {
            let transaction_time_ascii_hhmmss =
                format!("{:02}{:02}{:02}", now.hour(), now.minute(), now.second());
            self.set("9F21", bcdutil::ascii_to_bcd_n(transaction_time_ascii_hhmmss.as_bytes(), 3)?);
        }

        if !self.contains("9F37") {
            let mut tag_9f37_unpredictable_number = [0u8; 4];
            if terminal.use_random {
                ChaCha20Rng::from_entropy().fill(&mut tag_9f37_unpredictable_number[..]);
            }
            self.set("9F37", tag_9f37_unpredictable_number.to_vec());
        }

        if !self.contains("9F66") {
            self.set("9F66", terminal.terminal_transaction_qualifiers.into());
        }

        Ok(())
    }

    pub fn get(&self, tag: &str) -> Option<&[u8]> {
        self.values.get(tag).map(|v| v.as_slice())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.values.contains_key(tag)
    }

    pub fn set(&mut self, tag: &str, value: Vec<u8>) {
        if let Some(old) = self.values.get(tag) {
            trace!("Overriding terminal value {}: {:02X?} -> {:02X?}", tag, old, value);
        }
        self.values.insert(tag.to_uppercase(), value);
    }

    /// Feeds a value read from the card back into later command data.
    pub fn echo_card_value(&mut self, tag: &str, value: &[u8]) {
        debug!("Echoing card value {} into terminal data", tag);
        self.set(tag, value.to_vec());
    }
}
