use super::{Phase, PhaseOutcome, PhaseResult, TransactionWorkflow};
use crate::dol;
use crate::session::GetDataSnapshot;
use crate::tlv::{self, TlvTag};
use crate::transport::commands;
use crate::CryptogramType;
use log::{debug, info, warn};

const GET_DATA_TAGS: [&str; 9] = [
    "9F17", // PIN Try Counter
    "9F36", // Application Transaction Counter
    "9F13", // Last Online ATC Register
    "9F4F", // Log Format
    "9F4D", // Log Entry
    "9F6E", // Form Factor Indicator / Third Party Data
    "9F6D", // Mag-stripe Application Version Number
    "DF60", // Visa VLP funds limit
    "DF61", // Visa VLP single transaction limit
];

//ref. EMV Book 3, 6.5.5.4 Data Field Returned in the Response Message
// CID (1) | ATC (2) | Application Cryptogram (8) | Issuer Application Data (var)
fn split_format1(value: &[u8]) -> Option<Vec<(&'static str, &[u8])>> {
    if value.len() < 11 {
        return None;
    }

    let mut fields = vec![
        ("9F27", &value[0..1]),
        ("9F36", &value[1..3]),
        ("9F26", &value[3..11]),
    ];
    if value.len() > 11 {
        fields.push(("9F10", &value[11..]));
    }

    Some(fields)
}

impl<'a> TransactionWorkflow<'a> {
    pub(super) fn generate_application_cryptogram(&mut self) -> PhaseResult {
        let cdol1 = match self.session.value("8C") {
            Some(cdol1) => dol::parse_dol(cdol1),
            None => return Ok(PhaseOutcome::Skipped("card has no CDOL1".to_string())),
        };
        debug!("CDOL1: {}", dol::describe(&cdol1, &self.context.tags));

        if let Some(atc) = self.session.value("9F36") {
            self.values.echo_card_value("9F36", atc);
        }

        let needs_challenge = cdol1.iter().any(|entry| entry.tag.as_str() == "9F4C");
        if needs_challenge && !self.values.contains("9F4C") {
            let response = self.exchange(Phase::GenerateAc, &commands::get_challenge())?;
            if response.is_success() && !response.data.is_empty() {
                self.values.set("9F4C", response.data);
            } else {
                debug!("GET CHALLENGE: {}", self.channel.describe(response.status));
            }
        }

        let cdol_data = dol::build(&cdol1, &self.values);
        let reference_control = u8::from(CryptogramType::AuthorisationRequestCryptogram);
        let response = self.exchange(
            Phase::GenerateAc,
            &commands::generate_ac(reference_control, &cdol_data)?,
        )?;

        if !response.is_success() {
            let description = self.channel.describe(response.status);
            if response.status.category().is_feature_absent() {
                info!("GENERATE AC not available: {}", description);
            } else {
                warn!("GENERATE AC failed: {}", description);
            }
            return Ok(PhaseOutcome::Failed(description));
        }

        self.session.snapshots.cryptogram = Some(response.data.clone());

        let format1 = match response.data.first() {
            Some(0x80) => tlv::decode_shallow(&response.data)
                .ok()
                .and_then(|entries| tlv::find(&entries, "80").map(|e| e.raw_value.clone())),
            _ => None,
        };

        match format1 {
            Some(value) => match split_format1(&value) {
                Some(fields) => {
                    for (tag, field) in fields {
                        if let Ok(tag) = TlvTag::parse(tag) {
                            self.session.insert_value(
                                &self.context.tags,
                                tag,
                                field.to_vec(),
                                self.censor,
                            );
                        }
                    }
                }
                None => {
                    return Ok(PhaseOutcome::Failed(format!(
                        "cryptogram response too short: {} bytes",
                        value.len()
                    )))
                }
            },
            None => {
                self.session
                    .merge_tlv(&self.context.tags, &response.data, self.censor, true);
            }
        }

        match self.session.value("9F27").and_then(|cid| cid.first()) {
            Some(cid) => match CryptogramType::try_from(*cid) {
                Ok(cryptogram_type) => info!("Card generated {:?}", cryptogram_type),
                Err(_) => warn!("Unknown cryptogram information {:02X}", cid),
            },
            None => warn!("Cryptogram response without CID"),
        }

        Ok(PhaseOutcome::Completed)
    }

    pub(super) fn get_data_primitives(&mut self) -> PhaseResult {
        let mut found = 0;

        for tag_name in GET_DATA_TAGS {
            let tag = match TlvTag::parse(tag_name) {
                Ok(tag) => tag,
                Err(_) => continue,
            };
            let command = match commands::get_data(&tag) {
                Some(command) => command,
                None => continue,
            };

            let response = self.exchange(Phase::GetDataPrimitives, &command)?;
            self.session.snapshots.get_data.push(GetDataSnapshot {
                tag: tag.clone(),
                status: response.status,
                data: response.data.clone(),
            });

            if !response.is_success() {
                debug!(
                    "GET DATA {} ({}): {}",
                    tag,
                    self.context.tags.name(tag.as_str()),
                    self.channel.describe(response.status)
                );
                continue;
            }

            // Most cards wrap the object in its own tag, some return the bare value.
            let wrapped = tlv::decode_shallow(&response.data)
                .map(|entries| entries.first().map_or(false, |entry| entry.tag == tag))
                .unwrap_or(false);

            if wrapped {
                self.session
                    .merge_tlv(&self.context.tags, &response.data, self.censor, true);
            } else {
                self.session
                    .insert_value(&self.context.tags, tag, response.data, self.censor);
            }
            found += 1;
        }

        info!("GET DATA returned {} of {} objects", found, GET_DATA_TAGS.len());

        Ok(PhaseOutcome::Completed)
    }
}
