use crate::session::{ApduLogEntry, SessionScanData};
use crate::status::{StatusWord, StatusWordCatalog};
use crate::workflow::Phase;
use hexplay::HexViewBuilder;
use log::{debug, trace};
use std::time::Instant;
use thiserror::Error;

const SW1_BYTES_AVAILABLE: u8 = 0x61;
const SW1_WRONG_LENGTH: u8 = 0x6C;

// GET RESPONSE / Le retries allowed for one command.
const MAX_CHAINED_RESPONSES: usize = 8;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not connect to card: {0}")]
    Connect(String),

    #[error("card removed")]
    CardRemoved,

    #[error("transmit failed: {0}")]
    Transmit(String),

    #[error("response of {0} bytes has no status word")]
    ShortResponse(usize),

    #[error("card kept chaining responses after {0} follow-up commands")]
    ResponseChainTooLong(usize),
}

/// Reader side of the card connection. Implementations only move bytes;
/// status word handling happens in [`CardChannel`].
pub trait ApduInterface {
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Sends one command APDU and returns the response including SW1 SW2.
    fn transceive(&mut self, apdu: &[u8]) -> Result<Vec<u8>, TransportError>;

    fn close(&mut self) {}

    fn card_uid(&mut self) -> Option<Vec<u8>> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    pub data: Vec<u8>,
    pub status: StatusWord,
}

impl ApduResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

pub mod commands {
    use crate::afl::ReadInstruction;
    use crate::tlv::{self, TlvTag};
    use thiserror::Error;

    // Lc is a single byte in a short APDU.
    const MAX_SHORT_DATA_LENGTH: usize = 0xFF;

    #[derive(Debug, Error, PartialEq, Eq)]
    pub enum CommandError {
        #[error("command data of {0} bytes does not fit a short APDU")]
        DataTooLong(usize),
    }

    fn with_data(header: [u8; 4], data: &[u8]) -> Result<Vec<u8>, CommandError> {
        if data.len() > MAX_SHORT_DATA_LENGTH {
            return Err(CommandError::DataTooLong(data.len()));
        }

        let mut command = header.to_vec();
        command.push(data.len() as u8); // lc
        command.extend_from_slice(data);
        command.push(0x00); // le

        Ok(command)
    }

    //ref. EMV Book 1, 11.3.2 Command message
    pub fn select(name: &[u8]) -> Result<Vec<u8>, CommandError> {
        let p1_reference_control_parameter: u8 = 0b0000_0100; // "Select by name"
        let p2_selection_options: u8 = 0b0000_0000; // "First or only occurrence"

        with_data([0x00, 0xA4, p1_reference_control_parameter, p2_selection_options], name)
    }

    //ref. EMV Book 3, 6.5.8 GET PROCESSING OPTIONS Command-Response APDUs
    pub fn get_processing_options(pdol_data: &[u8]) -> Result<Vec<u8>, CommandError> {
        let mut command_template = vec![0x83];
        command_template.extend(tlv::encode_length(pdol_data.len()));
        command_template.extend_from_slice(pdol_data);

        with_data([0x80, 0xA8, 0x00, 0x00], &command_template)
    }

    pub fn read_record(read: &ReadInstruction) -> Vec<u8> {
        vec![0x00, 0xB2, read.record, read.p2, 0x00]
    }

    //ref. EMV Book 3, 6.5.5 GENERATE APPLICATION CRYPTOGRAM Command-Response APDUs
    pub fn generate_ac(reference_control: u8, cdol_data: &[u8]) -> Result<Vec<u8>, CommandError> {
        with_data([0x80, 0xAE, reference_control, 0x00], cdol_data)
    }

    /// GET DATA addresses the object with P1 P2, so only one and two byte tags fit.
    pub fn get_data(tag: &TlvTag) -> Option<Vec<u8>> {
        match tag.to_bytes()[..] {
            [p2] => Some(vec![0x80, 0xCA, 0x00, p2, 0x00]),
            [p1, p2] => Some(vec![0x80, 0xCA, p1, p2, 0x00]),
            _ => None,
        }
    }

    pub fn get_challenge() -> Vec<u8> {
        vec![0x00, 0x84, 0x00, 0x00, 0x00]
    }

    pub fn get_response(available_data_length: u8) -> Vec<u8> {
        vec![0x00, 0xC0, 0x00, 0x00, available_data_length]
    }
}

/// Command/response exchange on top of an [`ApduInterface`]: follows
/// 61xx/6Cxx status words, logs, counts and records every exchange.
pub struct CardChannel<'a> {
    interface: &'a mut dyn ApduInterface,
    status_words: &'a StatusWordCatalog,
    censor: bool,
}

impl<'a> CardChannel<'a> {
    pub fn new(
        interface: &'a mut dyn ApduInterface,
        status_words: &'a StatusWordCatalog,
        censor: bool,
    ) -> CardChannel<'a> {
        CardChannel {
            interface,
            status_words,
            censor,
        }
    }

    /// Connects and returns the card UID if the reader exposes it.
    pub fn connect(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        self.interface.connect()?;
        Ok(self.interface.card_uid())
    }

    pub fn close(&mut self) {
        self.interface.close();
    }

    pub fn describe(&self, status: StatusWord) -> String {
        self.status_words.describe(status)
    }

    pub fn exchange(
        &mut self,
        session: &mut SessionScanData,
        phase: Phase,
        apdu: &[u8],
    ) -> Result<ApduResponse, TransportError> {
        let started = Instant::now();
        let mut response_data: Vec<u8> = Vec::new();
        let mut apdu_command = apdu.to_vec();
        let mut follow_ups = 0;

        let status = loop {
            if self.censor {
                debug!(
                    "Sending APDU: {:02X?}... ({} bytes)",
                    &apdu_command[..apdu_command.len().min(5)],
                    apdu_command.len()
                );
            } else {
                debug!("Sending APDU:\n{}", HexViewBuilder::new(&apdu_command).finish());
            }

            let apdu_response = self.interface.transceive(&apdu_command)?;
            let status = StatusWord::from_trailer(&apdu_response)
                .ok_or(TransportError::ShortResponse(apdu_response.len()))?;
            response_data.extend_from_slice(&apdu_response[..apdu_response.len() - 2]);

            debug!("APDU response status: {}", self.status_words.describe(status));

            match status.sw1() {
                SW1_BYTES_AVAILABLE => {
                    // 6100: more than 255 bytes available, query the maximum
                    let available_data_length = match status.sw2() {
                        0x00 => 0xFF,
                        length => length,
                    };
                    apdu_command = commands::get_response(available_data_length);
                }
                SW1_WRONG_LENGTH if status.sw2() > 0x00 => {
                    trace!("Resending with Le {:02X}", status.sw2());
                    apdu_command = apdu.to_vec();
                    if let Some(le) = apdu_command.last_mut() {
                        *le = status.sw2();
                    }
                }
                _ => break status,
            }

            follow_ups += 1;
            if follow_ups > MAX_CHAINED_RESPONSES {
                return Err(TransportError::ResponseChainTooLong(follow_ups));
            }
        };

        if self.censor {
            debug!("APDU response({} bytes)", response_data.len());
        } else {
            debug!(
                "APDU response({} bytes):\n{}",
                response_data.len(),
                HexViewBuilder::new(&response_data).finish()
            );
        }

        session.apdu_log.push(ApduLogEntry {
            phase,
            command: apdu.to_vec(),
            response: response_data.clone(),
            status,
            elapsed_ms: started.elapsed().as_millis() as u64,
            description: self.status_words.describe(status),
        });
        session.counters.sent += 1;
        if status.is_success() {
            session.counters.succeeded += 1;
        }

        Ok(ApduResponse {
            data: response_data,
            status,
        })
    }
}
