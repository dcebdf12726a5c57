// Test support shared by the module tests.
use crate::transport::{ApduInterface, TransportError};
use crate::workflow::ScanAbort;
use log::LevelFilter;
use openssl::pkey::Private;
use openssl::rsa::{Padding, Rsa};
use log4rs::{
    append::console::ConsoleAppender,
    config::{Appender, Root},
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Once;

static LOGGING: Once = Once::new();

pub const SETTINGS_FILE: &str = "config/settings.yaml";

// Response standing for a card pulled out of the field.
const CARD_REMOVED: &str = "REMOVED";

pub fn init_logging() {
    LOGGING.call_once(|| {
        let stdout: ConsoleAppender = ConsoleAppender::builder().build();
        let config = log4rs::config::Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .build(Root::builder().appender("stdout").build(LevelFilter::Trace))
            .unwrap();
        log4rs::init_config(config).unwrap();
    });
}

/// Signs an EMV public key certificate the way a scheme CA or issuer does:
/// 6A | format | header fields | algorithms | key length | exponent length |
/// leftmost digits | hash | BC. The hash is left zeroed.
pub fn sign_certificate(
    signer: &Rsa<Private>,
    format: u8,
    header: &[u8],
    key_length: u8,
    leftmost_digits: &[u8],
) -> Result<Vec<u8>, openssl::error::ErrorStack> {
    let mut plain: Vec<u8> = vec![0x6A, format];
    plain.extend_from_slice(header);
    plain.push(0x01);
    plain.push(0x01);
    plain.push(key_length);
    plain.push(0x01);
    plain.extend_from_slice(leftmost_digits);
    plain.extend_from_slice(&[0u8; 20]);
    plain.push(0xBC);
    assert_eq!(plain.len(), signer.size() as usize);

    let mut certificate = vec![0u8; signer.size() as usize];
    let length = signer.private_encrypt(&plain, &mut certificate, Padding::NONE)?;
    certificate.truncate(length);
    Ok(certificate)
}

#[derive(Serialize, Deserialize, Clone)]
pub struct ApduRequestResponse {
    pub req: String,
    pub res: String,
}

impl ApduRequestResponse {
    fn to_raw_vec(s: &str) -> Vec<u8> {
        hex::decode(s.replace(' ', "")).unwrap()
    }
}

/// Card answering from a YAML list of request/response pairs. Commands
/// without a matching request get `6A82`.
pub struct DummySmartCardConnection {
    test_data: Vec<ApduRequestResponse>,
    pub sent: Vec<Vec<u8>>,
    pub closed: bool,
    uid: Option<Vec<u8>>,
    abort_after: Option<(usize, ScanAbort)>,
}

impl DummySmartCardConnection {
    pub fn new(test_data_file: &str) -> DummySmartCardConnection {
        let test_data: Vec<ApduRequestResponse> =
            serde_yaml::from_str(&fs::read_to_string(test_data_file).unwrap()).unwrap();

        DummySmartCardConnection::from_pairs(test_data)
    }

    /// Card built in the test itself, for responses that cannot be fixed in YAML.
    pub fn from_pairs(test_data: Vec<ApduRequestResponse>) -> DummySmartCardConnection {
        DummySmartCardConnection {
            test_data,
            sent: Vec::new(),
            closed: false,
            uid: Some(vec![0x04, 0x5A, 0x3B, 0x12]),
            abort_after: None,
        }
    }

    /// Raises the abort flag once `commands` APDUs have been answered.
    pub fn abort_after(mut self, commands: usize, abort: ScanAbort) -> DummySmartCardConnection {
        self.abort_after = Some((commands, abort));
        self
    }

    pub fn sent_hex(&self) -> Vec<String> {
        self.sent.iter().map(hex::encode_upper).collect()
    }

    /// Answers `req` with `res` ahead of any loaded pair.
    pub fn respond(mut self, req: &str, res: &str) -> DummySmartCardConnection {
        self.test_data.insert(
            0,
            ApduRequestResponse {
                req: req.to_string(),
                res: res.to_string(),
            },
        );
        self
    }

    fn find_dummy_apdu(&self, apdu: &[u8]) -> Option<&ApduRequestResponse> {
        self.test_data
            .iter()
            .find(|data| apdu == &ApduRequestResponse::to_raw_vec(&data.req)[..])
    }
}

impl ApduInterface for DummySmartCardConnection {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.closed = false;
        Ok(())
    }

    fn transceive(&mut self, apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.sent.push(apdu.to_vec());

        if let Some((commands, abort)) = &self.abort_after {
            if self.sent.len() >= *commands {
                abort.abort();
            }
        }

        let response = match self.find_dummy_apdu(apdu) {
            Some(data) if data.res == CARD_REMOVED => return Err(TransportError::CardRemoved),
            Some(data) => ApduRequestResponse::to_raw_vec(&data.res),
            None => b"\x6A\x82".to_vec(), // file not found error
        };

        Ok(response)
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn card_uid(&mut self) -> Option<Vec<u8>> {
        self.uid.clone()
    }
}
