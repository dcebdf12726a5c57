// Public key capture for ROCA screening.
// EMV Book 2, 6.3 Retrieval of Issuer Public Key and 6.4 Retrieval of ICC Public Key
use crate::session::SessionScanData;
use crate::tlv::TlvTag;
use hexplay::HexViewBuilder;
use log::{debug, trace, warn};
use num_bigint_dig::BigUint;
use openssl::bn::BigNum;
use openssl::rsa::{Padding, Rsa};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

const RECOVERED_DATA_HEADER: u8 = 0x6A;
const RECOVERED_DATA_TRAILER: u8 = 0xBC;
const ISSUER_CERTIFICATE_FORMAT: u8 = 0x02;
const ICC_CERTIFICATE_FORMAT: u8 = 0x04;

#[derive(Debug, Error)]
pub enum KeyRecoveryError {
    #[error("tag {0} not captured")]
    MissingTag(&'static str),

    #[error("no CA public key for RID {rid} index {index}")]
    MissingCaKey { rid: String, index: String },

    #[error("invalid hex in key {0}")]
    InvalidKey(#[from] hex::FromHexError),

    #[error("RSA operation failed: {0}")]
    Rsa(#[from] openssl::error::ErrorStack),

    #[error("recovered data is {actual} bytes, expected {expected}")]
    Length { actual: usize, expected: usize },

    #[error("recovered data header {0:02X} incorrect")]
    Header(u8),

    #[error("recovered data trailer {0:02X} incorrect")]
    Trailer(u8),

    #[error("certificate format {actual:02X}, expected {expected:02X}")]
    Format { actual: u8, expected: u8 },

    #[error("public key remainder is {actual} bytes, expected {expected}")]
    Remainder { actual: usize, expected: usize },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RsaPublicKey {
    pub modulus: String,
    pub exponent: String,
}

impl RsaPublicKey {
    pub fn new(modulus: &[u8], exponent: &[u8]) -> RsaPublicKey {
        RsaPublicKey {
            modulus: hex::encode_upper(modulus),
            exponent: hex::encode_upper(exponent),
        }
    }

    pub fn get_key_byte_size(&self) -> usize {
        self.modulus.len() / 2
    }

    /// Raw RSA public operation over an EMV signed data block. The result
    /// must be framed by the `6A` header and `BC` trailer.
    pub fn public_decrypt(&self, cipher_data: &[u8]) -> Result<Vec<u8>, KeyRecoveryError> {
        let pk_modulus_raw = hex::decode(&self.modulus)?;
        let pk_modulus = BigNum::from_slice(&pk_modulus_raw[..])?;
        let pk_exponent = BigNum::from_slice(&hex::decode(&self.exponent)?[..])?;

        let rsa = Rsa::from_public_components(pk_modulus, pk_exponent)?;

        let mut decrypt_output = vec![0u8; rsa.size() as usize];
        let length = rsa.public_decrypt(cipher_data, &mut decrypt_output[..], Padding::NONE)?;
        decrypt_output.truncate(length);

        trace!("Decrypt result ({} bytes)", decrypt_output.len());

        if decrypt_output.len() != pk_modulus_raw.len() {
            return Err(KeyRecoveryError::Length {
                actual: decrypt_output.len(),
                expected: pk_modulus_raw.len(),
            });
        }
        if decrypt_output[0] != RECOVERED_DATA_HEADER {
            return Err(KeyRecoveryError::Header(decrypt_output[0]));
        }
        if decrypt_output[decrypt_output.len() - 1] != RECOVERED_DATA_TRAILER {
            return Err(KeyRecoveryError::Trailer(
                decrypt_output[decrypt_output.len() - 1],
            ));
        }

        Ok(decrypt_output)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CertificateAuthority {
    pub issuer: String,
    pub certificates: HashMap<String, RsaPublicKey>,
}

/// Scheme CA public keys by RID and key index.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(transparent)]
pub struct CaKeyStore {
    authorities: HashMap<String, CertificateAuthority>,
}

impl CaKeyStore {
    pub fn new(authorities: HashMap<String, CertificateAuthority>) -> CaKeyStore {
        CaKeyStore { authorities }
    }

    pub fn get(&self, rid: &[u8], index: &[u8]) -> Option<&RsaPublicKey> {
        let ca = self.authorities.get(&hex::encode_upper(rid))?;
        let key = ca.certificates.get(&hex::encode_upper(index));
        if key.is_none() {
            warn!("No CA key defined! rid:{:02X?}, index:{:02X?}", rid, index);
        }
        key
    }

    pub fn len(&self) -> usize {
        self.authorities.values().map(|ca| ca.certificates.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RSA public key (or certificate surrogate) captured from a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedKey {
    pub tag_source: TlvTag,
    #[serde(with = "crate::hex_biguint")]
    pub modulus: BigUint,
    #[serde(with = "crate::hex_bytes")]
    pub exponent: Vec<u8>,
    pub key_size_bits: u32,
    pub recovered: bool,
}

impl CapturedKey {
    fn recovered(tag_source: &str, modulus: &[u8], exponent: &[u8]) -> CapturedKey {
        CapturedKey {
            tag_source: TlvTag::from_bytes(&tag_bytes(tag_source)),
            modulus: BigUint::from_bytes_be(modulus),
            exponent: exponent.to_vec(),
            key_size_bits: (modulus.len() * 8) as u32,
            recovered: true,
        }
    }

    fn surrogate(tag_source: &str, certificate: &[u8], exponent: Option<&[u8]>) -> CapturedKey {
        CapturedKey {
            tag_source: TlvTag::from_bytes(&tag_bytes(tag_source)),
            modulus: BigUint::from_bytes_be(certificate),
            exponent: exponent.map(|e| e.to_vec()).unwrap_or_default(),
            key_size_bits: (certificate.len() * 8) as u32,
            recovered: false,
        }
    }
}

fn tag_bytes(tag: &str) -> Vec<u8> {
    hex::decode(tag).unwrap_or_default()
}

/// Recovered certificate layout: where the key length byte and the leftmost
/// modulus digits sit, and how many trailing bytes (hash + trailer) follow.
struct CertificateLayout {
    format: u8,
    length_position: usize,
    digits_position: usize,
    overhead: usize,
}

const ISSUER_LAYOUT: CertificateLayout = CertificateLayout {
    format: ISSUER_CERTIFICATE_FORMAT,
    length_position: 13,
    digits_position: 15,
    overhead: 36,
};

const ICC_LAYOUT: CertificateLayout = CertificateLayout {
    format: ICC_CERTIFICATE_FORMAT,
    length_position: 19,
    digits_position: 21,
    overhead: 42,
};

fn recover_modulus(
    signer: &RsaPublicKey,
    certificate: &[u8],
    remainder: Option<&[u8]>,
    layout: &CertificateLayout,
) -> Result<Vec<u8>, KeyRecoveryError> {
    let recovered = signer.public_decrypt(certificate)?;

    if recovered.len() < layout.overhead {
        return Err(KeyRecoveryError::Length {
            actual: recovered.len(),
            expected: layout.overhead,
        });
    }

    if recovered[1] != layout.format {
        return Err(KeyRecoveryError::Format {
            actual: recovered[1],
            expected: layout.format,
        });
    }

    let digits_length = recovered.len() - layout.overhead;
    let leftmost_digits = &recovered[layout.digits_position..layout.digits_position + digits_length];
    let modulus_length = recovered[layout.length_position] as usize;

    debug!(
        "Certificate format {:02X}, hash algo {:02X}, pk algo {:02X}, pk length {}",
        recovered[1],
        recovered[layout.length_position - 2],
        recovered[layout.length_position - 1],
        modulus_length
    );

    let mut modulus: Vec<u8> = Vec::with_capacity(modulus_length);
    if modulus_length <= digits_length {
        modulus.extend_from_slice(&leftmost_digits[..modulus_length]);
    } else {
        let remainder = remainder.unwrap_or_default();
        if remainder.len() != modulus_length - digits_length {
            return Err(KeyRecoveryError::Remainder {
                actual: remainder.len(),
                expected: modulus_length - digits_length,
            });
        }
        modulus.extend_from_slice(leftmost_digits);
        modulus.extend_from_slice(remainder);
    }

    trace!(
        "PK modulus ({} bytes):\n{}",
        modulus.len(),
        HexViewBuilder::new(&modulus[..]).finish()
    );

    Ok(modulus)
}

fn registered_application_provider(session: &SessionScanData) -> Option<Vec<u8>> {
    let aid = match &session.selected_application {
        Some(application) => application.aid.clone(),
        None => session.value("4F").or(session.value("84"))?.to_vec(),
    };

    if aid.len() < 5 {
        return None;
    }

    Some(aid[0..5].to_vec())
}

pub fn get_issuer_public_key(
    session: &SessionScanData,
    ca_keys: &CaKeyStore,
) -> Result<RsaPublicKey, KeyRecoveryError> {
    let tag_90_issuer_public_key_certificate =
        session.value("90").ok_or(KeyRecoveryError::MissingTag("90"))?;
    let tag_9f32_issuer_pk_exponent =
        session.value("9F32").ok_or(KeyRecoveryError::MissingTag("9F32"))?;
    let tag_8f_ca_pk_index = session.value("8F").ok_or(KeyRecoveryError::MissingTag("8F"))?;
    let rid = registered_application_provider(session).ok_or(KeyRecoveryError::MissingTag("4F"))?;

    let ca_pk = ca_keys
        .get(&rid, tag_8f_ca_pk_index)
        .ok_or_else(|| KeyRecoveryError::MissingCaKey {
            rid: hex::encode_upper(&rid),
            index: hex::encode_upper(tag_8f_ca_pk_index),
        })?;

    let modulus = recover_modulus(
        ca_pk,
        tag_90_issuer_public_key_certificate,
        session.value("92"),
        &ISSUER_LAYOUT,
    )?;

    Ok(RsaPublicKey::new(&modulus, tag_9f32_issuer_pk_exponent))
}

pub fn get_icc_public_key(
    session: &SessionScanData,
    issuer_pk: &RsaPublicKey,
) -> Result<RsaPublicKey, KeyRecoveryError> {
    let tag_9f46_icc_pk_certificate =
        session.value("9F46").ok_or(KeyRecoveryError::MissingTag("9F46"))?;
    let tag_9f47_icc_pk_exponent =
        session.value("9F47").ok_or(KeyRecoveryError::MissingTag("9F47"))?;

    let modulus = recover_modulus(
        issuer_pk,
        tag_9f46_icc_pk_certificate,
        session.value("9F48"),
        &ICC_LAYOUT,
    )?;

    Ok(RsaPublicKey::new(&modulus, tag_9f47_icc_pk_exponent))
}

/// Collects the issuer and ICC keys of a session. Keys that cannot be
/// recovered are represented by their certificate value.
pub fn capture_keys(session: &SessionScanData, ca_keys: &CaKeyStore) -> Vec<CapturedKey> {
    let mut keys: Vec<CapturedKey> = Vec::new();

    let mut issuer_pk: Option<RsaPublicKey> = None;
    if let Some(certificate) = session.value("90") {
        match get_issuer_public_key(session, ca_keys) {
            Ok(pk) => {
                debug!("Issuer public key recovered ({} bytes)", pk.get_key_byte_size());
                keys.push(CapturedKey::recovered(
                    "90",
                    &hex::decode(&pk.modulus).unwrap_or_default(),
                    session.value("9F32").unwrap_or_default(),
                ));
                issuer_pk = Some(pk);
            }
            Err(err) => {
                debug!("Issuer public key not recovered: {}", err);
                keys.push(CapturedKey::surrogate("90", certificate, session.value("9F32")));
            }
        }
    }

    if let Some(certificate) = session.value("9F46") {
        let recovered = issuer_pk
            .as_ref()
            .map(|pk| get_icc_public_key(session, pk));

        match recovered {
            Some(Ok(pk)) => {
                debug!("ICC public key recovered ({} bytes)", pk.get_key_byte_size());
                keys.push(CapturedKey::recovered(
                    "9F46",
                    &hex::decode(&pk.modulus).unwrap_or_default(),
                    session.value("9F47").unwrap_or_default(),
                ));
            }
            Some(Err(err)) => {
                debug!("ICC public key not recovered: {}", err);
                keys.push(CapturedKey::surrogate("9F46", certificate, session.value("9F47")));
            }
            None => {
                keys.push(CapturedKey::surrogate("9F46", certificate, session.value("9F47")));
            }
        }
    }

    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::TagDictionary;
    use crate::testing::{init_logging, sign_certificate};
    use crate::workflow::ApplicationCandidate;
    use openssl::pkey::Private;

    const RID: [u8; 5] = [0xA0, 0x00, 0x00, 0x00, 0x03];

    fn public_key(key: &Rsa<Private>) -> RsaPublicKey {
        RsaPublicKey::new(&key.n().to_vec(), &key.e().to_vec())
    }

    fn store_with(ca: &Rsa<Private>) -> CaKeyStore {
        let mut certificates = HashMap::new();
        certificates.insert("92".to_string(), public_key(ca));

        let mut authorities = HashMap::new();
        authorities.insert(
            hex::encode_upper(RID),
            CertificateAuthority {
                issuer: "Test CA".to_string(),
                certificates,
            },
        );
        CaKeyStore::new(authorities)
    }

    fn insert(session: &mut SessionScanData, tag: &str, value: &[u8]) {
        let dictionary = TagDictionary::new(Vec::new(), HashMap::new(), HashMap::new());
        session.insert_value(&dictionary, TlvTag::parse(tag).unwrap(), value.to_vec(), true);
    }

    #[test]
    fn test_issuer_and_icc_key_recovery() -> Result<(), openssl::error::ErrorStack> {
        init_logging();

        let ca = Rsa::generate(1024)?;
        let issuer = Rsa::generate(1024)?;
        let icc = Rsa::generate(1024)?;

        let issuer_modulus = issuer.n().to_vec();
        let icc_modulus = icc.n().to_vec();
        assert_eq!(issuer_modulus.len(), 128);

        // issuer: 128 - 36 = 92 leftmost digits in the certificate, 36 in the remainder
        let issuer_certificate = sign_certificate(
            &ca,
            ISSUER_CERTIFICATE_FORMAT,
            &[0x47, 0x61, 0x73, 0xFF, 0x12, 0x30, 0x00, 0x00, 0x01],
            128,
            &issuer_modulus[..92],
        )?;

        // ICC: 128 - 42 = 86 leftmost digits, 42 in the remainder
        let icc_certificate = sign_certificate(
            &issuer,
            ICC_CERTIFICATE_FORMAT,
            &[
                0x47, 0x61, 0x73, 0x90, 0x01, 0x01, 0x00, 0x10, 0xFF, 0xFF, 0x12, 0x30, 0x00,
                0x00, 0x02,
            ],
            128,
            &icc_modulus[..86],
        )?;

        let mut session = SessionScanData::new(None);
        session.selected_application = Some(ApplicationCandidate {
            aid: [&RID[..], &[0x10, 0x10]].concat(),
            label: "VISA".to_string(),
            preferred_name: None,
            priority: 1,
        });
        insert(&mut session, "8F", &[0x92]);
        insert(&mut session, "90", &issuer_certificate);
        insert(&mut session, "92", &issuer_modulus[92..]);
        insert(&mut session, "9F32", &issuer.e().to_vec());
        insert(&mut session, "9F46", &icc_certificate);
        insert(&mut session, "9F47", &icc.e().to_vec());
        insert(&mut session, "9F48", &icc_modulus[86..]);

        let keys = capture_keys(&session, &store_with(&ca));
        assert_eq!(keys.len(), 2);

        assert_eq!(keys[0].tag_source.as_str(), "90");
        assert!(keys[0].recovered);
        assert_eq!(keys[0].modulus, BigUint::from_bytes_be(&issuer_modulus));
        assert_eq!(keys[0].key_size_bits, 1024);
        assert_eq!(keys[0].exponent, vec![0x01, 0x00, 0x01]);

        assert_eq!(keys[1].tag_source.as_str(), "9F46");
        assert!(keys[1].recovered);
        assert_eq!(keys[1].modulus, BigUint::from_bytes_be(&icc_modulus));

        Ok(())
    }

    #[test]
    fn test_short_issuer_key_without_remainder() -> Result<(), openssl::error::ErrorStack> {
        let ca = Rsa::generate(1024)?;

        // 64 byte key padded with BB inside the 92 byte digit field
        let mut digits = vec![0x5Au8; 64];
        digits.resize(92, 0xBB);
        let certificate = sign_certificate(
            &ca,
            ISSUER_CERTIFICATE_FORMAT,
            &[0x47, 0x61, 0x73, 0xFF, 0x12, 0x30, 0x00, 0x00, 0x01],
            64,
            &digits,
        )?;

        let modulus = recover_modulus(&public_key(&ca), &certificate, None, &ISSUER_LAYOUT)
            .expect("recovered modulus");
        assert_eq!(modulus, vec![0x5A; 64]);

        // the same certificate is not an ICC certificate
        match recover_modulus(&public_key(&ca), &certificate, None, &ICC_LAYOUT) {
            Err(KeyRecoveryError::Format { actual, expected }) => {
                assert_eq!((actual, expected), (0x02, 0x04))
            }
            other => panic!("unexpected result {:?}", other),
        }

        Ok(())
    }

    #[test]
    fn test_surrogate_without_ca_key() {
        let mut session = SessionScanData::new(None);
        insert(&mut session, "4F", &[0xA0, 0x00, 0x00, 0x00, 0x04, 0x10, 0x10]);
        insert(&mut session, "8F", &[0x05]);
        insert(&mut session, "90", &[0x12, 0x34, 0x56, 0x78]);
        insert(&mut session, "9F32", &[0x03]);
        insert(&mut session, "9F46", &[0x00, 0xAB, 0xCD]);

        let keys = capture_keys(&session, &CaKeyStore::default());
        assert_eq!(keys.len(), 2);
        assert!(!keys[0].recovered);
        assert_eq!(keys[0].modulus, BigUint::from(0x1234_5678u32));
        assert_eq!(keys[0].key_size_bits, 32);
        assert_eq!(keys[0].exponent, vec![0x03]);

        assert!(!keys[1].recovered);
        assert_eq!(keys[1].modulus, BigUint::from(0xABCDu32));
        assert_eq!(keys[1].key_size_bits, 24);
        assert!(keys[1].exponent.is_empty());

        assert!(matches!(
            get_issuer_public_key(&session, &CaKeyStore::default()),
            Err(KeyRecoveryError::MissingCaKey { .. })
        ));
    }

    #[test]
    fn test_no_certificates() {
        let session = SessionScanData::new(None);
        assert!(capture_keys(&session, &CaKeyStore::default()).is_empty());
    }
}
