// ROCA, CVE-2017-15361: RSA primes of the form k * M + (65537^a mod M)
mod factor;

pub use factor::{FactorLimits, FactorMethod};

use crate::keys::CapturedKey;
use crate::tlv::TlvTag;
use crate::RocaSettings;
use log::{debug, info, trace};
use num_bigint_dig::BigUint;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub const ROCA_GENERATOR: u32 = 65537;

/// Odd primes up to 167. The fingerprint holds for 2 trivially.
pub const ROCA_PRIMES: [u32; 38] = [
    3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
    101, 103, 107, 109, 113, 127, 131, 137, 139, 149, 151, 157, 163, 167,
];

const MIN_FINGERPRINT_BITS: usize = 256;
const MIN_GENERATED_KEY_BITS: u32 = 512;
const MAX_GENERATED_KEY_BITS: u32 = 4096;
const KEY_SIZE_SLACK_BITS: u32 = 8;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Confidence {
    None,
    Low,
    Medium,
    High,
    Definite,
}

impl Confidence {
    fn downgrade(self) -> Confidence {
        match self {
            Confidence::Definite => Confidence::High,
            Confidence::High => Confidence::Medium,
            Confidence::Medium | Confidence::Low => Confidence::Low,
            Confidence::None => Confidence::None,
        }
    }

    pub fn warrants_factorization(&self) -> bool {
        *self >= Confidence::High
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Factorization {
    #[serde(with = "crate::hex_biguint")]
    pub p: BigUint,
    #[serde(with = "crate::hex_biguint")]
    pub q: BigUint,
    pub elapsed_ms: u64,
    pub method: FactorMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RocaFinding {
    pub tag_source: TlvTag,
    #[serde(with = "crate::hex_biguint")]
    pub modulus: BigUint,
    pub is_vulnerable: bool,
    pub confidence: Confidence,
    pub key_size_bits: u32,
    pub factorization: Option<Factorization>,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Fingerprint {
    pub matches: bool,
    pub failed_prime: Option<u32>,
    /// Bits of evidence of the table, log2 of the inverse false positive rate.
    pub discriminating_bits: f64,
}

struct ResidueTable {
    prime: u32,
    members: Vec<bool>,
}

impl ResidueTable {
    fn new(prime: u32) -> ResidueTable {
        let mut members = vec![false; prime as usize];
        let generator = ROCA_GENERATOR % prime;

        let mut residue = 1u32;
        while !members[residue as usize] {
            members[residue as usize] = true;
            residue = (residue * generator) % prime;
        }

        ResidueTable { prime, members }
    }

    fn order(&self) -> usize {
        self.members.iter().filter(|&&m| m).count()
    }

    fn contains(&self, modulus: &BigUint) -> bool {
        (modulus % BigUint::from(self.prime))
            .to_usize()
            .map_or(false, |residue| self.members[residue])
    }
}

pub struct RocaAnalyzer {
    tables: Vec<ResidueTable>,
    primorial: BigUint,
    discriminating_bits: f64,
    limits: FactorLimits,
}

impl RocaAnalyzer {
    pub fn new(settings: &RocaSettings) -> RocaAnalyzer {
        let tables: Vec<ResidueTable> = ROCA_PRIMES.iter().map(|&p| ResidueTable::new(p)).collect();

        let discriminating_bits = tables
            .iter()
            .map(|t| ((t.prime - 1) as f64 / t.order() as f64).log2())
            .sum();

        let primorial = ROCA_PRIMES
            .iter()
            .fold(BigUint::from(2u32), |m, &p| m * BigUint::from(p));

        trace!(
            "ROCA table ready: {} primes, {:.2} discriminating bits",
            tables.len(),
            discriminating_bits
        );

        RocaAnalyzer {
            tables,
            primorial,
            discriminating_bits,
            limits: FactorLimits {
                budget: settings.factorization_budget(),
                max_exponent: settings.max_structured_exponent,
                max_multiplier: settings.max_structured_multiplier,
            },
        }
    }

    pub fn primorial(&self) -> &BigUint {
        &self.primorial
    }

    pub fn fingerprint(&self, modulus: &BigUint) -> Fingerprint {
        let failed_prime = self
            .tables
            .iter()
            .find(|table| !table.contains(modulus))
            .map(|table| table.prime);

        Fingerprint {
            matches: failed_prime.is_none(),
            failed_prime,
            discriminating_bits: self.discriminating_bits,
        }
    }

    /// Screens a recovered RSA modulus.
    pub fn analyze(&self, tag_source: TlvTag, modulus: BigUint, key_size_bits: u32) -> RocaFinding {
        self.screen(tag_source, modulus, key_size_bits, true)
    }

    /// Screens a captured key. Certificate surrogates are never graded above
    /// [`Confidence::Low`] and are not factored.
    pub fn analyze_key(&self, key: &CapturedKey) -> RocaFinding {
        self.screen(
            key.tag_source.clone(),
            key.modulus.clone(),
            key.key_size_bits,
            key.recovered,
        )
    }

    fn screen(
        &self,
        tag_source: TlvTag,
        modulus: BigUint,
        key_size_bits: u32,
        recovered: bool,
    ) -> RocaFinding {
        let fingerprint = self.fingerprint(&modulus);

        if !fingerprint.matches {
            trace!(
                "{} modulus residue outside <65537> mod {:?}, not vulnerable",
                tag_source,
                fingerprint.failed_prime
            );

            return RocaFinding {
                tag_source,
                modulus,
                is_vulnerable: false,
                confidence: Confidence::None,
                key_size_bits,
                factorization: None,
            };
        }

        let confidence = grade(modulus.bits(), key_size_bits, recovered);
        info!(
            "{} {} ({} bits) matches the ROCA fingerprint, confidence {:?}",
            tag_source,
            if recovered { "modulus" } else { "certificate surrogate" },
            modulus.bits(),
            confidence
        );

        let factorization = if confidence.warrants_factorization() {
            self.factorize(&modulus)
        } else {
            None
        };

        RocaFinding {
            tag_source,
            modulus,
            is_vulnerable: true,
            confidence,
            key_size_bits,
            factorization,
        }
    }

    fn factorize(&self, modulus: &BigUint) -> Option<Factorization> {
        let started = Instant::now();
        let result = factor::factor(modulus, &self.primorial, &self.limits);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Some((p, q, method)) => {
                info!("Modulus factored with {:?} in {} ms", method, elapsed_ms);
                Some(Factorization {
                    p,
                    q,
                    elapsed_ms,
                    method,
                })
            }
            None => {
                debug!("No factors found within {} ms", elapsed_ms);
                None
            }
        }
    }
}

/// Confidence for a modulus that passed every table prime. A certificate
/// or signature value is no modulus, so a match on it stays at Low.
fn grade(modulus_bits: usize, key_size_bits: u32, recovered: bool) -> Confidence {
    if !recovered || modulus_bits < MIN_FINGERPRINT_BITS {
        return Confidence::Low;
    }

    let mut confidence = Confidence::Definite;

    if !(MIN_GENERATED_KEY_BITS..=MAX_GENERATED_KEY_BITS).contains(&key_size_bits) {
        confidence = confidence.downgrade();
    }

    if (modulus_bits as u32) + KEY_SIZE_SLACK_BITS < key_size_bits {
        confidence = confidence.downgrade();
    }

    confidence
}
