use crate::keys::CapturedKey;
use crate::roca::{RocaAnalyzer, RocaFinding};
use log::{debug, info};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

fn worker_count(requested: usize, jobs: usize) -> usize {
    let workers = if requested == 0 {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        requested
    };

    workers.clamp(1, jobs.max(1))
}

/// Analyzes captured keys on a pool of scoped worker threads.
///
/// Workers pull the next key from a shared cursor, so a slow factorization
/// only holds up its own worker. Findings come back in input order.
pub fn analyze_keys(
    analyzer: &RocaAnalyzer,
    keys: &[CapturedKey],
    workers: usize,
) -> Vec<RocaFinding> {
    if keys.is_empty() {
        return Vec::new();
    }

    let workers = worker_count(workers, keys.len());
    info!("Analyzing {} keys on {} workers", keys.len(), workers);

    let cursor = AtomicUsize::new(0);
    let (sender, receiver) = mpsc::channel::<(usize, RocaFinding)>();

    thread::scope(|scope| {
        for worker in 0..workers {
            let sender = sender.clone();
            let cursor = &cursor;

            scope.spawn(move || loop {
                let index = cursor.fetch_add(1, Ordering::Relaxed);
                let key = match keys.get(index) {
                    Some(key) => key,
                    None => break,
                };

                debug!("Worker {} analyzing key {} ({})", worker, index, key.tag_source);
                if sender.send((index, analyzer.analyze_key(key))).is_err() {
                    break;
                }
            });
        }
    });
    drop(sender);

    let mut findings: Vec<(usize, RocaFinding)> = receiver.into_iter().collect();
    findings.sort_by_key(|(index, _)| *index);
    findings.into_iter().map(|(_, finding)| finding).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roca::Confidence;
    use crate::testing::init_logging;
    use crate::tlv::TlvTag;
    use crate::RocaSettings;
    use num_bigint_dig::BigUint;

    fn key(tag: &str, modulus: BigUint) -> CapturedKey {
        CapturedKey {
            tag_source: TlvTag::parse(tag).unwrap(),
            key_size_bits: modulus.bits() as u32,
            modulus,
            exponent: vec![0x03],
            recovered: true,
        }
    }

    #[test]
    fn test_worker_count() {
        assert_eq!(worker_count(4, 2), 2);
        assert_eq!(worker_count(3, 10), 3);
        assert_eq!(worker_count(5, 0), 1);
        assert!(worker_count(0, 1000) >= 1);
    }

    #[test]
    fn test_findings_keep_input_order() {
        init_logging();
        let analyzer = RocaAnalyzer::new(&RocaSettings::default());

        let m = analyzer.primorial().clone();
        let p = &m * BigUint::from(7u32) + BigUint::from(65537u32);
        let q = &m * BigUint::from(8u32)
            + BigUint::from(65537u32).modpow(&BigUint::from(3u32), &m);
        let vulnerable = &p * &q;

        let mut keys: Vec<CapturedKey> = (0..12u32)
            .map(|i| key("9F46", BigUint::from(1_000_003u64 * 1_000_033u64 + 2 * i as u64)))
            .collect();
        keys.insert(5, key("90", vulnerable.clone()));

        let findings = analyze_keys(&analyzer, &keys, 3);
        assert_eq!(findings.len(), keys.len());
        for (finding, key) in findings.iter().zip(keys.iter()) {
            assert_eq!(finding.modulus, key.modulus);
            assert_eq!(finding.tag_source, key.tag_source);
        }

        assert!(findings[5].is_vulnerable);
        assert_eq!(findings[5].confidence, Confidence::High);
        assert!(findings[5].factorization.is_some());
    }

    #[test]
    fn test_empty_batch() {
        let analyzer = RocaAnalyzer::new(&RocaSettings::default());
        assert!(analyze_keys(&analyzer, &[], 0).is_empty());
    }
}
