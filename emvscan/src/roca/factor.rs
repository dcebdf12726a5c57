use log::{debug, trace};
use num_bigint_dig::BigUint;
use num_integer::Integer;
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

// Pollard-Brent batch size between gcd computations
const RHO_BATCH: usize = 128;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FactorMethod {
    StructuredSearch,
    Fermat,
    PollardRho,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactorLimits {
    pub budget: Duration,
    pub max_exponent: u32,
    pub max_multiplier: u32,
}

/// Tries to split `n` within the time budget: first over the candidate primes
/// `k * M + (65537^a mod M)` the vulnerable generator draws from, then
/// Fermat for close factors, then Pollard-Brent rho.
pub fn factor(
    n: &BigUint,
    primorial: &BigUint,
    limits: &FactorLimits,
) -> Option<(BigUint, BigUint, FactorMethod)> {
    if n <= &BigUint::one() {
        return None;
    }

    let started = Instant::now();
    let deadline = started + limits.budget;

    let stages: [(FactorMethod, Duration); 3] = [
        (FactorMethod::StructuredSearch, limits.budget / 2),
        (FactorMethod::Fermat, limits.budget / 4),
        (FactorMethod::PollardRho, limits.budget),
    ];

    for (method, share) in stages {
        let stage_deadline = (Instant::now() + share).min(deadline);

        let found = match method {
            FactorMethod::StructuredSearch => structured_search(
                n,
                primorial,
                limits.max_exponent,
                limits.max_multiplier,
                stage_deadline,
            ),
            FactorMethod::Fermat => fermat(n, stage_deadline),
            FactorMethod::PollardRho => pollard_brent(n, stage_deadline),
        };

        if let Some(p) = found {
            let q = n / &p;
            debug!("{:?} split the modulus after {:?}", method, started.elapsed());
            return Some(if p <= q { (p, q, method) } else { (q, p, method) });
        }

        trace!("{:?} found no factor", method);
    }

    None
}

fn is_proper_factor(n: &BigUint, candidate: &BigUint) -> bool {
    candidate > &BigUint::one() && candidate < n && (n % candidate).is_zero()
}

fn abs_diff(a: &BigUint, b: &BigUint) -> BigUint {
    if a > b {
        a - b
    } else {
        b - a
    }
}

pub(crate) fn isqrt(n: &BigUint) -> BigUint {
    if n.is_zero() {
        return BigUint::zero();
    }

    let mut x = BigUint::one() << ((n.bits() + 1) / 2);
    loop {
        let y = (&x + n / &x) >> 1usize;
        if y >= x {
            return x;
        }
        x = y;
    }
}

pub(crate) fn structured_search(
    n: &BigUint,
    primorial: &BigUint,
    max_exponent: u32,
    max_multiplier: u32,
    deadline: Instant,
) -> Option<BigUint> {
    let generator = BigUint::from(65537u32) % primorial;
    let multiples: Vec<BigUint> = (0..=max_multiplier)
        .map(|k| primorial * BigUint::from(k))
        .collect();

    let mut residue = BigUint::one();
    for a in 0..max_exponent {
        if Instant::now() > deadline {
            trace!("Structured search stopped at exponent {}", a);
            return None;
        }

        for multiple in &multiples {
            let candidate = &residue + multiple;
            if &candidate >= n {
                break;
            }
            if is_proper_factor(n, &candidate) {
                return Some(candidate);
            }
        }

        residue = (&residue * &generator) % primorial;
    }

    None
}

pub(crate) fn fermat(n: &BigUint, deadline: Instant) -> Option<BigUint> {
    if n.is_even() {
        return Some(BigUint::from(2u32)).filter(|two| is_proper_factor(n, two));
    }

    let mut a = isqrt(n);
    if &(&a * &a) < n {
        a += BigUint::one();
    }

    let mut iteration: u64 = 0;
    loop {
        if iteration % 256 == 0 && Instant::now() > deadline {
            return None;
        }
        iteration += 1;

        let b2 = &a * &a - n;
        let b = isqrt(&b2);
        if &b * &b == b2 {
            let p = &a - &b;
            return Some(p).filter(|p| is_proper_factor(n, p));
        }

        a += BigUint::one();
    }
}

fn rho_step(x: &BigUint, c: &BigUint, n: &BigUint) -> BigUint {
    (x * x + c) % n
}

pub(crate) fn pollard_brent(n: &BigUint, deadline: Instant) -> Option<BigUint> {
    if n.is_even() {
        return Some(BigUint::from(2u32)).filter(|two| is_proper_factor(n, two));
    }

    let one = BigUint::one();

    for c in 1u32.. {
        let c = BigUint::from(c);
        let mut y = BigUint::from(2u32);
        let mut x = y.clone();
        let mut ys = y.clone();
        let mut q = one.clone();
        let mut g = one.clone();
        let mut r: usize = 1;

        while g == one {
            x = y.clone();
            for _ in 0..r {
                y = rho_step(&y, &c, n);
            }

            let mut k = 0;
            while k < r && g == one {
                if Instant::now() > deadline {
                    return None;
                }

                ys = y.clone();
                for _ in 0..RHO_BATCH.min(r - k) {
                    y = rho_step(&y, &c, n);
                    q = (q * abs_diff(&x, &y)) % n;
                }
                g = q.gcd(n);
                k += RHO_BATCH;
            }
            r *= 2;
        }

        if &g == n {
            // the batch overshot, walk it again one step at a time
            loop {
                if Instant::now() > deadline {
                    return None;
                }
                ys = rho_step(&ys, &c, n);
                g = abs_diff(&x, &ys).gcd(n);
                if g > one {
                    break;
                }
            }
        }

        if is_proper_factor(n, &g) {
            return Some(g);
        }

        trace!("Pollard rho cycle without factor, changing constant");
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn test_isqrt() {
        assert_eq!(isqrt(&BigUint::from(0u32)), BigUint::from(0u32));
        assert_eq!(isqrt(&BigUint::from(1u32)), BigUint::from(1u32));
        assert_eq!(isqrt(&BigUint::from(99u32)), BigUint::from(9u32));
        assert_eq!(isqrt(&BigUint::from(100u32)), BigUint::from(10u32));

        let big = BigUint::from(0xFFFF_FFFF_FFFF_FFFFu64);
        let square = &big * &big;
        assert_eq!(isqrt(&square), big);
        assert_eq!(isqrt(&(square - BigUint::one())), BigUint::from(0xFFFF_FFFF_FFFF_FFFEu64));
    }

    #[test]
    fn test_fermat_close_factors() {
        let n = BigUint::from(1_000_003u64 * 1_000_033u64);
        assert_eq!(fermat(&n, far_deadline()), Some(BigUint::from(1_000_003u32)));

        // prime input has no proper factor
        assert_eq!(fermat(&BigUint::from(1_000_003u32), far_deadline()), None);
    }

    #[test]
    fn test_pollard_brent() {
        let n = BigUint::from(8051u32);
        let p = pollard_brent(&n, far_deadline()).unwrap();
        assert!(p == BigUint::from(83u32) || p == BigUint::from(97u32));

        let n = BigUint::from(1_000_003u64 * 2_147_483_647u64);
        let p = pollard_brent(&n, far_deadline()).unwrap();
        assert!(p == BigUint::from(1_000_003u32) || p == BigUint::from(2_147_483_647u32));
    }

    #[test]
    fn test_factor_respects_budget() {
        let n = BigUint::from(2_305_843_009_213_693_951u64) * BigUint::from(1_000_000_007u64)
            * BigUint::from(2_305_843_009_213_693_951u64);
        let limits = FactorLimits {
            budget: Duration::from_millis(1),
            max_exponent: 1,
            max_multiplier: 0,
        };

        let started = Instant::now();
        let _ = factor(&n, &BigUint::from(30u32), &limits);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
