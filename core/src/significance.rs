//! Conversion between summed power and detection significance.
//!
//! The normalised power of a single Fourier bin of pure noise is
//! exponentially distributed with unit mean, so twice the sum of `n`
//! harmonics follows a χ² distribution with `2n` degrees of freedom.  A
//! detection's significance is the Gaussian sigma that has the same
//! false-alarm probability once the number of independent trials searched
//! is accounted for.
//!
//! Every probability is carried as a natural logarithm: summed powers of
//! real signals routinely reach tail probabilities far below the smallest
//! representable `f64`.

use statrs::distribution::{ContinuousCDF, Normal};
use statrs::function::factorial::ln_factorial;

/// Below this log-probability the rational approximation replaces the
/// exact inverse normal CDF.
const EXTENDED_SIGMA_LOGP: f64 = -600.0;

/// Bonferroni form of the trials correction is used once it is this small.
const SMALL_LOGP: f64 = -20.0;

/// Above this sigma the normal survival function underflows and the
/// asymptotic series is used instead.
const ASYMPTOTIC_SF_SIGMA: f64 = 35.0;

/// Natural log of the probability that `numharm` summed noise powers
/// exceed `power`.
///
/// For an integer number of degrees of freedom the χ² survival function has
/// the closed form `Q = e^{-P} Σ_{k<n} P^k / k!`, which is summed here with
/// a log-sum-exp so it stays finite for arbitrarily large `P`.
pub fn chi2_log_sf(power: f64, numharm: u32) -> f64 {
    if power <= 0.0 || numharm == 0 {
        return 0.0;
    }
    let ln_p = power.ln();
    let terms: Vec<f64> = (0..u64::from(numharm))
        .map(|k| k as f64 * ln_p - ln_factorial(k))
        .collect();
    let max = terms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let sum: f64 = terms.iter().map(|t| (t - max).exp()).sum();
    (max + sum.ln() - power).min(0.0)
}

/// Correct a single-trial log-probability for `numindep` independent trials:
/// `p = 1 - (1 - q)^numindep`.
pub fn log_prob_with_trials(ln_q: f64, numindep: f64) -> f64 {
    let numindep = numindep.max(1.0);
    let ln_bonferroni = ln_q + numindep.ln();
    if ln_bonferroni < SMALL_LOGP {
        return ln_bonferroni;
    }
    let q = ln_q.exp();
    let p = -(numindep * (-q).ln_1p()).exp_m1();
    p.ln().min(0.0)
}

/// Gaussian sigma with the same upper-tail probability as `exp(ln_p)`.
pub fn equivalent_gaussian_sigma(ln_p: f64) -> f64 {
    if ln_p < EXTENDED_SIGMA_LOGP {
        return extended_equiv_gaussian_sigma(ln_p);
    }
    let p = ln_p.exp().clamp(f64::MIN_POSITIVE, 1.0 - f64::EPSILON);
    -Normal::standard().inverse_cdf(p)
}

/// Abramowitz & Stegun 26.2.23, good to ~4.5e-4 in sigma and usable for
/// log-probabilities far beyond `f64` range.
pub fn extended_equiv_gaussian_sigma(ln_p: f64) -> f64 {
    let t = (-2.0 * ln_p).sqrt();
    let num = 2.515517 + t * (0.802853 + t * 0.010328);
    let denom = 1.0 + t * (1.432788 + t * (0.189269 + t * 0.001308));
    t - num / denom
}

/// Natural log of the standard normal upper-tail probability.
pub fn ln_normal_sf(sigma: f64) -> f64 {
    if sigma < ASYMPTOTIC_SF_SIGMA {
        return Normal::standard().sf(sigma).ln();
    }
    let x2 = sigma * sigma;
    -0.5 * x2 - sigma.ln() - 0.5 * (2.0 * std::f64::consts::PI).ln()
        + (1.0 - 1.0 / x2 + 3.0 / (x2 * x2)).ln()
}

/// Significance of `power` summed over `numharm` harmonics when
/// `numindep` independent trials were searched.
pub fn candidate_sigma(power: f64, numharm: u32, numindep: f64) -> f32 {
    if power <= 0.0 {
        return 0.0;
    }
    let ln_q = chi2_log_sf(power, numharm);
    let ln_p = log_prob_with_trials(ln_q, numindep);
    equivalent_gaussian_sigma(ln_p) as f32
}

/// Summed power a `numharm`-harmonic detection needs to reach `sigma`
/// after `numindep` trials.
///
/// Solves `ln Q(P) = ln Φc(sigma) - ln numindep` by bracketing and
/// bisection. Returns 0 when the required single-trial probability is not
/// below one, i.e. every positive power qualifies.
pub fn power_for_sigma(sigma: f64, numharm: u32, numindep: f64) -> f32 {
    let target = ln_normal_sf(sigma) - numindep.max(1.0).ln();
    if !(target < 0.0) {
        return 0.0;
    }

    let mut lo = 0.0_f64;
    let mut hi = f64::from(numharm.max(1));
    while chi2_log_sf(hi, numharm) > target && hi < 1e15 {
        lo = hi;
        hi *= 2.0;
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if chi2_log_sf(mid, numharm) > target {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= 1e-12 * hi {
            break;
        }
    }
    (0.5 * (lo + hi)) as f32
}
