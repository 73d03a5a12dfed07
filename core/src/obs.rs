//! The observation context of a search (`accelobs`).
//!
//! [`AccelObs`] is derived once from the driver's [`SearchConfig`] and the
//! observation metadata. It holds the searched frequency range, the f-dot
//! grid, and the per-stage power thresholds and trial counts. Nothing in the
//! engine mutates it after construction, so it is shared by reference
//! across every window worker.

use log::{info, warn};
use serde::Serialize;

use crate::kernel::calc_fftlen;
use crate::significance::power_for_sigma;
use crate::types::{
    Normalization, ObservationInfo, SearchConfig, ACCEL_DR, ACCEL_DZ, ACCEL_NUMBETWEEN,
    ACCEL_RDR, MAX_NUMHARM,
};

/// Errors detected while validating a search configuration. These are
/// reported before any search work starts.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("numharm must be a power of two between 1 and 32, got {0}")]
    BadNumHarm(u32),

    #[error("zmax must be non-negative, got {0}")]
    NegativeZmax(i32),

    #[error("uselen must be an even number of at least 16 points, got {0}")]
    BadUselen(usize),

    #[error("sigma must be finite, got {0}")]
    BadSigma(f32),

    #[error("observation info is unusable: {0}")]
    BadObservation(String),

    #[error("empty search range: rlo={rlo}, rhi={rhi}")]
    EmptyRange { rlo: f64, rhi: f64 },

    #[error("zap range ({lo}, {hi}) is not an ordered pair of finite bins")]
    BadZapRange { lo: f64, hi: f64 },

    #[error("{numharm}-harmonic stage has {numindep} independent trials; at least one is required")]
    DegenerateTrials { numharm: u32, numindep: f64 },

    #[error("{0} is not a harmonic stage of this search")]
    UnknownStage(u32),

    #[error("closest_r must be a finite, non-negative number of bins, got {0}")]
    BadClosestR(f64),
}

/// Immutable description of one acceleration search.
#[derive(Clone, Debug, Serialize)]
pub struct AccelObs {
    /// Number of time samples in the observation.
    pub n: u64,
    /// Number of spectral bins available.
    pub numbins: usize,
    /// Lowest spectral bin present.
    pub lobin: i64,
    /// Highest spectral bin searched.
    pub highestbin: i64,
    /// Length of the fundamental's short correlation FFTs.
    pub fftlen: usize,
    /// Number of harmonics summed in the last stage.
    pub numharm: u32,
    /// Number of harmonic stages (1, 2, 4, ... numharm).
    pub numharmstages: usize,
    /// Number of f-dot trials at the fundamental.
    pub numz: usize,
    /// Interbin oversampling of the output grid.
    pub numbetween: usize,
    /// Interbin output points per fundamental window.
    pub uselen: usize,
    /// Sample interval (s).
    pub dt: f64,
    /// Observation length (s).
    pub t: f64,
    /// Lowest Fourier frequency searched.
    pub rlo: f64,
    /// Highest Fourier frequency searched.
    pub rhi: f64,
    /// Fourier-frequency step.
    pub dr: f64,
    /// Largest |z| searched at the fundamental.
    pub zmax: i32,
    pub zlo: i32,
    pub zhi: i32,
    /// Fourier f-dot step.
    pub dz: i32,
    pub normalization: Normalization,
    /// Significance a candidate must reach.
    pub sigma: f32,
    powcut: Vec<f32>,
    numindep: Vec<f64>,
    zap_ranges: Vec<(f64, f64)>,
}

impl AccelObs {
    /// Validate `config` against the observation and derive the search
    /// context.
    pub fn new(
        config: &SearchConfig,
        info: &ObservationInfo,
        numbins: usize,
    ) -> Result<Self, ConfigError> {
        if info.n == 0 || !(info.dt > 0.0) || !info.dt.is_finite() {
            return Err(ConfigError::BadObservation(format!(
                "n={} dt={}",
                info.n, info.dt
            )));
        }
        if numbins < 2 {
            return Err(ConfigError::BadObservation(format!(
                "spectrum has only {numbins} bins"
            )));
        }
        let numharm = config.numharm;
        if !numharm.is_power_of_two() || numharm > MAX_NUMHARM {
            return Err(ConfigError::BadNumHarm(numharm));
        }
        if config.zmax < 0 {
            return Err(ConfigError::NegativeZmax(config.zmax));
        }
        if config.uselen < 16 || config.uselen % ACCEL_RDR != 0 {
            return Err(ConfigError::BadUselen(config.uselen));
        }
        if !config.sigma.is_finite() {
            return Err(ConfigError::BadSigma(config.sigma));
        }
        if !(config.closest_r.is_finite() && config.closest_r >= 0.0) {
            return Err(ConfigError::BadClosestR(config.closest_r));
        }

        let zmax = config.zmax / ACCEL_DZ * ACCEL_DZ;
        if zmax != config.zmax {
            warn!(
                "zmax must be a multiple of {}; using {} instead of {}",
                ACCEL_DZ, zmax, config.zmax
            );
        }

        let t = info.duration();
        let top = (numbins - 1) as f64;
        let rlo = config
            .rlo
            .or_else(|| config.flo.map(|f| f * t))
            .unwrap_or(1.0)
            .floor()
            .max(1.0);
        let rhi = config
            .rhi
            .or_else(|| config.fhi.map(|f| f * t))
            .map(f64::ceil)
            .unwrap_or(top)
            .min(top);
        if !(rhi > rlo) {
            return Err(ConfigError::EmptyRange { rlo, rhi });
        }

        for &(lo, hi) in &config.zap_ranges {
            if !(lo.is_finite() && hi.is_finite() && lo <= hi) {
                return Err(ConfigError::BadZapRange { lo, hi });
            }
        }

        let numz = (2 * zmax / ACCEL_DZ + 1) as usize;
        let numharmstages = numharm.trailing_zeros() as usize + 1;
        let mut numindep = Vec::with_capacity(numharmstages);
        let mut powcut = Vec::with_capacity(numharmstages);
        for stage in 0..numharmstages {
            let harms = 1_u32 << stage;
            let trials = independent_trials(rlo, rhi, numz, harms);
            if !(trials >= 1.0) {
                return Err(ConfigError::DegenerateTrials {
                    numharm: harms,
                    numindep: trials,
                });
            }
            numindep.push(trials);
            powcut.push(power_for_sigma(f64::from(config.sigma), harms, trials));
        }

        let obs = Self {
            n: info.n,
            numbins,
            lobin: 0,
            highestbin: rhi as i64,
            fftlen: calc_fftlen(1, 1, zmax, config.uselen),
            numharm,
            numharmstages,
            numz,
            numbetween: ACCEL_NUMBETWEEN,
            uselen: config.uselen,
            dt: info.dt,
            t,
            rlo,
            rhi,
            dr: ACCEL_DR,
            zmax,
            zlo: -zmax,
            zhi: zmax,
            dz: ACCEL_DZ,
            normalization: config.normalization,
            sigma: config.sigma,
            powcut,
            numindep,
            zap_ranges: config.zap_ranges.clone(),
        };

        info!(
            "Searching r={:.1}..{:.1} ({:.4}..{:.4} Hz), |z|<={}, {} harmonic stage(s), sigma>={:.2}",
            obs.rlo,
            obs.rhi,
            obs.rlo / t,
            obs.rhi / t,
            obs.zmax,
            obs.numharmstages,
            obs.sigma,
        );
        Ok(obs)
    }

    /// Harmonic counts searched, in increasing order.
    pub fn stages(&self) -> impl Iterator<Item = u32> {
        (0..self.numharmstages).map(|s| 1_u32 << s)
    }

    /// Slot of the `numharm`-harmonic stage in the per-stage tables.
    pub fn stage_index(&self, numharm: u32) -> Option<usize> {
        if !numharm.is_power_of_two() {
            return None;
        }
        let idx = numharm.trailing_zeros() as usize;
        (idx < self.numharmstages).then_some(idx)
    }

    /// Power a `numharm`-harmonic sum must exceed to be a candidate.
    pub fn powcut(&self, numharm: u32) -> Option<f32> {
        self.stage_index(numharm).map(|i| self.powcut[i])
    }

    /// Independent trials searched at the `numharm`-harmonic stage.
    pub fn numindep(&self, numharm: u32) -> Option<f64> {
        self.stage_index(numharm).map(|i| self.numindep[i])
    }

    /// Replace the power threshold of one stage.
    pub fn with_powcut(mut self, numharm: u32, powcut: f32) -> Result<Self, ConfigError> {
        let idx = self
            .stage_index(numharm)
            .ok_or(ConfigError::UnknownStage(numharm))?;
        self.powcut[idx] = powcut;
        Ok(self)
    }

    pub fn zap_ranges(&self) -> &[(f64, f64)] {
        &self.zap_ranges
    }

    /// True when `r` falls inside a zapped range.
    pub fn is_zapped(&self, r: f64) -> bool {
        self.zap_ranges.iter().any(|&(lo, hi)| r >= lo && r <= hi)
    }

    /// True when `r` is inside the searched frequency range.
    pub fn in_search_range(&self, r: f64) -> bool {
        r >= self.rlo && r <= self.rhi
    }
}

/// Number of independent trials of a `numharm`-harmonic search over
/// `rlo..rhi` with `numz` f-dot trials. Neighbouring f-dots are correlated;
/// roughly 6.95 z-units make one independent trial.
fn independent_trials(rlo: f64, rhi: f64, numz: usize, numharm: u32) -> f64 {
    let span = rhi - rlo;
    if numz == 1 {
        span / f64::from(numharm)
    } else {
        span * (numz as f64 + 1.0) * (f64::from(ACCEL_DZ) / 6.95) / f64::from(numharm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn config(zmax: i32, numharm: u32) -> SearchConfig {
        SearchConfig {
            zmax,
            numharm,
            uselen: 256,
            ..SearchConfig::default()
        }
    }

    fn info() -> ObservationInfo {
        ObservationInfo::new(8192, 1.0e-3)
    }

    #[test]
    fn derives_grid_and_range() {
        let obs = AccelObs::new(&config(21, 4), &info(), 4096).unwrap();

        assert_eq!(obs.zmax, 20);
        assert_eq!(obs.numz, 21);
        assert_eq!((obs.zlo, obs.zhi), (-20, 20));
        assert_eq!(obs.numharmstages, 3);
        assert_eq!(obs.stages().collect::<Vec<_>>(), vec![1, 2, 4]);
        assert_eq!(obs.rlo, 1.0);
        assert_eq!(obs.rhi, 4095.0);
        assert_relative_eq!(obs.t, 8.192, epsilon = 1e-12);
    }

    #[test]
    fn trial_counts_follow_harmonic_stage() {
        let obs = AccelObs::new(&config(0, 2), &info(), 4096).unwrap();
        assert_relative_eq!(obs.numindep(1).unwrap(), 4094.0, epsilon = 1e-9);
        assert_relative_eq!(obs.numindep(2).unwrap(), 2047.0, epsilon = 1e-9);

        let obs = AccelObs::new(&config(10, 1), &info(), 4096).unwrap();
        let expected = 4094.0 * 12.0 * (2.0 / 6.95);
        assert_relative_eq!(obs.numindep(1).unwrap(), expected, epsilon = 1e-9);
    }

    #[test]
    fn thresholds_grow_with_harmonics() {
        let obs = AccelObs::new(&config(0, 8), &info(), 4096).unwrap();
        let cuts: Vec<f32> = obs.stages().map(|h| obs.powcut(h).unwrap()).collect();
        assert!(cuts.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(obs.powcut(3), None);
        assert_eq!(obs.powcut(16), None);
    }

    #[test]
    fn frequency_bounds_in_hz_are_converted() {
        let cfg = SearchConfig {
            flo: Some(10.0),
            fhi: Some(100.0),
            ..config(0, 1)
        };
        let obs = AccelObs::new(&cfg, &info(), 4096).unwrap();
        assert_eq!(obs.rlo, 81.0);
        assert_eq!(obs.rhi, 820.0);
    }

    #[test]
    fn rejects_unusable_merge_radius() {
        for closest_r in [-1.0, f64::NAN, f64::INFINITY] {
            let cfg = SearchConfig {
                closest_r,
                ..config(0, 1)
            };
            assert!(matches!(
                AccelObs::new(&cfg, &info(), 4096),
                Err(ConfigError::BadClosestR(_))
            ));
        }
        let cfg = SearchConfig {
            closest_r: 0.0,
            ..config(0, 1)
        };
        assert!(AccelObs::new(&cfg, &info(), 4096).is_ok());
    }

    #[test]
    fn rejects_bad_numharm() {
        let err = AccelObs::new(&config(0, 3), &info(), 4096).unwrap_err();
        assert_eq!(err, ConfigError::BadNumHarm(3));
        let err = AccelObs::new(&config(0, 64), &info(), 4096).unwrap_err();
        assert_eq!(err, ConfigError::BadNumHarm(64));
    }

    #[test]
    fn rejects_degenerate_trials() {
        let cfg = SearchConfig {
            rlo: Some(10.0),
            rhi: Some(11.0),
            ..config(0, 2)
        };
        let err = AccelObs::new(&cfg, &info(), 4096).unwrap_err();
        assert!(matches!(err, ConfigError::DegenerateTrials { numharm: 2, .. }));
    }

    #[test]
    fn rejects_empty_range_and_bad_zaps() {
        let cfg = SearchConfig {
            rlo: Some(500.0),
            rhi: Some(400.0),
            ..config(0, 1)
        };
        assert!(matches!(
            AccelObs::new(&cfg, &info(), 4096),
            Err(ConfigError::EmptyRange { .. })
        ));

        let cfg = SearchConfig {
            zap_ranges: vec![(60.0, 50.0)],
            ..config(0, 1)
        };
        assert!(matches!(
            AccelObs::new(&cfg, &info(), 4096),
            Err(ConfigError::BadZapRange { .. })
        ));
    }

    #[test]
    fn powcut_override_and_zap_lookup() {
        let cfg = SearchConfig {
            zap_ranges: vec![(49.5, 50.5)],
            ..config(0, 2)
        };
        let obs = AccelObs::new(&cfg, &info(), 4096)
            .unwrap()
            .with_powcut(2, 0.0)
            .unwrap();
        assert_eq!(obs.powcut(2), Some(0.0));
        assert!(obs.is_zapped(50.0));
        assert!(!obs.is_zapped(51.0));
        assert!(obs.in_search_range(1.0));
        assert!(!obs.in_search_range(0.5));
        assert!(matches!(
            obs.with_powcut(4, 1.0),
            Err(ConfigError::UnknownStage(4))
        ));
    }
}
