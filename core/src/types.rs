//! Common types shared across the acceleration-search pipeline.
//!
//! These structures represent the value objects of a Fourier-domain
//! acceleration search: the search grid constants, the search
//! configuration supplied by the driver, individual candidates, and the
//! aggregated result of a full frequency sweep.

use std::cmp::Ordering;

#[cfg(feature = "python")]
use pyo3::prelude::*;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Search grid constants
// ---------------------------------------------------------------------------

/// Default number of interbin output points per fundamental search window.
pub const ACCEL_USELEN: usize = 32000;

/// Fourier-frequency oversampling of the correlation output (2 = interbin).
pub const ACCEL_NUMBETWEEN: usize = 2;

/// Step size in Fourier frequency.
pub const ACCEL_DR: f64 = 0.5;

/// Reciprocal of [`ACCEL_DR`].
pub const ACCEL_RDR: usize = 2;

/// Step size in Fourier f-dot.
pub const ACCEL_DZ: i32 = 2;

/// Reciprocal of [`ACCEL_DZ`].
pub const ACCEL_RDZ: f64 = 0.5;

/// Default radius (in Fourier bins) inside which two detections are
/// considered the same signal.
pub const ACCEL_CLOSEST_R: f64 = 15.0;

/// Smallest half-width (bins) of any correlation kernel.
pub const NUMFINTBINS: usize = 16;

/// Largest number of harmonics that may be summed.
pub const MAX_NUMHARM: u32 = 32;

// ---------------------------------------------------------------------------
// AccelCand
// ---------------------------------------------------------------------------

/// A single detection produced by the harmonic-summed search.
///
/// `r` and `z` are expressed in the coordinates of the plane the detection
/// was found in: `r` is the average Fourier frequency (bins) over the
/// observation and `z` the Fourier f-dot (bins drifted during the
/// observation).
#[cfg_attr(feature = "python", pyclass(get_all, set_all))]
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccelCand {
    /// Summed (normalised) power.
    pub power: f32,

    /// Equivalent Gaussian significance after the independent-trials
    /// correction for `numharm` summed harmonics.
    pub sigma: f32,

    /// Number of harmonics summed to reach `power`.
    pub numharm: u32,

    /// Fourier frequency in bins.
    pub r: f64,

    /// Fourier f-dot in bins.
    pub z: f64,
}

impl AccelCand {
    pub fn new(power: f32, sigma: f32, numharm: u32, r: f64, z: f64) -> Self {
        Self {
            power,
            sigma,
            numharm,
            r,
            z,
        }
    }

    /// Frequency in Hz for an observation of length `t_obs` seconds.
    pub fn frequency_hz(&self, t_obs: f64) -> f64 {
        self.r / t_obs
    }

    /// Frequency derivative in Hz/s for an observation of length `t_obs`.
    pub fn fdot_hz_per_s(&self, t_obs: f64) -> f64 {
        self.z / (t_obs * t_obs)
    }
}

#[cfg(feature = "python")]
#[pymethods]
impl AccelCand {
    #[new]
    #[pyo3(signature = (power, sigma, numharm, r, z))]
    fn py_new(power: f32, sigma: f32, numharm: u32, r: f64, z: f64) -> Self {
        Self::new(power, sigma, numharm, r, z)
    }

    fn __repr__(&self) -> String {
        format!(
            "AccelCand(power={:.2}, sigma={:.2}, numharm={}, r={:.4}, z={:.2})",
            self.power, self.sigma, self.numharm, self.r, self.z,
        )
    }
}

/// Total order used to present candidates: descending sigma, then
/// descending power, then ascending Fourier frequency.
pub fn compare_accelcand(a: &AccelCand, b: &AccelCand) -> Ordering {
    b.sigma
        .total_cmp(&a.sigma)
        .then_with(|| b.power.total_cmp(&a.power))
        .then_with(|| a.r.total_cmp(&b.r))
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// How Fourier amplitudes are scaled before correlation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Normalization {
    /// Use the amplitudes as stored.
    None,

    /// Divide each correlation block by `sqrt(median(|A|²) / ln 2)`, which
    /// turns exponentially distributed noise powers into unit-mean powers.
    BlockMedian,

    /// Photon data: divide by `sqrt(nph)` where `nph` is the frequency-zero
    /// level of the spectrum.
    Photon { nph: f64 },
}

impl Default for Normalization {
    fn default() -> Self {
        Normalization::BlockMedian
    }
}

// ---------------------------------------------------------------------------
// SearchConfig
// ---------------------------------------------------------------------------

/// Configuration of an acceleration search.
///
/// This is everything the driver knows from the command line. The engine
/// turns it into an immutable [`crate::obs::AccelObs`] once per run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Largest |f-dot| (bins) searched at the fundamental.
    pub zmax: i32,

    /// Number of harmonics summed (1, 2, 4, 8, 16 or 32).
    pub numharm: u32,

    /// Significance (Gaussian sigma) a candidate must reach.
    pub sigma: f32,

    /// Lowest Fourier frequency (bins) to search.
    pub rlo: Option<f64>,

    /// Highest Fourier frequency (bins) to search.
    pub rhi: Option<f64>,

    /// Lowest frequency (Hz) to search; used when `rlo` is unset.
    pub flo: Option<f64>,

    /// Highest frequency (Hz) to search; used when `rhi` is unset.
    pub fhi: Option<f64>,

    /// Interbin output points per fundamental window.
    pub uselen: usize,

    /// Amplitude normalisation applied per correlation block.
    pub normalization: Normalization,

    /// Fourier-bin ranges `(lo, hi)` to zap (known birdies).
    pub zap_ranges: Vec<(f64, f64)>,

    /// Merge radius (bins) of the candidate set.
    pub closest_r: f64,

    /// Number of rayon worker threads. 0 uses all available cores.
    pub n_workers: usize,

    /// Keep a copy of each window's unsummed fundamental plane.
    pub keep_fundamental: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            zmax: 200,
            numharm: 8,
            sigma: 2.0,
            rlo: None,
            rhi: None,
            flo: None,
            fhi: None,
            uselen: ACCEL_USELEN,
            normalization: Normalization::default(),
            zap_ranges: Vec::new(),
            closest_r: ACCEL_CLOSEST_R,
            n_workers: 0,
            keep_fundamental: false,
        }
    }
}

impl SearchConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ---------------------------------------------------------------------------
// ObservationInfo
// ---------------------------------------------------------------------------

/// The parts of the observation metadata the search needs.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservationInfo {
    /// Number of time samples that went into the spectrum.
    pub n: u64,

    /// Sample interval in seconds.
    pub dt: f64,
}

impl ObservationInfo {
    pub fn new(n: u64, dt: f64) -> Self {
        Self { n, dt }
    }

    /// Total observation length in seconds.
    pub fn duration(&self) -> f64 {
        self.n as f64 * self.dt
    }
}

// ---------------------------------------------------------------------------
// SearchResult
// ---------------------------------------------------------------------------

/// Aggregated output of a full frequency sweep.
#[cfg_attr(feature = "python", pyclass(get_all))]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchResult {
    /// Merged candidates ordered by [`compare_accelcand`].
    pub candidates: Vec<AccelCand>,

    /// Number of plane cells that crossed a power threshold.
    pub raw_detections: usize,

    /// Number of fundamental windows searched.
    pub windows: usize,

    /// Observation length in seconds, for converting `r`/`z` to Hz.
    pub t_obs: f64,

    /// Wall-clock processing time in milliseconds.
    pub processing_time_ms: u64,
}

impl SearchResult {
    /// Serialise the result to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(feature = "python")]
#[pymethods]
impl SearchResult {
    #[pyo3(name = "to_json")]
    fn py_to_json(&self) -> PyResult<String> {
        self.to_json()
            .map_err(|e| pyo3::exceptions::PyValueError::new_err(e.to_string()))
    }

    fn __repr__(&self) -> String {
        format!(
            "SearchResult(candidates={}, raw={}, windows={}, time={}ms)",
            self.candidates.len(),
            self.raw_detections,
            self.windows,
            self.processing_time_ms,
        )
    }
}
