//! Acceleration search engine: sweeps the spectrum window by window.
//!
//! # Background
//!
//! A pulsar in a binary orbit is accelerated along the line of sight, so
//! its apparent spin frequency drifts during the observation and its power
//! smears over several Fourier bins.  Correlating the spectrum with the
//! response of a linearly drifting sinusoid (see [`crate::kernel`]) restores
//! that power on a grid of Fourier frequency `r` and f-dot `z`.  Pulsars
//! are also rich in harmonics, so the powers at `r`, `r/2`, `r/4`, ... are
//! summed in stages before thresholding.
//!
//! # Algorithm overview
//!
//! 1. **Preparation**: derive [`AccelObs`] from the configuration and build
//!    the [`KernelBank`] once.
//! 2. **Windows**: split `[rlo, rhi]` into fundamental windows of `uselen`
//!    interbin points.  Windows are independent and run in parallel on a
//!    **rayon** pool.
//! 3. **Per window**: build the fundamental plane and detect on it; then
//!    for each stage `h = 2, 4, ...` add the planes of the new odd fractions
//!    `k/h` and detect with `h` harmonics.  Detections merge into a private
//!    [`CandidateSet`].
//! 4. **Merge**: absorb the private sets in window order into the global
//!    set and sort it by significance.

use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use log::{debug, info};
#[cfg(feature = "python")]
use pyo3::prelude::*;
use rayon::prelude::*;

use crate::candidates::{CandidateSet, MergePolicy};
use crate::detect::search_ffdotpows;
use crate::error::AccelError;
use crate::kernel::KernelBank;
use crate::obs::AccelObs;
use crate::plane::{add_ffdotpows, subharm_ffdot_plane, FfdotPlane};
use crate::spectrum::SpectrumSource;
use crate::stats::{Progress, RunningStats};
use crate::types::{ObservationInfo, SearchConfig, SearchResult, ACCEL_DR};

// ---------------------------------------------------------------------------
// WindowOutcome
// ---------------------------------------------------------------------------

/// Everything one fundamental window produced.
#[derive(Clone, Debug)]
pub struct WindowOutcome {
    /// First Fourier frequency of the window.
    pub startr: f64,
    /// Last Fourier frequency of the window.
    pub lastr: f64,
    /// Plane cells that crossed a threshold, over all stages.
    pub raw_detections: usize,
    /// The window's merged detections.
    pub candidates: CandidateSet,
    /// Power statistics of the unsummed fundamental plane.
    pub fundamental_stats: RunningStats,
    /// Copy of the unsummed fundamental plane, when requested.
    pub fundamental: Option<FfdotPlane>,
}

/// Fundamental windows `(startr, lastr)` covering `[obs.rlo, obs.rhi]`.
pub fn search_windows(obs: &AccelObs) -> Vec<(f64, f64)> {
    let step = obs.uselen as f64 * ACCEL_DR;
    let mut windows = Vec::new();
    let mut startr = obs.rlo;
    while startr <= obs.rhi {
        let lastr = (startr + step - ACCEL_DR).min(obs.rhi);
        windows.push((startr, lastr));
        startr += step;
    }
    windows
}

// ---------------------------------------------------------------------------
// AccelSearchEngine
// ---------------------------------------------------------------------------

/// The Fourier-domain acceleration search engine.
///
/// Construct with a [`SearchConfig`] and call [`AccelSearchEngine::search`]
/// on a spectrum to obtain a [`SearchResult`].
#[cfg_attr(feature = "python", pyclass(name = "AccelSearch"))]
#[derive(Clone, Debug)]
pub struct AccelSearchEngine {
    config: SearchConfig,
}

impl AccelSearchEngine {
    pub fn new(config: SearchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Derive the observation context and build the kernel bank.
    pub fn prepare(
        &self,
        info: &ObservationInfo,
        numbins: usize,
    ) -> Result<(AccelObs, KernelBank), AccelError> {
        let obs = AccelObs::new(&self.config, info, numbins)?;
        let bank = KernelBank::build(obs.numharm, obs.zmax, obs.uselen)?;
        Ok((obs, bank))
    }

    /// Run the full search over `spectrum`.
    pub fn search<S: SpectrumSource + ?Sized>(
        &self,
        spectrum: &S,
        info: &ObservationInfo,
    ) -> Result<SearchResult, AccelError> {
        let (obs, bank) = self.prepare(info, spectrum.numbins())?;
        self.search_prepared(&obs, &bank, spectrum)
    }

    /// Run the search with an already derived context and kernel bank.
    pub fn search_prepared<S: SpectrumSource + ?Sized>(
        &self,
        obs: &AccelObs,
        bank: &KernelBank,
        spectrum: &S,
    ) -> Result<SearchResult, AccelError> {
        let start = Instant::now();
        let outcomes = self.sweep(obs, bank, spectrum)?;

        let windows = outcomes.len();
        let mut raw_detections = 0;
        let mut global = CandidateSet::new(self.merge_policy());
        for outcome in outcomes {
            raw_detections += outcome.raw_detections;
            global.absorb(outcome.candidates);
        }
        let candidates = global.into_sorted();

        let elapsed = start.elapsed().as_millis() as u64;
        info!(
            "Search complete in {} ms: {} candidates from {} threshold crossings in {} windows",
            elapsed,
            candidates.len(),
            raw_detections,
            windows,
        );

        Ok(SearchResult {
            candidates,
            raw_detections,
            windows,
            t_obs: obs.t,
            processing_time_ms: elapsed,
        })
    }

    /// Search every window in parallel and return the outcomes in window
    /// order. The first failing window aborts the sweep.
    pub fn sweep<S: SpectrumSource + ?Sized>(
        &self,
        obs: &AccelObs,
        bank: &KernelBank,
        spectrum: &S,
    ) -> Result<Vec<WindowOutcome>, AccelError> {
        check_bank(obs, bank)?;
        let windows = search_windows(obs);
        info!(
            "Sweeping {} window(s) of {} points with {} kernels",
            windows.len(),
            obs.uselen,
            bank.len()
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.n_workers)
            .build()?;

        let total = windows.len();
        let progress = Mutex::new((0_usize, Progress::new()));

        pool.install(|| {
            windows
                .par_iter()
                .map(|&(startr, lastr)| -> Result<WindowOutcome, AccelError> {
                    let outcome = self
                        .search_window(startr, lastr, obs, bank, spectrum)
                        .map_err(|e| AccelError::Window {
                            startr,
                            source: Box::new(e),
                        })?;
                    if let Some(pct) = record_window(&progress, total) {
                        info!("Amount complete = {:3}%", pct);
                    }
                    Ok(outcome)
                })
                .collect::<Result<Vec<_>, _>>()
        })
    }

    /// Search one fundamental window `[startr, lastr]` through every
    /// harmonic stage.
    pub fn search_window<S: SpectrumSource + ?Sized>(
        &self,
        startr: f64,
        lastr: f64,
        obs: &AccelObs,
        bank: &KernelBank,
        spectrum: &S,
    ) -> Result<WindowOutcome, AccelError> {
        let fund_kernels = bank.subharm(1, 1)?;
        let mut ffdot = subharm_ffdot_plane(1, 1, startr, lastr, &fund_kernels, obs, spectrum)?;

        let mut fundamental_stats = RunningStats::new();
        fundamental_stats.extend(ffdot.powers.iter().map(|&p| f64::from(p)));
        let fundamental = self.config.keep_fundamental.then(|| ffdot.copy());

        let mut raw = Vec::new();
        search_ffdotpows(&ffdot, 1, obs, &mut raw)?;

        for stage in obs.stages().skip(1) {
            for harmnum in (1..stage).step_by(2) {
                let kernels = bank.subharm(stage, harmnum)?;
                let sub =
                    subharm_ffdot_plane(stage, harmnum, startr, lastr, &kernels, obs, spectrum)?;
                add_ffdotpows(&mut ffdot, &sub, stage, harmnum)?;
            }
            search_ffdotpows(&ffdot, stage, obs, &mut raw)?;
        }

        let raw_detections = raw.len();
        let mut candidates = CandidateSet::new(self.merge_policy());
        candidates.extend(raw);
        debug!(
            "Window r={:.1}..{:.1}: {} crossings, {} candidates, max fundamental power {:.2}",
            startr,
            lastr,
            raw_detections,
            candidates.len(),
            fundamental_stats.max().unwrap_or(0.0),
        );

        Ok(WindowOutcome {
            startr,
            lastr,
            raw_detections,
            candidates,
            fundamental_stats,
            fundamental,
        })
    }

    fn merge_policy(&self) -> MergePolicy {
        MergePolicy {
            closest_r: self.config.closest_r,
        }
    }
}

/// Count one finished window; returns the new percentage when it grew.
fn record_window(progress: &Mutex<(usize, Progress)>, total: usize) -> Option<u8> {
    let mut guard = progress.lock().unwrap_or_else(PoisonError::into_inner);
    let (done, tracker) = &mut *guard;
    *done += 1;
    tracker.update(*done, total)
}

/// The bank must have been built for the searched harmonics and f-dots.
fn check_bank(obs: &AccelObs, bank: &KernelBank) -> Result<(), AccelError> {
    if bank.numharm() != obs.numharm || bank.zmax() != obs.zmax || bank.uselen() != obs.uselen {
        return Err(AccelError::BankMismatch(format!(
            "bank has numharm={} zmax={} uselen={}, search needs numharm={} zmax={} uselen={}",
            bank.numharm(),
            bank.zmax(),
            bank.uselen(),
            obs.numharm,
            obs.zmax,
            obs.uselen
        )));
    }
    Ok(())
}

#[cfg(feature = "python")]
#[pymethods]
impl AccelSearchEngine {
    /// Create an engine from an optional JSON configuration.
    #[new]
    #[pyo3(signature = (config_json=None))]
    fn py_new(config_json: Option<&str>) -> PyResult<Self> {
        let config = match config_json {
            Some(json) => SearchConfig::from_json_str(json)
                .map_err(|e| pyo3::exceptions::PyValueError::new_err(e.to_string()))?,
            None => SearchConfig::default(),
        };
        Ok(Self::new(config))
    }

    /// Search the spectrum of a real time series sampled every `dt` seconds.
    #[pyo3(name = "search_series")]
    fn py_search_series(&self, series: Vec<f32>, dt: f64) -> PyResult<SearchResult> {
        let run = || -> Result<SearchResult, AccelError> {
            let spectrum = crate::spectrum::InMemorySpectrum::from_time_series(&series)?;
            let info = ObservationInfo::new(series.len() as u64, dt);
            self.search(&spectrum, &info)
        };
        run().map_err(|e| pyo3::exceptions::PyRuntimeError::new_err(e.to_string()))
    }

    /// Search a complex spectrum given as `(re, im)` pairs.
    #[pyo3(name = "search")]
    fn py_search(&self, amplitudes: Vec<(f32, f32)>, n: u64, dt: f64) -> PyResult<SearchResult> {
        let spectrum = crate::spectrum::InMemorySpectrum::new(
            amplitudes
                .into_iter()
                .map(|(re, im)| num_complex::Complex::new(re, im))
                .collect(),
        );
        self.search(&spectrum, &ObservationInfo::new(n, dt))
            .map_err(|e| pyo3::exceptions::PyRuntimeError::new_err(e.to_string()))
    }

    fn __repr__(&self) -> String {
        format!("AccelSearch({:?})", self.config)
    }
}
