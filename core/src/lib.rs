//! # accelsearch-core
//!
//! Fourier-domain acceleration search for binary pulsars, written in Rust
//! with optional Python bindings via [PyO3](https://pyo3.rs).
//!
//! ## Overview
//!
//! | Module           | Purpose                                                       |
//! |------------------|---------------------------------------------------------------|
//! | [`kernel`]       | Kernel bank: Fourier responses of drifting sinusoids          |
//! | [`plane`]        | Builds sub-harmonic f-fdot power planes and sums harmonics    |
//! | [`detect`]       | Thresholds summed planes into raw candidates                  |
//! | [`candidates`]   | Merges detections into distinct signals, writes them out      |
//! | [`accel`]        | Search engine sweeping the spectrum window by window          |
//! | [`obs`]          | Immutable search context derived from the configuration       |
//! | [`significance`] | Summed power to Gaussian sigma and back                       |
//! | [`spectrum`]     | Access to complex Fourier amplitudes                          |
//! | [`fftfile`]      | Reads raw `.fft` spectrum files                               |
//! | [`mask`]         | RFI masks: wire format and one-to-many distribution           |
//! | [`stats`]        | Running statistics and progress tracking                      |
//! | [`types`]        | Shared data structures (candidates, configuration, results)   |
//!
//! ## Rust usage
//!
//! ```no_run
//! use accelsearch_core::{AccelSearchEngine, FftFileReader, ObservationInfo, SearchConfig};
//!
//! let data = FftFileReader::new().read("obs.fft")?;
//! let engine = AccelSearchEngine::new(SearchConfig { zmax: 100, numharm: 8, ..SearchConfig::default() });
//! let result = engine.search(&data.spectrum, &ObservationInfo::new(1 << 22, 6.4e-5))?;
//! for cand in &result.candidates {
//!     println!("{:.4} Hz  sigma {:.2}", cand.frequency_hz(result.t_obs), cand.sigma);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Python usage
//!
//! Built with the `python` feature, the library exposes a module called
//! `accelsearch_core`:
//!
//! ```python
//! import accelsearch_core
//!
//! engine = accelsearch_core.AccelSearch('{"zmax": 100, "numharm": 8}')
//! result = engine.search_series(samples, dt)
//!
//! for candidate in result.candidates:
//!     print(candidate)
//! ```

pub mod accel;
pub mod candidates;
pub mod detect;
pub mod error;
pub mod fftfile;
pub mod kernel;
pub mod mask;
pub mod obs;
pub mod plane;
pub mod significance;
pub mod spectrum;
pub mod stats;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use accel::{AccelSearchEngine, WindowOutcome};
pub use candidates::{CandidateSet, CandidateSink, JsonLinesSink, MergePolicy, TextSink};
pub use error::AccelError;
pub use fftfile::{FftData, FftFileReader};
pub use kernel::KernelBank;
pub use mask::{MaskBroadcast, RfiMask};
pub use obs::{AccelObs, ConfigError};
pub use plane::FfdotPlane;
pub use spectrum::{InMemorySpectrum, SpectrumSource};
pub use types::{AccelCand, Normalization, ObservationInfo, SearchConfig, SearchResult};

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// The top-level Python module exposed by this crate.
///
/// Registered classes:
/// - `AccelSearch`: the acceleration search engine
/// - `FftFileReader`: `.fft` file reader
/// - `AccelCand`: a single candidate
/// - `SearchResult`: aggregated search output
#[cfg(feature = "python")]
#[pymodule]
fn accelsearch_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<AccelSearchEngine>()?;
    m.add_class::<FftFileReader>()?;
    m.add_class::<AccelCand>()?;
    m.add_class::<SearchResult>()?;

    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    m.add("__doc__", "Fourier-domain acceleration search core.")?;

    Ok(())
}
