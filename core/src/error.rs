//! Error type of the search engine proper.

use crate::obs::ConfigError;

/// Errors raised while building kernels, planes, or sweeping windows.
#[derive(Debug, thiserror::Error)]
pub enum AccelError {
    #[error("invalid search configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to allocate {bytes} bytes for {what}")]
    Allocation { what: &'static str, bytes: usize },

    #[error("kernel for z={z} needs {needed} samples but the FFT length is {fftlen}")]
    KernelTooWide { z: i32, needed: usize, fftlen: usize },

    #[error("window of {numrs} interbin points exceeds the {numgoodbins} good bins of a {fftlen}-point correlation")]
    WindowTooWide {
        numrs: usize,
        numgoodbins: usize,
        fftlen: usize,
    },

    #[error("kernel bank built for {bank_numharm} harmonics has no sub-harmonic {harmnum}/{numharm}")]
    MissingSubharmonic {
        numharm: u32,
        harmnum: u32,
        bank_numharm: u32,
    },

    #[error("harmonic grid mismatch summing {harmnum}/{numharm}: {detail}")]
    GridMismatch {
        numharm: u32,
        harmnum: u32,
        detail: String,
    },

    #[error("{0} is not a harmonic stage of this search")]
    UnknownStage(u32),

    #[error("kernel bank does not match the search: {0}")]
    BankMismatch(String),

    #[error("failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("power plane shape: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("search window starting at r={startr} failed: {source}")]
    Window {
        startr: f64,
        #[source]
        source: Box<AccelError>,
    },
}

/// Allocate a vector of `len` copies of `value`, reporting allocation
/// failure instead of aborting.
pub(crate) fn try_filled<T: Clone>(
    len: usize,
    value: T,
    what: &'static str,
) -> Result<Vec<T>, AccelError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| AccelError::Allocation {
        what,
        bytes: len.saturating_mul(std::mem::size_of::<T>()),
    })?;
    v.resize(len, value);
    Ok(v)
}
