//! Reader for raw `.fft` spectrum files.
//!
//! A `.fft` file is the forward FFT of a real time series stored as
//! consecutive little-endian `f32` pairs `(re, im)`, one per Fourier bin,
//! with no header. Bin 0 is packed: its real part is the DC level and its
//! imaginary part the Nyquist amplitude. The reader records both and zeroes
//! bin 0 so the DC level never enters a correlation.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use log::info;
use num_complex::Complex;
#[cfg(feature = "python")]
use pyo3::prelude::*;

use crate::spectrum::InMemorySpectrum;

/// Errors that can occur while reading a `.fft` file.
#[derive(Debug, thiserror::Error)]
pub enum FftFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file holds {0} bytes, not a whole number of complex bins")]
    PartialBin(usize),

    #[error("file holds no Fourier bins")]
    Empty,
}

/// A spectrum read from disk, bin 0 unpacked.
#[derive(Clone, Debug, PartialEq)]
pub struct FftData {
    /// Real part of bin 0 (sum of the time series).
    pub dc_level: f32,
    /// Imaginary part of bin 0 (Nyquist amplitude).
    pub nyquist: f32,
    /// All bins, with bin 0 zeroed.
    pub spectrum: InMemorySpectrum,
}

/// Reader for `.fft` files.
#[cfg_attr(feature = "python", pyclass)]
#[derive(Clone, Copy, Debug, Default)]
pub struct FftFileReader;

impl FftFileReader {
    pub fn new() -> Self {
        Self
    }

    /// Read the `.fft` file at `path`.
    pub fn read<P: AsRef<Path>>(&self, path: P) -> Result<FftData, FftFileError> {
        let path = path.as_ref();
        let data = self.read_from(BufReader::new(File::open(path)?))?;
        info!(
            "Read {} Fourier bins from {} (DC level {:.3})",
            data.spectrum.as_slice().len(),
            path.display(),
            data.dc_level
        );
        Ok(data)
    }

    /// Read `.fft` content from any byte source.
    pub fn read_from<R: Read>(&self, mut reader: R) -> Result<FftData, FftFileError> {
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw)?;
        if raw.len() % 8 != 0 {
            return Err(FftFileError::PartialBin(raw.len()));
        }
        if raw.is_empty() {
            return Err(FftFileError::Empty);
        }

        let mut floats = vec![0.0_f32; raw.len() / 4];
        LittleEndian::read_f32_into(&raw, &mut floats);
        let mut amps: Vec<Complex<f32>> = floats
            .chunks_exact(2)
            .map(|c| Complex::new(c[0], c[1]))
            .collect();

        let (dc_level, nyquist) = (amps[0].re, amps[0].im);
        amps[0] = Complex::new(0.0, 0.0);
        Ok(FftData {
            dc_level,
            nyquist,
            spectrum: InMemorySpectrum::new(amps),
        })
    }
}

#[cfg(feature = "python")]
#[pymethods]
impl FftFileReader {
    #[new]
    fn py_new() -> Self {
        Self
    }

    /// Read a `.fft` file and return `(dc_level, re, im)`.
    #[pyo3(name = "read")]
    fn py_read(&self, path: &str) -> PyResult<(f32, Vec<f32>, Vec<f32>)> {
        let data = self
            .read(path)
            .map_err(|e| pyo3::exceptions::PyIOError::new_err(e.to_string()))?;
        let (re, im): (Vec<f32>, Vec<f32>) = data
            .spectrum
            .as_slice()
            .iter()
            .map(|a| (a.re, a.im))
            .unzip();
        Ok((data.dc_level, re, im))
    }

    fn __repr__(&self) -> String {
        "FftFileReader()".to_string()
    }
}
