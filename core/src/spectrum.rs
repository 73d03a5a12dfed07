//! Read access to the complex Fourier amplitudes being searched.

use num_complex::Complex;
use rustfft::FftPlanner;

use crate::error::{try_filled, AccelError};

/// A complex spectrum indexed by Fourier bin.
///
/// Window workers read overlapping ranges concurrently, so implementors must
/// be `Sync` and must not assume reads arrive in any order.
pub trait SpectrumSource: Sync {
    /// Number of bins available.
    fn numbins(&self) -> usize;

    /// `count` consecutive amplitudes starting at bin `lobin`. Bins outside
    /// `[0, numbins)` read as zero.
    fn amplitudes(&self, lobin: i64, count: usize) -> Result<Vec<Complex<f32>>, AccelError>;
}

/// A spectrum held entirely in memory.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InMemorySpectrum {
    amps: Vec<Complex<f32>>,
}

impl InMemorySpectrum {
    pub fn new(amps: Vec<Complex<f32>>) -> Self {
        Self { amps }
    }

    /// Spectrum of a real time series: bins `0..n/2` of its forward FFT.
    pub fn from_time_series(series: &[f32]) -> Result<Self, AccelError> {
        let n = series.len();
        let mut buf = try_filled(n, Complex::new(0.0_f32, 0.0), "time series FFT")?;
        for (dst, &x) in buf.iter_mut().zip(series) {
            dst.re = x;
        }
        if n > 0 {
            FftPlanner::<f32>::new().plan_fft_forward(n).process(&mut buf);
        }
        buf.truncate(n / 2);
        Ok(Self { amps: buf })
    }

    pub fn as_slice(&self) -> &[Complex<f32>] {
        &self.amps
    }

    pub fn into_inner(self) -> Vec<Complex<f32>> {
        self.amps
    }
}

impl SpectrumSource for InMemorySpectrum {
    fn numbins(&self) -> usize {
        self.amps.len()
    }

    fn amplitudes(&self, lobin: i64, count: usize) -> Result<Vec<Complex<f32>>, AccelError> {
        let mut out = try_filled(count, Complex::new(0.0, 0.0), "spectrum read")?;
        let numbins = self.amps.len() as i64;
        let first = lobin.max(0);
        let last = (lobin + count as i64).min(numbins);
        if first < last {
            let dst = (first - lobin) as usize;
            let len = (last - first) as usize;
            out[dst..dst + len].copy_from_slice(&self.amps[first as usize..last as usize]);
        }
        Ok(out)
    }
}
