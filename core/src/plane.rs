//! Frequency / f-dot power planes.
//!
//! A plane holds the correlation power of one window of the spectrum over a
//! grid of `numrs` Fourier frequencies (step [`ACCEL_DR`]) and `numzs`
//! f-dots (step [`ACCEL_DZ`]). Sub-harmonic planes are built on the grid a
//! harmonic fraction `h/n` maps the fundamental window onto, then summed
//! into the fundamental by nearest-bin remapping.

use log::debug;
use ndarray::Array2;
use num_complex::Complex;

use crate::error::{try_filled, AccelError};
use crate::kernel::SubharmView;
use crate::obs::AccelObs;
use crate::spectrum::SpectrumSource;
use crate::types::{Normalization, ACCEL_DR, ACCEL_DZ, ACCEL_NUMBETWEEN, ACCEL_RDR, ACCEL_RDZ};

/// Interbin frequency a harmonic fraction maps `rfull` onto.
pub fn calc_required_r(harm_fract: f64, rfull: f64) -> f64 {
    (ACCEL_RDR as f64 * rfull * harm_fract + 0.5).floor() * ACCEL_DR
}

/// Grid f-dot a harmonic fraction maps `zfull` onto. Halves round away
/// from zero so the mapping is odd in `zfull`.
pub fn calc_required_z(harm_fract: f64, zfull: f64) -> i32 {
    (ACCEL_RDZ * zfull * harm_fract).round() as i32 * ACCEL_DZ
}

// ---------------------------------------------------------------------------
// FfdotPlane
// ---------------------------------------------------------------------------

/// Powers over an `r × z` grid.
#[derive(Clone, Debug, PartialEq)]
pub struct FfdotPlane {
    /// Fourier frequency (bins) of row 0.
    pub rlo: i64,
    /// f-dot of column 0.
    pub zlo: i32,
    /// Number of r values, spaced [`ACCEL_DR`] apart.
    pub numrs: usize,
    /// Number of f-dot values, spaced [`ACCEL_DZ`] apart.
    pub numzs: usize,
    /// Denominator of the harmonic fraction the plane was built for.
    pub numharm: u32,
    /// Numerator of that fraction.
    pub harmnum: u32,
    /// `powers[[i, j]]` is the power at `r_at(i)`, `z_at(j)`.
    pub powers: Array2<f32>,
}

impl FfdotPlane {
    /// A zero-filled plane.
    pub fn zeros(
        rlo: i64,
        zlo: i32,
        numrs: usize,
        numzs: usize,
        numharm: u32,
        harmnum: u32,
    ) -> Result<Self, AccelError> {
        let cells = try_filled(numrs.saturating_mul(numzs), 0.0_f32, "f-dot plane")?;
        Ok(Self {
            rlo,
            zlo,
            numrs,
            numzs,
            numharm,
            harmnum,
            powers: Array2::from_shape_vec((numrs, numzs), cells)?,
        })
    }

    pub fn r_at(&self, i: usize) -> f64 {
        self.rlo as f64 + i as f64 * ACCEL_DR
    }

    pub fn z_at(&self, j: usize) -> i32 {
        self.zlo + j as i32 * ACCEL_DZ
    }

    /// Grid indices of `(r, z)`, if it is a grid point of this plane.
    pub fn index_of(&self, r: f64, z: i32) -> Option<(usize, usize)> {
        let ri = (r - self.rlo as f64) * ACCEL_RDR as f64;
        let rounded = ri.round();
        if (ri - rounded).abs() > 1e-6 || rounded < 0.0 || rounded >= self.numrs as f64 {
            return None;
        }
        let dz = z - self.zlo;
        if dz < 0 || dz % ACCEL_DZ != 0 {
            return None;
        }
        let zi = (dz / ACCEL_DZ) as usize;
        (zi < self.numzs).then_some((rounded as usize, zi))
    }

    pub fn power(&self, i: usize, j: usize) -> Option<f32> {
        self.powers.get([i, j]).copied()
    }

    /// Largest power with its grid indices.
    pub fn max_power(&self) -> Option<((usize, usize), f32)> {
        self.powers
            .indexed_iter()
            .fold(None, |best, (idx, &p)| match best {
                Some((_, bp)) if bp >= p => best,
                _ => Some((idx, p)),
            })
    }

    /// Independent copy, e.g. to keep the unsummed fundamental.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    fn fraction_matches(&self, numharm: u32, harmnum: u32) -> bool {
        u64::from(self.harmnum) * u64::from(numharm) == u64::from(harmnum) * u64::from(self.numharm)
    }
}

// ---------------------------------------------------------------------------
// Building
// ---------------------------------------------------------------------------

/// Build the power plane of the `harmnum/numharm` sub-harmonic of the
/// fundamental window `[fullrlo, fullrhi]`.
///
/// The amplitudes around the mapped window are read with a margin of the
/// widest kernel's half-width, zapped, normalised, and spread onto the
/// interbin grid. One forward FFT of that block is shared by every kernel;
/// each kernel costs a multiply and an inverse FFT.
pub fn subharm_ffdot_plane<S: SpectrumSource + ?Sized>(
    numharm: u32,
    harmnum: u32,
    fullrlo: f64,
    fullrhi: f64,
    shi: &SubharmView<'_>,
    obs: &AccelObs,
    spectrum: &S,
) -> Result<FfdotPlane, AccelError> {
    let mismatch = |detail: String| AccelError::GridMismatch {
        numharm,
        harmnum,
        detail,
    };
    if numharm == 0
        || u64::from(shi.harmnum()) * u64::from(numharm)
            != u64::from(harmnum) * u64::from(shi.numharm())
    {
        return Err(mismatch(format!(
            "kernels are for {}/{}",
            shi.harmnum(),
            shi.numharm()
        )));
    }

    if !(fullrhi >= fullrlo) {
        return Err(mismatch(format!(
            "window r={fullrlo}..{fullrhi} is empty"
        )));
    }

    let harm_fract = f64::from(harmnum) / f64::from(numharm);
    let drlo = calc_required_r(harm_fract, fullrlo);
    let drhi = calc_required_r(harm_fract, fullrhi);
    let rlo = drlo.floor() as i64;
    let zlo = calc_required_z(harm_fract, f64::from(obs.zlo));
    if zlo != -shi.zmax() {
        return Err(mismatch(format!(
            "plane needs zlo={} but kernels start at {}",
            zlo,
            -shi.zmax()
        )));
    }

    let numrs = if harm_fract == 1.0 {
        ((drhi - drlo) * ACCEL_RDR as f64).round() as usize + 1
    } else {
        let span = (drhi.ceil() - drlo.floor()) as usize * ACCEL_RDR + 1;
        span.div_ceil(ACCEL_RDR) * ACCEL_RDR
    };
    let numzs = shi.numkern();

    let binoffset = shi.max_half_width();
    let lobin = rlo - binoffset as i64;
    let hibin = drhi.ceil() as i64 + binoffset as i64;
    let numdata = (hibin - lobin + 1) as usize;
    let fftlen = shi.fftlen();
    let numgoodbins = shi
        .kernels()
        .iter()
        .map(|k| k.numgoodbins)
        .min()
        .unwrap_or(0);
    if numrs > numgoodbins || ACCEL_NUMBETWEEN * (numdata - 1) + 1 > fftlen {
        return Err(AccelError::WindowTooWide {
            numrs,
            numgoodbins,
            fftlen,
        });
    }

    let mut amps = spectrum.amplitudes(lobin, numdata)?;
    let norm = normalization_factor(&obs.normalization, &amps);
    for (k, amp) in amps.iter_mut().enumerate() {
        if obs.is_zapped((lobin + k as i64) as f64) {
            *amp = Complex::new(0.0, 0.0);
        }
    }

    let zero = Complex::new(0.0_f32, 0.0);
    let mut data = try_filled(fftlen, zero, "correlation data")?;
    for (k, &amp) in amps.iter().enumerate() {
        data[k * ACCEL_NUMBETWEEN] = amp * norm;
    }
    let plans = shi.plans();
    plans.forward.process(&mut data);

    let mut plane = FfdotPlane::zeros(rlo, zlo, numrs, numzs, numharm, harmnum)?;
    let mut work = try_filled(fftlen, zero, "correlation product")?;
    let offset = ACCEL_NUMBETWEEN * binoffset;
    let scale = 1.0 / fftlen as f32;
    for (zi, kern) in shi.kernels().iter().enumerate() {
        for (w, (d, k)) in work.iter_mut().zip(data.iter().zip(&kern.data)) {
            *w = d * k;
        }
        plans.inverse.process(&mut work);
        let mut column = plane.powers.column_mut(zi);
        for (ri, p) in column.iter_mut().enumerate() {
            *p = (work[offset + ri] * scale).norm_sqr();
        }
    }

    debug!(
        "Plane {}/{}: r={}..{:.1} ({} x {}), fftlen={}",
        harmnum, numharm, rlo, drhi, numrs, numzs, fftlen
    );
    Ok(plane)
}

/// Scale applied to a block of amplitudes before correlation.
fn normalization_factor(norm: &Normalization, amps: &[Complex<f32>]) -> f32 {
    match *norm {
        Normalization::None => 1.0,
        Normalization::Photon { nph } if nph > 0.0 => (1.0 / nph.sqrt()) as f32,
        Normalization::Photon { .. } => 1.0,
        Normalization::BlockMedian => {
            let mut powers: Vec<f32> = amps.iter().map(|a| a.norm_sqr()).collect();
            if powers.is_empty() {
                return 1.0;
            }
            let mid = powers.len() / 2;
            let (_, &mut median, _) = powers.select_nth_unstable_by(mid, f32::total_cmp);
            if median > 0.0 {
                (1.0 / (f64::from(median) / std::f64::consts::LN_2).sqrt()) as f32
            } else {
                1.0
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Summing
// ---------------------------------------------------------------------------

/// Add the `harmnum/numharm` sub-harmonic plane into `fundamental`.
///
/// Every fundamental cell `(r, z)` receives the sub-harmonic power at the
/// nearest grid point to `(r*h/n, z*h/n)`. All indices are checked before
/// any cell changes; a sub-harmonic that does not cover the fundamental is
/// an error rather than being clamped.
pub fn add_ffdotpows(
    fundamental: &mut FfdotPlane,
    subharmonic: &FfdotPlane,
    numharm: u32,
    harmnum: u32,
) -> Result<(), AccelError> {
    let mismatch = |detail: String| AccelError::GridMismatch {
        numharm,
        harmnum,
        detail,
    };
    if numharm == 0 || !subharmonic.fraction_matches(numharm, harmnum) {
        return Err(mismatch(format!(
            "plane was built for {}/{}",
            subharmonic.harmnum, subharmonic.numharm
        )));
    }
    let harm_fract = f64::from(harmnum) / f64::from(numharm);

    let mut rinds = Vec::with_capacity(fundamental.numrs);
    for i in 0..fundamental.numrs {
        let rr = calc_required_r(harm_fract, fundamental.r_at(i));
        let idx = ((rr - subharmonic.rlo as f64) * ACCEL_RDR as f64).round();
        if idx < 0.0 || idx >= subharmonic.numrs as f64 {
            return Err(mismatch(format!(
                "r={} maps to {} outside {}..{}",
                fundamental.r_at(i),
                rr,
                subharmonic.rlo,
                subharmonic.r_at(subharmonic.numrs.saturating_sub(1)),
            )));
        }
        rinds.push(idx as usize);
    }

    let mut zinds = Vec::with_capacity(fundamental.numzs);
    for j in 0..fundamental.numzs {
        let zz = calc_required_z(harm_fract, f64::from(fundamental.z_at(j)));
        let dz = zz - subharmonic.zlo;
        let idx = dz / ACCEL_DZ;
        if dz < 0 || idx as usize >= subharmonic.numzs {
            return Err(mismatch(format!(
                "z={} maps to {} outside the sub-harmonic f-dots",
                fundamental.z_at(j),
                zz
            )));
        }
        zinds.push(idx as usize);
    }

    for (mut row, &ri) in fundamental.powers.rows_mut().into_iter().zip(&rinds) {
        let sub_row = subharmonic.powers.row(ri);
        for (p, &zi) in row.iter_mut().zip(&zinds) {
            *p += sub_row[zi];
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelBank;
    use crate::spectrum::InMemorySpectrum;
    use crate::types::{ObservationInfo, SearchConfig};
    use approx::assert_relative_eq;

    const N: f32 = 100.0;

    fn obs(zmax: i32, numharm: u32) -> AccelObs {
        let cfg = SearchConfig {
            zmax,
            numharm,
            uselen: 256,
            normalization: Normalization::None,
            ..SearchConfig::default()
        };
        AccelObs::new(&cfg, &ObservationInfo::new(8192, 1.0e-3), 4096).unwrap()
    }

    fn spike_spectrum(spikes: &[(usize, f32)]) -> InMemorySpectrum {
        let mut amps = vec![Complex::new(0.0, 0.0); 4096];
        for &(bin, amp) in spikes {
            amps[bin] = Complex::new(amp, 0.0);
        }
        InMemorySpectrum::new(amps)
    }

    fn grid(
        rlo: i64,
        numrs: usize,
        numharm: u32,
        harmnum: u32,
        f: impl Fn(usize, usize) -> f32,
    ) -> FfdotPlane {
        let mut plane = FfdotPlane::zeros(rlo, -4, numrs, 5, numharm, harmnum).unwrap();
        for ((i, j), p) in plane.powers.indexed_iter_mut() {
            *p = f(i, j);
        }
        plane
    }

    #[test]
    fn required_r_and_z_follow_the_grid() {
        assert_eq!(calc_required_r(0.5, 1001.0), 500.5);
        assert_eq!(calc_required_r(0.5, 1000.5), 500.5);
        assert_eq!(calc_required_r(1.0, 37.5), 37.5);
        assert_eq!(calc_required_z(0.5, 6.0), 4);
        assert_eq!(calc_required_z(0.5, -6.0), -4);
        assert_eq!(calc_required_z(0.25, 50.0), 12);
        assert_eq!(calc_required_z(0.25, 6.0), 2);
        // 0.5 rounds away from zero
        assert_eq!(calc_required_z(0.25, 4.0), 2);
        assert_eq!(calc_required_z(0.25, -4.0), -2);
    }

    #[test]
    fn grid_coordinates_round_trip() {
        let plane = FfdotPlane::zeros(100, -10, 40, 11, 1, 1).unwrap();
        for i in [0, 7, 39] {
            for j in [0, 5, 10] {
                assert_eq!(plane.index_of(plane.r_at(i), plane.z_at(j)), Some((i, j)));
            }
        }
        assert_eq!(plane.index_of(100.25, 0), None);
        assert_eq!(plane.index_of(100.0, -3), None);
        assert_eq!(plane.index_of(120.0, 0), None);
        assert_eq!(plane.power(40, 0), None);
    }

    #[test]
    fn spike_correlates_to_its_own_power() {
        let obs = obs(0, 1);
        let bank = KernelBank::build(1, 0, 256).unwrap();
        let shi = bank.subharm(1, 1).unwrap();
        let spectrum = spike_spectrum(&[(1000, N)]);

        let plane = subharm_ffdot_plane(1, 1, 950.0, 1077.5, &shi, &obs, &spectrum).unwrap();
        assert_eq!((plane.numrs, plane.numzs), (256, 1));
        assert_eq!(plane.rlo, 950);

        let (i, _) = plane.index_of(1000.0, 0).unwrap();
        assert_relative_eq!(plane.powers[[i, 0]], N * N, max_relative = 1e-3);
        let half = (2.0 / std::f32::consts::PI).powi(2) * N * N;
        assert_relative_eq!(plane.powers[[i + 1, 0]], half, max_relative = 1e-2);
        assert!(plane.powers[[i + 2, 0]] < 1e-2 * N * N);

        let ((bi, _), best) = plane.max_power().unwrap();
        assert_eq!(bi, i);
        assert_relative_eq!(best, N * N, max_relative = 1e-3);
    }

    #[test]
    fn chirp_peaks_at_its_fdot() {
        let n = 4096;
        let (r0, z0) = (1000.0, 10.0);
        let series: Vec<f32> = (0..n)
            .map(|k| {
                let t = k as f64 / n as f64;
                let phase = (r0 - z0 / 2.0) * t + z0 * t * t / 2.0;
                (2.0 * std::f64::consts::PI * phase).cos() as f32
            })
            .collect();
        let spectrum = InMemorySpectrum::from_time_series(&series).unwrap();
        let obs = AccelObs::new(
            &SearchConfig {
                zmax: 20,
                numharm: 1,
                uselen: 256,
                normalization: Normalization::None,
                ..SearchConfig::default()
            },
            &ObservationInfo::new(n as u64, 1.0e-3),
            spectrum.as_slice().len(),
        )
        .unwrap();
        let bank = KernelBank::build(1, 20, 256).unwrap();
        let shi = bank.subharm(1, 1).unwrap();

        let plane = subharm_ffdot_plane(1, 1, 950.0, 1077.5, &shi, &obs, &spectrum).unwrap();
        let ((i, j), _) = plane.max_power().unwrap();
        assert_eq!(plane.z_at(j), 10);
        assert!((plane.r_at(i) - r0).abs() <= 0.5);
    }

    #[test]
    fn zapped_bins_contribute_nothing() {
        let cfg = SearchConfig {
            zmax: 0,
            numharm: 1,
            uselen: 256,
            normalization: Normalization::None,
            zap_ranges: vec![(999.5, 1000.5)],
            ..SearchConfig::default()
        };
        let obs = AccelObs::new(&cfg, &ObservationInfo::new(8192, 1.0e-3), 4096).unwrap();
        let bank = KernelBank::build(1, 0, 256).unwrap();
        let shi = bank.subharm(1, 1).unwrap();
        let spectrum = spike_spectrum(&[(1000, N)]);

        let plane = subharm_ffdot_plane(1, 1, 950.0, 1077.5, &shi, &obs, &spectrum).unwrap();
        assert!(plane.powers.iter().all(|&p| p < 1e-6));
    }

    #[test]
    fn block_median_normalises_noise_level() {
        let amps = vec![Complex::new(2.0_f32, 0.0); 11];
        let norm = normalization_factor(&Normalization::BlockMedian, &amps);
        let p = (amps[0] * norm).norm_sqr();
        assert_relative_eq!(p, std::f32::consts::LN_2, max_relative = 1e-5);

        let zeros = vec![Complex::new(0.0_f32, 0.0); 11];
        assert_eq!(normalization_factor(&Normalization::BlockMedian, &zeros), 1.0);
        assert_eq!(
            normalization_factor(&Normalization::Photon { nph: 16.0 }, &amps),
            0.25
        );
    }

    #[test]
    fn two_harmonic_sum_adds_the_half_frequency_power() {
        let obs = obs(0, 2);
        let bank = KernelBank::build(2, 0, 256).unwrap();
        let spectrum = spike_spectrum(&[(1000, N), (500, N / 2.0)]);
        let (lo, hi) = (950.0, 1077.5);

        let fund_kernels = bank.subharm(1, 1).unwrap();
        let mut fund = subharm_ffdot_plane(1, 1, lo, hi, &fund_kernels, &obs, &spectrum).unwrap();
        let half_kernels = bank.subharm(2, 1).unwrap();
        let half = subharm_ffdot_plane(2, 1, lo, hi, &half_kernels, &obs, &spectrum).unwrap();
        assert_eq!(half.numrs % ACCEL_RDR, 0);

        add_ffdotpows(&mut fund, &half, 2, 1).unwrap();
        let (i, j) = fund.index_of(1000.0, 0).unwrap();
        assert_relative_eq!(fund.powers[[i, j]], 1.25 * N * N, max_relative = 1e-3);
    }

    #[test]
    fn harmonic_sums_commute() {
        let base = grid(1000, 64, 1, 1, |i, j| (i * 5 + j) as f32);
        let quarter = grid(248, 24, 4, 1, |i, j| (i + 3 * j) as f32 * 0.5);
        let three = grid(748, 56, 4, 3, |i, j| (2 * i + j) as f32 * 0.25);

        let mut a = base.clone();
        add_ffdotpows(&mut a, &quarter, 4, 1).unwrap();
        add_ffdotpows(&mut a, &three, 4, 3).unwrap();
        let mut b = base.copy();
        add_ffdotpows(&mut b, &three, 4, 3).unwrap();
        add_ffdotpows(&mut b, &quarter, 4, 1).unwrap();

        for (x, y) in a.powers.iter().zip(b.powers.iter()) {
            assert_relative_eq!(*x, *y, max_relative = 1e-6);
        }
        assert_ne!(a, base);
    }

    #[test]
    fn mismatched_grids_leave_the_fundamental_untouched() {
        let base = grid(1000, 64, 1, 1, |i, _| i as f32);
        let quarter = grid(248, 24, 4, 1, |_, _| 1.0);

        let mut fund = base.clone();
        let err = add_ffdotpows(&mut fund, &quarter, 2, 1).unwrap_err();
        assert!(matches!(err, AccelError::GridMismatch { numharm: 2, harmnum: 1, .. }));
        assert_eq!(fund, base);

        let short = grid(248, 8, 4, 1, |_, _| 1.0);
        let err = add_ffdotpows(&mut fund, &short, 4, 1).unwrap_err();
        assert!(matches!(err, AccelError::GridMismatch { .. }));
        assert_eq!(fund, base);

        let narrow = {
            let mut p = FfdotPlane::zeros(248, 0, 24, 1, 4, 1).unwrap();
            p.powers.fill(1.0);
            p
        };
        assert!(add_ffdotpows(&mut fund, &narrow, 4, 1).is_err());
        assert_eq!(fund, base);
    }

    #[test]
    fn oversized_window_is_rejected() {
        let obs = obs(0, 1);
        let bank = KernelBank::build(1, 0, 256).unwrap();
        let shi = bank.subharm(1, 1).unwrap();
        let spectrum = spike_spectrum(&[]);
        let err = subharm_ffdot_plane(1, 1, 100.0, 400.0, &shi, &obs, &spectrum).unwrap_err();
        assert!(matches!(err, AccelError::WindowTooWide { .. }));
    }

    #[test]
    fn reversed_window_is_rejected() {
        let obs = obs(0, 1);
        let bank = KernelBank::build(1, 0, 256).unwrap();
        let shi = bank.subharm(1, 1).unwrap();
        let spectrum = spike_spectrum(&[]);
        for (lo, hi) in [(1077.5, 950.0), (1000.0, 900.0), (f64::NAN, 1000.0)] {
            let err = subharm_ffdot_plane(1, 1, lo, hi, &shi, &obs, &spectrum).unwrap_err();
            assert!(matches!(err, AccelError::GridMismatch { .. }));
        }
    }

    #[test]
    fn wrong_kernels_for_fraction_is_a_mismatch() {
        let obs = obs(0, 2);
        let bank = KernelBank::build(2, 0, 256).unwrap();
        let shi = bank.subharm(1, 1).unwrap();
        let spectrum = spike_spectrum(&[]);
        let err = subharm_ffdot_plane(2, 1, 950.0, 1077.5, &shi, &obs, &spectrum).unwrap_err();
        assert!(matches!(err, AccelError::GridMismatch { .. }));
    }
}
