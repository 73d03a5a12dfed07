//! Kernel bank: Fourier-domain matched filters for accelerated signals.
//!
//! A sinusoid whose frequency drifts linearly by `z` bins over the
//! observation spreads its power across roughly `|z|` neighbouring Fourier
//! bins.  Correlating the complex spectrum with the expected response of
//! such a chirp recovers the full power at the correct `(r, z)`.  The
//! response depends only on the offset from the trial frequency, so one
//! kernel per f-dot serves every frequency: it is sampled at interbin
//! spacing, wrapped into a short FFT buffer, transformed once and cached.
//!
//! The bank holds one [`SubharmInfo`] per harmonic fraction `h/numharm`.
//! Kernels of every fraction live in a single arena, addressed by the
//! fraction's offset plus the f-dot step, so `kernel_for_z` is a constant
//! time lookup.

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

use log::{debug, info};
use num_complex::{Complex, Complex64};
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};

use crate::error::{try_filled, AccelError};
use crate::obs::ConfigError;
use crate::plane::calc_required_z;
use crate::types::{ACCEL_DZ, ACCEL_NUMBETWEEN, NUMFINTBINS};

type C32 = Complex<f32>;

// ---------------------------------------------------------------------------
// Chirp response
// ---------------------------------------------------------------------------

/// Fresnel integrals `(C(x), S(x))` with `C(x) = ∫₀ˣ cos(πt²/2) dt` and
/// `S(x) = ∫₀ˣ sin(πt²/2) dt`.
///
/// Power series below `|x| = 2`, modified Lentz continued fraction above.
pub fn fresnel(x: f64) -> (f64, f64) {
    const EPS: f64 = 1e-13;
    const MAXIT: usize = 500;
    const FPMIN: f64 = 1e-300;
    const XMIN: f64 = 2.0;

    let ax = x.abs();
    let (c, s) = if ax < FPMIN.sqrt() {
        (ax, 0.0)
    } else if ax <= XMIN {
        let fact = 0.5 * PI * ax * ax;
        let mut sum = 0.0;
        let mut sums = 0.0;
        let mut sumc = ax;
        let mut sign = 1.0;
        let mut odd = true;
        let mut term = ax;
        let mut n = 3.0;
        for k in 1..=MAXIT {
            term *= fact / k as f64;
            sum += sign * term / n;
            let test = sum.abs() * EPS;
            if odd {
                sign = -sign;
                sums = sum;
                sum = sumc;
            } else {
                sumc = sum;
                sum = sums;
            }
            if term < test {
                break;
            }
            odd = !odd;
            n += 2.0;
        }
        (sumc, sums)
    } else {
        let one = Complex64::new(1.0, 0.0);
        let pix2 = PI * ax * ax;
        let mut b = Complex64::new(1.0, -pix2);
        let mut cc = Complex64::new(1.0 / FPMIN, 0.0);
        let mut d = one / b;
        let mut h = d;
        let mut n = -1.0;
        for _ in 2..=MAXIT {
            n += 2.0;
            let a = -n * (n + 1.0);
            b += Complex64::new(4.0, 0.0);
            d = one / (d * a + b);
            cc = b + Complex64::new(a, 0.0) / cc;
            let del = cc * d;
            h *= del;
            if (del.re - 1.0).abs() + del.im.abs() < EPS {
                break;
            }
        }
        h *= Complex64::new(ax, -ax);
        let cs = Complex64::new(0.5, 0.5)
            * (one - Complex64::new((0.5 * pix2).cos(), (0.5 * pix2).sin()) * h);
        (cs.re, cs.im)
    };
    if x < 0.0 {
        (-c, -s)
    } else {
        (c, s)
    }
}

/// Complex Fourier response, `q` bins away from the trial frequency, of a
/// unit chirp whose average Fourier frequency is the trial frequency and
/// whose f-dot is `z`:
/// `∫₀¹ exp(2πi((q - z/2)t + z t²/2)) dt`.
pub fn z_response(q: f64, z: f64) -> Complex64 {
    if z.abs() < 1e-4 {
        if q.abs() < 1e-12 {
            return Complex64::new(1.0, 0.0);
        }
        let x = PI * q;
        return Complex64::from_polar(x.sin() / x, x);
    }
    chirp_integral(q - 0.5 * z, z)
}

/// `∫₀¹ exp(2πi(s t + z t²/2)) dt` for `z != 0`, via Fresnel integrals.
fn chirp_integral(s: f64, z: f64) -> Complex64 {
    if z < 0.0 {
        return chirp_integral(-s, -z).conj();
    }
    let scale = (2.0 / z).sqrt();
    let (c0, s0) = fresnel(s * scale);
    let (c1, s1) = fresnel((s + z) * scale);
    let phase = Complex64::from_polar(1.0, -PI * s * s / z);
    phase * Complex64::new(c1 - c0, s1 - s0) / (2.0 * z).sqrt()
}

/// Half-width in bins of the part of a `z` response worth correlating.
pub fn z_resp_halfwidth(z: f64) -> usize {
    let z = z.abs();
    let mut m = (z * (0.00089 * z + 0.3131)) as usize + NUMFINTBINS;
    if z > 100.0 && m as f64 > 0.6 * z {
        m = (0.6 * z) as usize;
    }
    m.max(NUMFINTBINS)
}

/// FFT length needed to correlate one window of the `harmnum/numharm`
/// sub-harmonic when the fundamental searches up to `zmax` and produces
/// `uselen` interbin points.
pub fn calc_fftlen(numharm: u32, harmnum: u32, zmax: i32, uselen: usize) -> usize {
    let harm_fract = f64::from(harmnum) / f64::from(numharm);
    let bins_needed = uselen * harmnum as usize / numharm as usize + 8;
    let zmax_h = calc_required_z(harm_fract, f64::from(zmax));
    let end_effects = 2 * ACCEL_NUMBETWEEN * z_resp_halfwidth(f64::from(zmax_h));
    (bins_needed + end_effects).next_power_of_two()
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// One f-dot's correlation filter, already in the Fourier domain.
#[derive(Clone)]
pub struct Kernel {
    /// Fourier f-dot of the kernel.
    pub z: i32,
    /// Number of complex points in `data`.
    pub fftlen: usize,
    /// Correlation outputs not contaminated by wrap-around.
    pub numgoodbins: usize,
    /// Interbin oversampling of the response.
    pub numbetween: usize,
    /// Half-width in bins of the time-domain response.
    pub kern_half_width: usize,
    /// FFT of the conjugated, wrap-placed response.
    pub data: Vec<C32>,
}

impl Kernel {
    /// Sample, wrap and transform the response for `z`. `forward` must be
    /// a forward plan of length `fftlen`.
    pub fn build(z: i32, fftlen: usize, forward: &dyn Fft<f32>) -> Result<Self, AccelError> {
        let kern_half_width = z_resp_halfwidth(f64::from(z));
        let half = ACCEL_NUMBETWEEN * kern_half_width;
        if 2 * half + 1 > fftlen {
            return Err(AccelError::KernelTooWide {
                z,
                needed: 2 * half + 1,
                fftlen,
            });
        }

        let mut data = try_filled(fftlen, C32::new(0.0, 0.0), "kernel data")?;
        let span = half as i64;
        for m in -span..=span {
            let q = m as f64 / ACCEL_NUMBETWEEN as f64;
            let resp = z_response(q, f64::from(z)).conj();
            let idx = m.rem_euclid(fftlen as i64) as usize;
            data[idx] = C32::new(resp.re as f32, resp.im as f32);
        }
        forward.process(&mut data);

        Ok(Self {
            z,
            fftlen,
            numgoodbins: fftlen - 2 * half,
            numbetween: ACCEL_NUMBETWEEN,
            kern_half_width,
            data,
        })
    }

    /// Correlation samples discarded at each end of the output.
    pub fn edge_samples(&self) -> usize {
        self.numbetween * self.kern_half_width
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("z", &self.z)
            .field("fftlen", &self.fftlen)
            .field("numgoodbins", &self.numgoodbins)
            .field("kern_half_width", &self.kern_half_width)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Sub-harmonic bookkeeping
// ---------------------------------------------------------------------------

/// Forward and inverse plans of one FFT length.
#[derive(Clone)]
pub struct FftPair {
    pub forward: Arc<dyn Fft<f32>>,
    pub inverse: Arc<dyn Fft<f32>>,
}

/// Where the kernels of one harmonic fraction live in the bank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubharmInfo {
    /// Denominator of the harmonic fraction.
    pub numharm: u32,
    /// Numerator of the harmonic fraction.
    pub harmnum: u32,
    /// Largest |z| searched at this fraction.
    pub zmax: i32,
    /// Number of kernels, `2*zmax/ACCEL_DZ + 1`.
    pub numkern: usize,
    /// FFT length shared by all kernels of the fraction.
    pub fftlen: usize,
    first: usize,
}

/// Borrowed view of one fraction's kernels, ready for correlation.
#[derive(Clone, Copy)]
pub struct SubharmView<'a> {
    info: &'a SubharmInfo,
    kernels: &'a [Kernel],
    plans: &'a FftPair,
}

impl<'a> SubharmView<'a> {
    /// Layout of the fraction within the bank.
    pub fn info(&self) -> &'a SubharmInfo {
        self.info
    }

    /// Denominator of the fraction, as built in the bank.
    pub fn numharm(&self) -> u32 {
        self.info.numharm
    }

    /// Numerator of the fraction, as built in the bank.
    pub fn harmnum(&self) -> u32 {
        self.info.harmnum
    }

    /// Largest |f-dot| covered at this fraction.
    pub fn zmax(&self) -> i32 {
        self.info.zmax
    }

    /// Number of kernels, one per f-dot step.
    pub fn numkern(&self) -> usize {
        self.info.numkern
    }

    /// Correlation length shared by every kernel of the fraction.
    pub fn fftlen(&self) -> usize {
        self.info.fftlen
    }

    /// Kernels in ascending `z`.
    pub fn kernels(&self) -> &'a [Kernel] {
        self.kernels
    }

    /// Kernel for f-dot `z`, if `z` lies on this fraction's grid.
    pub fn kernel_for_z(&self, z: i32) -> Option<&'a Kernel> {
        let offset = z + self.info.zmax;
        if offset < 0 || offset % ACCEL_DZ != 0 {
            return None;
        }
        self.kernels.get((offset / ACCEL_DZ) as usize)
    }

    /// Widest kernel half-width of the fraction; sets the data margin of
    /// every correlation.
    pub fn max_half_width(&self) -> usize {
        self.kernels
            .iter()
            .map(|k| k.kern_half_width)
            .max()
            .unwrap_or(NUMFINTBINS)
    }

    /// Forward and inverse transforms of length [`Self::fftlen`].
    pub fn plans(&self) -> &'a FftPair {
        self.plans
    }
}

impl fmt::Debug for SubharmView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubharmView").field("info", self.info).finish()
    }
}

// ---------------------------------------------------------------------------
// KernelBank
// ---------------------------------------------------------------------------

/// All kernels of a search, built once and shared read-only.
pub struct KernelBank {
    numharm: u32,
    zmax: i32,
    uselen: usize,
    infos: Vec<SubharmInfo>,
    kernels: Vec<Kernel>,
    plans: BTreeMap<usize, FftPair>,
}

impl KernelBank {
    /// Build the kernels of every fraction `h/numharm`, `h = 1..=numharm`,
    /// each spanning `-zmax_h..=zmax_h` in steps of [`ACCEL_DZ`] where
    /// `zmax_h` is `zmax * h / numharm` rounded to an even value.
    pub fn build(numharm: u32, zmax: i32, uselen: usize) -> Result<Self, AccelError> {
        if numharm == 0 {
            return Err(ConfigError::BadNumHarm(numharm).into());
        }
        if zmax < 0 {
            return Err(ConfigError::NegativeZmax(zmax).into());
        }

        let mut planner = FftPlanner::<f32>::new();
        let mut plans = BTreeMap::new();
        let mut infos = Vec::with_capacity(numharm as usize);
        let mut jobs: Vec<(u32, i32, usize)> = Vec::new();

        for harmnum in 1..=numharm {
            let harm_fract = f64::from(harmnum) / f64::from(numharm);
            let zmax_h = calc_required_z(harm_fract, f64::from(zmax));
            let fftlen = calc_fftlen(numharm, harmnum, zmax, uselen);
            plans.entry(fftlen).or_insert_with(|| FftPair {
                forward: planner.plan_fft_forward(fftlen),
                inverse: planner.plan_fft_inverse(fftlen),
            });
            let numkern = (2 * zmax_h / ACCEL_DZ + 1) as usize;
            infos.push(SubharmInfo {
                numharm,
                harmnum,
                zmax: zmax_h,
                numkern,
                fftlen,
                first: jobs.len(),
            });
            jobs.extend((0..numkern).map(|k| (harmnum, -zmax_h + k as i32 * ACCEL_DZ, fftlen)));
            debug!(
                "Sub-harmonic {}/{}: zmax={}, {} kernels of {} points",
                harmnum, numharm, zmax_h, numkern, fftlen
            );
        }

        let kernels = jobs
            .par_iter()
            .map(|&(harmnum, z, fftlen)| {
                let plan = plans.get(&fftlen).ok_or(AccelError::MissingSubharmonic {
                    numharm,
                    harmnum,
                    bank_numharm: numharm,
                })?;
                Kernel::build(z, fftlen, plan.forward.as_ref())
            })
            .collect::<Result<Vec<_>, _>>()?;

        let bytes: usize = kernels
            .iter()
            .map(|k| k.data.len() * std::mem::size_of::<C32>())
            .sum();
        info!(
            "Built kernel bank: {} kernels for {} harmonic fraction(s), {:.1} MB",
            kernels.len(),
            numharm,
            bytes as f64 / 1.0e6
        );

        Ok(Self {
            numharm,
            zmax,
            uselen,
            infos,
            kernels,
            plans,
        })
    }

    /// Denominator the bank was built for.
    pub fn numharm(&self) -> u32 {
        self.numharm
    }

    /// Fundamental zmax the bank was built for.
    pub fn zmax(&self) -> i32 {
        self.zmax
    }

    pub fn uselen(&self) -> usize {
        self.uselen
    }

    pub fn infos(&self) -> &[SubharmInfo] {
        &self.infos
    }

    /// Total number of kernels across all fractions.
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Kernels of the fraction `harmnum/numharm`. `numharm` may be any
    /// divisor of the bank's own `numharm`.
    pub fn subharm(&self, numharm: u32, harmnum: u32) -> Result<SubharmView<'_>, AccelError> {
        let missing = AccelError::MissingSubharmonic {
            numharm,
            harmnum,
            bank_numharm: self.numharm,
        };
        if numharm == 0 || harmnum == 0 || harmnum > numharm || self.numharm % numharm != 0 {
            return Err(missing);
        }
        let h = harmnum * (self.numharm / numharm);
        let info = match self.infos.get(h as usize - 1) {
            Some(info) => info,
            None => return Err(missing),
        };
        let plans = match self.plans.get(&info.fftlen) {
            Some(plans) => plans,
            None => return Err(missing),
        };
        Ok(SubharmView {
            info,
            kernels: &self.kernels[info.first..info.first + info.numkern],
            plans,
        })
    }
}

impl fmt::Debug for KernelBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelBank")
            .field("numharm", &self.numharm)
            .field("zmax", &self.zmax)
            .field("uselen", &self.uselen)
            .field("infos", &self.infos)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Composite Simpson estimate of the chirp response.
    fn simpson_response(q: f64, z: f64) -> Complex64 {
        let n = 20_000;
        let h = 1.0 / n as f64;
        let f = |t: f64| {
            Complex64::from_polar(1.0, 2.0 * PI * ((q - 0.5 * z) * t + 0.5 * z * t * t))
        };
        let mut acc = f(0.0) + f(1.0);
        for i in 1..n {
            let w = if i % 2 == 1 { 4.0 } else { 2.0 };
            acc += f(i as f64 * h) * w;
        }
        acc * (h / 3.0)
    }

    #[test]
    fn fresnel_reference_values() {
        let (c, s) = fresnel(1.0);
        assert_relative_eq!(c, 0.779_893_400_376_822_8, epsilon = 1e-10);
        assert_relative_eq!(s, 0.438_259_147_390_354_8, epsilon = 1e-10);

        let (c, s) = fresnel(2.0);
        assert_relative_eq!(c, 0.488_253_406_075_340_8, epsilon = 1e-10);
        assert_relative_eq!(s, 0.343_415_678_363_698_2, epsilon = 1e-10);

        let (c, s) = fresnel(-1.0);
        assert_relative_eq!(c, -0.779_893_400_376_822_8, epsilon = 1e-10);
        assert_relative_eq!(s, -0.438_259_147_390_354_8, epsilon = 1e-10);
    }

    #[test]
    fn fresnel_branches_agree_at_the_switch() {
        let (c_lo, s_lo) = fresnel(2.0 - 1e-9);
        let (c_hi, s_hi) = fresnel(2.0 + 1e-9);
        assert_relative_eq!(c_lo, c_hi, epsilon = 1e-8);
        assert_relative_eq!(s_lo, s_hi, epsilon = 1e-8);

        let (c, s) = fresnel(1.0e4);
        assert_relative_eq!(c, 0.5, epsilon = 1e-4);
        assert_relative_eq!(s, 0.5, epsilon = 1e-4);
    }

    #[test]
    fn zero_fdot_response_is_a_phased_sinc() {
        assert_relative_eq!(z_response(0.0, 0.0).norm(), 1.0, epsilon = 1e-12);
        assert!(z_response(1.0, 0.0).norm() < 1e-12);
        assert_relative_eq!(z_response(0.5, 0.0).norm(), 2.0 / PI, epsilon = 1e-12);
    }

    #[test]
    fn chirp_response_matches_quadrature() {
        for &(q, z) in &[(0.25, 2.0), (1.3, 6.0), (-2.7, -10.0), (4.0, 30.0)] {
            let exact = z_response(q, z);
            let numeric = simpson_response(q, z);
            assert_relative_eq!(exact.re, numeric.re, epsilon = 1e-6);
            assert_relative_eq!(exact.im, numeric.im, epsilon = 1e-6);
        }
    }

    #[test]
    fn response_energy_sums_to_one() {
        let energy: f64 = (-400..=400)
            .map(|k| z_response(0.3 - f64::from(k), 8.0).norm_sqr())
            .sum();
        assert_relative_eq!(energy, 1.0, epsilon = 1e-2);
    }

    #[test]
    fn halfwidth_follows_fdot() {
        assert_eq!(z_resp_halfwidth(0.0), 16);
        assert_eq!(z_resp_halfwidth(10.0), 19);
        assert_eq!(z_resp_halfwidth(-10.0), 19);
        assert_eq!(z_resp_halfwidth(200.0), 114);
        assert_eq!(z_resp_halfwidth(1000.0), 600);
    }

    #[test]
    fn subharmonic_zmax_rounds_to_even() {
        let bank = KernelBank::build(4, 50, 64).unwrap();
        let zmaxes: Vec<i32> = bank.infos().iter().map(|i| i.zmax).collect();
        assert_eq!(zmaxes, vec![12, 26, 38, 50]);
    }

    #[test]
    fn kernel_counts_and_order() {
        let bank = KernelBank::build(2, 20, 64).unwrap();
        for info in bank.infos() {
            let view = bank.subharm(info.numharm, info.harmnum).unwrap();
            assert_eq!(view.numkern(), (2 * view.zmax() / ACCEL_DZ + 1) as usize);
            assert_eq!(view.kernels().len(), view.numkern());
            assert!(view.kernels().windows(2).all(|w| w[1].z > w[0].z));
            for kern in view.kernels() {
                assert_eq!(kern.data.len(), kern.fftlen);
                assert!(kern.numgoodbins <= kern.fftlen);
                assert_eq!(kern.numgoodbins, kern.fftlen - 2 * kern.edge_samples());
                assert_eq!(view.kernel_for_z(kern.z).unwrap().z, kern.z);
            }
        }
        assert_eq!(bank.len(), 11 + 21);
    }

    #[test]
    fn mirrored_fdots_are_conjugate_kernels() {
        let bank = KernelBank::build(1, 12, 64).unwrap();
        let view = bank.subharm(1, 1).unwrap();
        for z in (2..=12).step_by(2) {
            let pos = view.kernel_for_z(z).unwrap();
            let neg = view.kernel_for_z(-z).unwrap();
            assert_eq!(pos.kern_half_width, neg.kern_half_width);
            assert_eq!(pos.numgoodbins, neg.numgoodbins);
            for (a, b) in pos.data.iter().zip(&neg.data) {
                assert_relative_eq!(a.re, b.re, epsilon = 1e-4);
                assert_relative_eq!(a.im, -b.im, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn fractions_are_reduced_against_the_bank() {
        let bank = KernelBank::build(4, 8, 64).unwrap();
        let half = bank.subharm(2, 1).unwrap();
        assert_eq!((half.numharm(), half.harmnum()), (4, 2));
        let full = bank.subharm(1, 1).unwrap();
        assert_eq!(full.harmnum(), 4);
        assert!(matches!(
            bank.subharm(8, 1),
            Err(AccelError::MissingSubharmonic { .. })
        ));
        assert!(matches!(
            bank.subharm(3, 1),
            Err(AccelError::MissingSubharmonic { .. })
        ));
        assert!(view_missing_for_zero(&bank));
    }

    fn view_missing_for_zero(bank: &KernelBank) -> bool {
        bank.subharm(4, 0).is_err() && bank.subharm(4, 5).is_err()
    }

    #[test]
    fn impossible_fft_length_is_reported() {
        let mut planner = FftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(32);
        let err = Kernel::build(0, 32, plan.as_ref()).unwrap_err();
        assert!(matches!(err, AccelError::KernelTooWide { needed: 65, .. }));
    }
}
