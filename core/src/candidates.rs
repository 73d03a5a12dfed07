//! Candidate Set Manager: merging raw detections into distinct signals,
//! and writing the survivors out.
//!
//! One physical signal trips many neighbouring cells and harmonic stages.
//! The set keeps its members ordered by Fourier frequency and lets a new
//! detection within `closest_r` bins of existing members either displace
//! them (when more significant) or be absorbed by them.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::types::{compare_accelcand, AccelCand, ACCEL_CLOSEST_R};

/// Radius inside which two detections are treated as one signal.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergePolicy {
    pub closest_r: f64,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            closest_r: ACCEL_CLOSEST_R,
        }
    }
}

/// Candidates ordered by ascending `r`.
#[derive(Clone, Debug, Default)]
pub struct CandidateSet {
    policy: MergePolicy,
    cands: Vec<AccelCand>,
}

impl CandidateSet {
    pub fn new(policy: MergePolicy) -> Self {
        Self {
            policy,
            cands: Vec::new(),
        }
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.cands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cands.is_empty()
    }

    /// Members in ascending `r`.
    pub fn as_slice(&self) -> &[AccelCand] {
        &self.cands
    }

    /// Merge `cand` into the set. Returns `true` if it is now a member.
    ///
    /// Members closer than `closest_r` to `cand` are its rivals. If any
    /// rival is at least as significant, `cand` is absorbed. Otherwise every
    /// rival is dropped and `cand` takes their place, so members always
    /// stay `closest_r` apart.
    pub fn insert_or_merge(&mut self, cand: AccelCand) -> bool {
        let closest = self.policy.closest_r;
        let pos = self.cands.partition_point(|c| c.r < cand.r);
        let near = |c: &AccelCand| (c.r - cand.r).abs() < closest;

        let lo = if pos > 0 && near(&self.cands[pos - 1]) {
            pos - 1
        } else {
            pos
        };
        let hi = match self.cands.get(pos) {
            Some(next) if near(next) => pos + 1,
            _ => pos,
        };

        if self.cands[lo..hi].iter().any(|c| c.sigma >= cand.sigma) {
            return false;
        }
        self.cands.splice(lo..hi, std::iter::once(cand));
        true
    }

    /// Merge every member of `other` into this set, in `other`'s order.
    pub fn absorb(&mut self, other: CandidateSet) {
        for cand in other.cands {
            self.insert_or_merge(cand);
        }
    }

    /// Members ordered by [`compare_accelcand`].
    pub fn into_sorted(mut self) -> Vec<AccelCand> {
        self.cands.sort_by(compare_accelcand);
        self.cands
    }
}

impl Extend<AccelCand> for CandidateSet {
    fn extend<I: IntoIterator<Item = AccelCand>>(&mut self, iter: I) {
        for cand in iter {
            self.insert_or_merge(cand);
        }
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Errors raised while writing candidates.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Destination for retained candidates.
pub trait CandidateSink {
    fn report(&mut self, cand: &AccelCand, t_obs: f64) -> Result<(), SinkError>;
}

/// Plain text, one candidate per line:
/// `power sigma numharm r r/T z`.
pub struct TextSink<W: Write> {
    out: W,
}

impl<W: Write> TextSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> CandidateSink for TextSink<W> {
    fn report(&mut self, cand: &AccelCand, t_obs: f64) -> Result<(), SinkError> {
        writeln!(
            self.out,
            "{:<7.2}  {:<7.4}  {:<2}  {:<14.4}  {:<14.9}  {:<10.4}",
            cand.power,
            cand.sigma,
            cand.numharm,
            cand.r,
            cand.frequency_hz(t_obs),
            cand.z,
        )?;
        Ok(())
    }
}

/// One JSON object per line, with the frequency and f-dot in physical
/// units alongside the candidate fields.
pub struct JsonLinesSink<W: Write> {
    out: W,
}

#[derive(Serialize)]
struct JsonLine<'a> {
    #[serde(flatten)]
    cand: &'a AccelCand,
    freq_hz: f64,
    fdot_hz_per_s: f64,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> CandidateSink for JsonLinesSink<W> {
    fn report(&mut self, cand: &AccelCand, t_obs: f64) -> Result<(), SinkError> {
        let line = JsonLine {
            cand,
            freq_hz: cand.frequency_hz(t_obs),
            fdot_hz_per_s: cand.fdot_hz_per_s(t_obs),
        };
        serde_json::to_writer(&mut self.out, &line)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}

/// Report every candidate to `sink`, in order. Returns the number written.
pub fn report_all<S: CandidateSink + ?Sized>(
    cands: &[AccelCand],
    t_obs: f64,
    sink: &mut S,
) -> Result<usize, SinkError> {
    for cand in cands {
        sink.report(cand, t_obs)?;
    }
    Ok(cands.len())
}
