//! Explicit accumulators threaded through the search instead of global
//! state: one-pass running statistics and a percent-complete tracker.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RunningStats
// ---------------------------------------------------------------------------

/// One-pass minimum, maximum, mean and variance of a stream of values.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    count: u64,
    min: f64,
    max: f64,
    avg: f64,
    /// Sum of squared deviations from the running mean.
    var: f64,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunningStats {
    pub fn new() -> Self {
        Self {
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            avg: 0.0,
            var: 0.0,
        }
    }

    /// Fold one value into the statistics.
    pub fn update(&mut self, x: f64) {
        if x > self.max {
            self.max = x;
        }
        if x < self.min {
            self.min = x;
        }
        let dev = x - self.avg;
        self.avg += dev / (self.count as f64 + 1.0);
        self.var += dev * (x - self.avg);
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.avg)
    }

    /// Population variance of the values seen so far.
    pub fn variance(&self) -> Option<f64> {
        (self.count > 0).then(|| self.var / self.count as f64)
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }
}

impl Extend<f64> for RunningStats {
    fn extend<I: IntoIterator<Item = f64>>(&mut self, iter: I) {
        for x in iter {
            self.update(x);
        }
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Tracks percent complete and reports only when the percentage grows.
#[derive(Clone, Copy, Debug, Default)]
pub struct Progress {
    last: Option<u8>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `current` of `total` units are done. Returns the new
    /// percentage if it is larger than the last one reported.
    pub fn update(&mut self, current: usize, total: usize) -> Option<u8> {
        let pct = if total == 0 {
            100.0
        } else {
            current as f64 / total as f64 * 100.0
        };
        let pct = pct.clamp(0.0, 100.0) as u8;
        match self.last {
            Some(last) if pct <= last => None,
            _ => {
                self.last = Some(pct);
                Some(pct)
            }
        }
    }
}
