//! Noise covariance estimation for the matched filter bank.
//!
//! The filter bank whitens its templates with the inverse of the noise
//! covariance of a `tf`-sample, `nc`-channel window. Estimators learn the
//! second-order statistics of the background noise from designated noise
//! epochs and hand out covariance, inverse and whitening matrices sized for
//! the concatenated (channel-major) waveform vector.

use alloc::vec;
use alloc::vec::Vec;

use crate::epochs::Epoch;
use crate::error::{BotmError, Result};
use crate::linalg::Matrix;
use crate::trace::TraceView;

/// Source of noise covariance matrices for concatenated waveforms.
///
/// Matrices are `(tf·nc) × (tf·nc)` with index `c * tf + k` for sample `k`
/// of channel `c`.
pub trait CovarianceEstimator {
    /// Number of channels the estimator was built for.
    fn channels(&self) -> usize;

    /// Largest window length (in samples) a matrix can be built for.
    fn max_lag(&self) -> usize;

    /// Accumulates statistics from the samples inside `epochs`.
    ///
    /// Epochs are clipped to the data; empty input is a no-op.
    fn update(&mut self, data: TraceView<'_>, epochs: &[Epoch]) -> Result<()>;

    /// Covariance matrix for a window of `tf` samples.
    fn covariance(&self, tf: usize) -> Result<Matrix>;

    /// Inverse covariance for a window of `tf` samples.
    fn inverse(&self, tf: usize) -> Result<Matrix> {
        Ok(self.covariance(tf)?.inverse_spd()?)
    }

    /// Whitening operator `L⁻¹` with `C = L·Lᵀ`.
    fn whitening(&self, tf: usize) -> Result<Matrix> {
        Ok(self.covariance(tf)?.cholesky()?.lower_inverse()?)
    }
}

/// Block-Toeplitz covariance estimator from lagged cross-products.
///
/// For every lag `l < max_lag` and channel pair `(c1, c2)` it accumulates
/// `Σ x[t, c1] · x[t + l, c2]` over samples where both `t` and `t + l` lie in
/// the same noise epoch. Every lag is divided by the number of noise samples
/// (the biased estimate), which keeps the block-Toeplitz matrix positive
/// semi-definite however the epochs are fragmented. Until any data has been
/// seen the estimator reports the identity matrix.
///
/// An update that would leave the matrix non-invertible (non-finite input)
/// is rolled back and reported as an error.
///
/// # Example
///
/// ```
/// use botm::covariance::{CovarianceEstimator, TimeSeriesCovariance};
///
/// let ce = TimeSeriesCovariance::new(2, 8).unwrap();
/// let c = ce.covariance(4).unwrap();
/// assert_eq!(c.dim(), 8);
/// assert_eq!(c.get(3, 3), 1.0);
/// ```
#[derive(Debug, Clone)]
pub struct TimeSeriesCovariance {
    channels: usize,
    max_lag: usize,
    /// `[lag][c1][c2]` cross-product sums
    sums: Vec<f64>,
    /// Number of sample pairs per lag
    counts: Vec<u64>,
    loading: f64,
}

impl TimeSeriesCovariance {
    /// Relative diagonal loading applied to every built matrix.
    pub const DEFAULT_LOADING: f64 = 1e-6;

    /// Creates an estimator for `channels` channels and windows of up to
    /// `max_lag` samples.
    pub fn new(channels: usize, max_lag: usize) -> Result<Self> {
        if channels == 0 || max_lag == 0 {
            return Err(BotmError::config(
                "covariance estimator needs at least one channel and one lag",
            ));
        }
        Ok(Self {
            channels,
            max_lag,
            sums: vec![0.0; max_lag * channels * channels],
            counts: vec![0; max_lag],
            loading: Self::DEFAULT_LOADING,
        })
    }

    /// Sets the relative diagonal loading (fraction of the mean diagonal).
    pub fn with_loading(mut self, loading: f64) -> Self {
        self.loading = loading.max(0.0);
        self
    }

    /// Returns true once any noise sample has been accumulated.
    pub fn is_initialized(&self) -> bool {
        self.counts[0] > 0
    }

    /// Forgets all accumulated statistics.
    pub fn reset(&mut self) {
        self.sums.iter_mut().for_each(|s| *s = 0.0);
        self.counts.iter_mut().for_each(|c| *c = 0);
    }

    #[inline]
    fn index(&self, lag: usize, c1: usize, c2: usize) -> usize {
        (lag * self.channels + c1) * self.channels + c2
    }

    /// Estimated `E[x[t, c1] · x[t + lag, c2]]` over all noise samples.
    fn lagged(&self, lag: isize, c1: usize, c2: usize) -> f64 {
        let (lag, c1, c2) = if lag >= 0 {
            (lag as usize, c1, c2)
        } else {
            ((-lag) as usize, c2, c1)
        };
        if lag >= self.max_lag || self.counts[0] == 0 {
            return 0.0;
        }
        self.sums[self.index(lag, c1, c2)] / self.counts[0] as f64
    }
}

impl CovarianceEstimator for TimeSeriesCovariance {
    fn channels(&self) -> usize {
        self.channels
    }

    fn max_lag(&self) -> usize {
        self.max_lag
    }

    fn update(&mut self, data: TraceView<'_>, epochs: &[Epoch]) -> Result<()> {
        if data.channels() != self.channels {
            return Err(BotmError::DimensionMismatch {
                expected: self.channels,
                got: data.channels(),
            });
        }
        let ns = data.len();
        let nc = self.channels;
        let mut seen = 0usize;
        let snapshot = (self.sums.clone(), self.counts.clone());

        for ep in epochs {
            let end = ep.end.min(ns);
            if ep.start >= end {
                continue;
            }
            for t in ep.start..end {
                let x0 = data.sample(t);
                for lag in 0..self.max_lag.min(end - t) {
                    let x1 = data.sample(t + lag);
                    for c1 in 0..nc {
                        let base = self.index(lag, c1, 0);
                        for c2 in 0..nc {
                            self.sums[base + c2] += x0[c1] as f64 * x1[c2] as f64;
                        }
                    }
                    self.counts[lag] += 1;
                }
            }
            seen += end - ep.start;
        }
        if seen == 0 {
            return Ok(());
        }

        if let Err(err) = self.covariance(self.max_lag).and_then(|c| c.cholesky().map_err(BotmError::from)) {
            (self.sums, self.counts) = snapshot;
            tracing::warn!(samples = seen, %err, "covariance update rejected");
            return Err(err);
        }
        tracing::debug!(samples = seen, epochs = epochs.len(), "covariance updated");
        Ok(())
    }

    fn covariance(&self, tf: usize) -> Result<Matrix> {
        if tf == 0 || tf > self.max_lag {
            return Err(BotmError::config(alloc::format!(
                "window of {} samples outside estimator range 1..={}",
                tf, self.max_lag
            )));
        }
        let n = tf * self.channels;
        if !self.is_initialized() {
            return Ok(Matrix::identity(n));
        }

        let mut cov = Matrix::zeros(n);
        for c1 in 0..self.channels {
            for c2 in 0..self.channels {
                for k1 in 0..tf {
                    for k2 in 0..tf {
                        let v = self.lagged(k2 as isize - k1 as isize, c1, c2);
                        cov.set(c1 * tf + k1, c2 * tf + k2, v);
                    }
                }
            }
        }
        let mean_diag = cov.trace() / n as f64;
        cov.add_diagonal(self.loading * mean_diag.max(f64::MIN_POSITIVE));
        Ok(cov)
    }
}
