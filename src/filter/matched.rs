use alloc::vec::Vec;

use crate::buffer::RingBuffer;
use crate::error::{BotmError, Result};
use crate::linalg::Matrix;

/// Noise-whitened matched filter for one unit.
///
/// Holds the unit's template `ξ` (channel-major, `tf·nc` values), the
/// filter coefficients `C⁻¹·ξ`, and a ring buffer of recently observed
/// aligned waveforms whose mean is the template.
///
/// # Example
/// ```
/// # use botm::filter::MatchedFilter;
/// # use botm::linalg::Matrix;
/// let mut f = MatchedFilter::new(vec![0.0, -2.0, 1.0, 0.0], 4, 1, 10).unwrap();
/// f.whiten(&Matrix::identity(4));
/// assert_eq!(f.energy(), 5.0);
/// ```
#[derive(Debug, Clone)]
pub struct MatchedFilter {
    template: Vec<f32>,
    coefficients: Vec<f32>,
    energy: f64,
    tf: usize,
    nc: usize,
    buffer: RingBuffer<Vec<f32>>,
    active: bool,
    rate: Option<f32>,
}

impl MatchedFilter {
    /// Creates an active filter whose waveform buffer is seeded with
    /// `template`. Coefficients start equal to the template (identity
    /// noise) until [`whiten`](Self::whiten) is called.
    pub fn new(template: Vec<f32>, tf: usize, nc: usize, capacity: usize) -> Result<Self> {
        if tf == 0 || nc == 0 {
            return Err(BotmError::config("filter needs a positive length and channel count"));
        }
        if template.len() != tf * nc {
            return Err(BotmError::DimensionMismatch {
                expected: tf * nc,
                got: template.len(),
            });
        }
        let mut buffer = RingBuffer::new(capacity);
        buffer.push(template.clone());
        let energy = crate::xcorr::dot(&template, &template);
        Ok(Self {
            coefficients: template.clone(),
            template,
            energy,
            tf,
            nc,
            buffer,
            active: true,
            rate: None,
        })
    }

    /// Recomputes the coefficients and energy against an inverse noise
    /// covariance of size `tf·nc`.
    pub fn whiten(&mut self, inverse: &Matrix) {
        let xi: Vec<f64> = self.template.iter().map(|&v| v as f64).collect();
        let coef = inverse.mul_vec(&xi);
        self.energy = coef.iter().zip(&xi).map(|(a, b)| a * b).sum();
        self.coefficients = coef.into_iter().map(|v| v as f32).collect();
    }

    /// Pushes aligned waveforms into the buffer and replaces the template
    /// with the buffer mean.
    ///
    /// Coefficients are stale until the next [`whiten`](Self::whiten).
    pub fn extend(&mut self, waveforms: impl IntoIterator<Item = Vec<f32>>) -> Result<()> {
        let expected = self.tf * self.nc;
        for w in waveforms {
            if w.len() != expected {
                return Err(BotmError::DimensionMismatch {
                    expected,
                    got: w.len(),
                });
            }
            self.buffer.push(w);
        }
        if let Some(mean) = self.buffer.mean() {
            self.template = mean;
        }
        Ok(())
    }

    /// Template, channel-major.
    pub fn template(&self) -> &[f32] {
        &self.template
    }

    /// Whitened filter `C⁻¹ · template`, same layout as the template.
    pub fn coefficients(&self) -> &[f32] {
        &self.coefficients
    }

    /// Whitened template energy `ξᵀ·C⁻¹·ξ`.
    pub fn energy(&self) -> f64 {
        self.energy
    }

    /// Per-sample signal-to-noise ratio, `sqrt(energy / (tf·nc))`.
    pub fn snr(&self) -> f32 {
        libm::sqrt(self.energy.max(0.0) / (self.tf * self.nc) as f64) as f32
    }

    pub fn template_length(&self) -> usize {
        self.tf
    }

    pub fn channels(&self) -> usize {
        self.nc
    }

    /// Number of waveforms currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Inactive filters keep their template but are skipped by sorting.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Smoothed firing rate in Hz, `None` until a chunk has been observed.
    pub fn rate(&self) -> Option<f32> {
        self.rate
    }

    /// Folds one chunk's observed rate into the estimate with exponential
    /// smoothing factor `alpha` (the first observation is taken as is).
    pub fn observe_rate(&mut self, observed: f32, alpha: f32) {
        self.rate = Some(match self.rate {
            None => observed,
            Some(prev) => alpha * observed + (1.0 - alpha) * prev,
        });
    }
}
