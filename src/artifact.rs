//! Artifact epoch detection from zero-crossing rates.
//!
//! Background noise in extracellular recordings is close to a zero-mean
//! Gaussian process whose sign flips on roughly every other sample. Slow
//! capacitive artifacts flip far less often, so a moving-window zero-crossing
//! rate that drops well below 0.5 marks them. Detected epochs are padded and
//! merged; their complement is safe to learn noise statistics from.

use alloc::vec;
use alloc::vec::Vec;

use crate::epochs::{epochs_from_mask, invert_epochs, merge_epochs, Epoch};
use crate::error::{BotmError, Result};
use crate::trace::TraceView;

/// Zero-crossing rate artifact detector.
///
/// # Example
/// ```
/// # use botm::artifact::ZeroCrossingArtifactDetector;
/// # use botm::TraceView;
/// let mut data: Vec<f32> = (0..400).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
/// for v in &mut data[150..250] {
///     *v = 5.0; // slow excursion, no sign changes
/// }
/// let mut det = ZeroCrossingArtifactDetector::new(20, (5, 5), 10, 0.1).unwrap();
/// det.run(TraceView::new(&data, 1).unwrap());
/// assert_eq!(det.artifact_epochs().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct ZeroCrossingArtifactDetector {
    window: usize,
    pad: (usize, usize),
    min_distance: usize,
    zcr_threshold: f32,
    epochs: Vec<Epoch>,
    size: Option<usize>,
}

impl ZeroCrossingArtifactDetector {
    /// Creates a detector with sizes in samples.
    ///
    /// # Arguments
    /// * `window` - Integration window of the crossing rate
    /// * `pad` - Padding added before and after each artifact epoch
    /// * `min_distance` - Clean gaps shorter than this are absorbed
    /// * `zcr_threshold` - Rates below this mark artifacts
    pub fn new(window: usize, pad: (usize, usize), min_distance: usize, zcr_threshold: f32) -> Result<Self> {
        if window < 2 {
            return Err(BotmError::config("zero-crossing window needs at least two samples"));
        }
        if !(zcr_threshold > 0.0 && zcr_threshold < 1.0) {
            return Err(BotmError::Value {
                name: "zcr_threshold",
                value: zcr_threshold as f64,
            });
        }
        Ok(Self {
            window,
            pad,
            min_distance,
            zcr_threshold,
            epochs: Vec::new(),
            size: None,
        })
    }

    /// Creates a detector with sizes in milliseconds at `sample_rate` Hz.
    pub fn from_ms(
        window_ms: f32,
        pad_ms: (f32, f32),
        min_distance_ms: f32,
        sample_rate: f32,
        zcr_threshold: f32,
    ) -> Result<Self> {
        let samples = |ms: f32| (ms * sample_rate / 1000.0) as usize;
        Self::new(
            samples(window_ms),
            (samples(pad_ms.0), samples(pad_ms.1)),
            samples(min_distance_ms),
            zcr_threshold,
        )
    }

    /// Detects artifact epochs in `data`, replacing the previous result.
    pub fn run(&mut self, data: TraceView<'_>) {
        let ns = data.len();
        let mut epochs = Vec::new();

        for c in 0..data.channels() {
            let rate = self.crossing_rate(&data, c);
            let mask: Vec<bool> = rate.iter().map(|&r| r < self.zcr_threshold).collect();
            epochs.extend(epochs_from_mask(&mask));
        }

        let padded: Vec<Epoch> = epochs
            .into_iter()
            .map(|ep| Epoch::new(ep.start.saturating_sub(self.pad.0), (ep.end + self.pad.1).min(ns)))
            .collect();
        self.epochs = merge_epochs(&padded, self.min_distance);
        self.size = Some(ns);
        tracing::debug!(epochs = self.epochs.len(), "artifact detection");
    }

    /// Moving average of sign changes on channel `c`, normalised by the
    /// number of samples inside the window so the edges are unbiased.
    fn crossing_rate(&self, data: &TraceView<'_>, c: usize) -> Vec<f32> {
        let ns = data.len();
        let mut cumsum = vec![0u32; ns + 1];
        for t in 0..ns {
            let flip = t + 1 < ns
                && (data.get(t, c).is_sign_negative() != data.get(t + 1, c).is_sign_negative());
            cumsum[t + 1] = cumsum[t] + flip as u32;
        }
        let half = self.window / 2;
        (0..ns)
            .map(|t| {
                let lo = t.saturating_sub(half);
                let hi = (lo + self.window).min(ns);
                (cumsum[hi] - cumsum[lo]) as f32 / (hi - lo) as f32
            })
            .collect()
    }

    /// Artifact epochs of the last run.
    pub fn artifact_epochs(&self) -> &[Epoch] {
        &self.epochs
    }

    /// Complement of the artifact epochs, `None` before the first run.
    pub fn non_artifact_epochs(&self) -> Option<Vec<Epoch>> {
        self.size.map(|ns| invert_epochs(&self.epochs, ns))
    }

    /// `−ln(clean_len / (len · (n_artifacts + 1)))`, `None` before the first
    /// run.
    pub fn fragmentation(&self) -> Option<f64> {
        let ns = self.size?;
        let covered: usize = self.epochs.iter().map(Epoch::len).sum();
        let clean = (ns - covered.min(ns)) as f64;
        Some(-libm::log(clean / (ns as f64 * (self.epochs.len() + 1) as f64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alternating(ns: usize) -> Vec<f32> {
        (0..ns).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect()
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(ZeroCrossingArtifactDetector::new(1, (0, 0), 0, 0.1).is_err());
        assert!(ZeroCrossingArtifactDetector::new(10, (0, 0), 0, 0.0).is_err());
        assert!(ZeroCrossingArtifactDetector::new(10, (0, 0), 0, 1.5).is_err());
        let det = ZeroCrossingArtifactDetector::from_ms(15.0, (5.0, 10.0), 10.0, 32_000.0, 0.1).unwrap();
        assert_eq!(det.window, 480);
        assert_eq!(det.pad, (160, 320));
    }

    #[test]
    fn test_clean_signal_has_no_artifacts() {
        let data = alternating(500);
        let mut det = ZeroCrossingArtifactDetector::new(20, (5, 5), 10, 0.1).unwrap();
        assert!(det.non_artifact_epochs().is_none());
        det.run(TraceView::new(&data, 1).unwrap());
        assert!(det.artifact_epochs().is_empty());
        assert_eq!(det.non_artifact_epochs(), Some(vec![Epoch::new(0, 500)]));
        assert_eq!(det.fragmentation(), Some(0.0));
    }

    #[test]
    fn test_slow_wave_is_flagged() {
        let mut data = alternating(600);
        for v in &mut data[200..300] {
            *v = 3.0;
        }
        let mut det = ZeroCrossingArtifactDetector::new(20, (5, 5), 10, 0.1).unwrap();
        det.run(TraceView::new(&data, 1).unwrap());

        let eps = det.artifact_epochs();
        assert_eq!(eps.len(), 1);
        assert!(eps[0].start <= 210 && eps[0].start >= 190);
        assert!(eps[0].end >= 290 && eps[0].end <= 310);

        let clean = det.non_artifact_epochs().unwrap();
        assert_eq!(clean.len(), 2);
        assert_eq!(clean[0].start, 0);
        assert_eq!(clean[1].end, 600);
    }

    #[test]
    fn test_artifact_on_any_channel() {
        let mut data: Vec<f32> = alternating(400).into_iter().flat_map(|v| [v, -v]).collect();
        for t in 100..200 {
            data[t * 2 + 1] = -2.0;
        }
        let mut det = ZeroCrossingArtifactDetector::new(20, (0, 0), 10, 0.1).unwrap();
        det.run(TraceView::new(&data, 2).unwrap());
        assert_eq!(det.artifact_epochs().len(), 1);
    }
}
