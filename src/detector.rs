//! Spike detectors run alongside the sorter.
//!
//! The adaptive controller uses a detector to find events the filter bank
//! does not explain and to mark noise epochs. Detectors work on one chunk at
//! a time and keep a copy of it so waveforms can be cut afterwards.

use alloc::vec::Vec;

use crate::epochs::{invert_epochs, merge_epochs, Epoch};
use crate::error::{BotmError, Result};
use crate::stats::OnlineStats;
use crate::trace::{Trace, TraceView};

/// Detection capability used by the adaptive controller.
pub trait SpikeDetector {
    /// Forgets the last chunk and its events.
    fn reset(&mut self);

    /// Detects events in `chunk` (all channels the detector works on).
    fn run(&mut self, chunk: TraceView<'_>) -> Result<()>;

    /// Event samples of the last chunk, ascending.
    fn events(&self) -> &[usize];

    /// Windows around the events, optionally merged and/or inverted within
    /// the chunk.
    fn epochs(&self, merge: bool, invert: bool) -> Vec<Epoch>;

    /// Channel-major waveforms of `tf` samples starting `align_at` samples
    /// before each event, paired with the event sample. Events too close to
    /// the chunk edges are skipped.
    fn extract_events(&self, align_at: usize) -> Vec<(usize, Vec<f32>)>;
}

/// Quantity compared against the per-channel thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DetectionEnergy {
    /// Negative deflections only; events sit at the local minimum.
    #[default]
    NegativePeak,
    /// Absolute amplitude; events sit at the largest magnitude.
    Absolute,
}

/// Multichannel threshold detector with refractory period.
///
/// Each channel's threshold is `factor` times its standard deviation over
/// the chunk. A sample triggers when any channel exceeds its threshold; the
/// event is moved to the strongest sample within the next `tf` samples and
/// no new event can start for `refractory` samples after it.
///
/// # Example
/// ```
/// # use botm::detector::{SpikeDetector, ThresholdDetector};
/// # use botm::TraceView;
/// let mut data = vec![0.1f32, -0.1].repeat(50);
/// data[40] = -8.0;
/// let mut det = ThresholdDetector::new(4.0, 8, 10).unwrap();
/// det.run(TraceView::new(&data, 1).unwrap()).unwrap();
/// assert_eq!(det.events(), &[40]);
/// ```
#[derive(Debug, Clone)]
pub struct ThresholdDetector {
    factor: f32,
    tf: usize,
    refractory: usize,
    energy: DetectionEnergy,
    thresholds: Vec<f32>,
    events: Vec<usize>,
    data: Option<Trace>,
}

impl ThresholdDetector {
    /// Creates a detector.
    ///
    /// # Arguments
    /// * `factor` - Threshold in units of channel standard deviation
    /// * `tf` - Window length for event alignment and extraction
    /// * `refractory` - Samples to wait after an event
    pub fn new(factor: f32, tf: usize, refractory: usize) -> Result<Self> {
        if !(factor > 0.0) {
            return Err(BotmError::Value {
                name: "threshold_factor",
                value: factor as f64,
            });
        }
        if tf == 0 {
            return Err(BotmError::config("detector window must be positive"));
        }
        Ok(Self {
            factor,
            tf,
            refractory,
            energy: DetectionEnergy::NegativePeak,
            thresholds: Vec::new(),
            events: Vec::new(),
            data: None,
        })
    }

    /// Replaces the energy the threshold is applied to.
    pub fn with_energy(mut self, energy: DetectionEnergy) -> Self {
        self.energy = energy;
        self
    }

    /// Per-channel thresholds of the last chunk; infinite for channels
    /// without variance.
    pub fn thresholds(&self) -> &[f32] {
        &self.thresholds
    }

    /// Samples after an event during which no other event is reported.
    pub fn refractory_period(&self) -> usize {
        self.refractory
    }

    /// Normalised energy of sample `t`: the largest `value / threshold`
    /// over channels.
    fn score(&self, data: &TraceView<'_>, t: usize) -> f32 {
        data.sample(t)
            .iter()
            .zip(&self.thresholds)
            .map(|(&x, &th)| {
                let v = match self.energy {
                    DetectionEnergy::NegativePeak => -x,
                    DetectionEnergy::Absolute => libm::fabsf(x),
                };
                v / th
            })
            .fold(f32::NEG_INFINITY, f32::max)
    }
}

impl SpikeDetector for ThresholdDetector {
    fn reset(&mut self) {
        self.events.clear();
        self.thresholds.clear();
        self.data = None;
    }

    fn run(&mut self, chunk: TraceView<'_>) -> Result<()> {
        self.reset();
        let ns = chunk.len();
        let mut stats = OnlineStats::new(chunk.channels());
        for t in 0..ns {
            stats.update(chunk.sample(t));
        }
        self.thresholds = stats
            .std_dev()
            .into_iter()
            .map(|s| match (self.factor as f64 * s) as f32 {
                // flat channel, never fires
                th if th > 0.0 => th,
                _ => f32::INFINITY,
            })
            .collect();

        let mut refractory_counter = 0usize;
        let mut t = 0;
        while t < ns {
            if refractory_counter > 0 {
                refractory_counter -= 1;
                t += 1;
                continue;
            }
            if self.score(&chunk, t) > 1.0 {
                let end = (t + self.tf).min(ns);
                let mut peak = (t, self.score(&chunk, t));
                for u in t + 1..end {
                    let s = self.score(&chunk, u);
                    if s > peak.1 {
                        peak = (u, s);
                    }
                }
                self.events.push(peak.0);
                refractory_counter = self.refractory;
                t = peak.0 + 1;
                continue;
            }
            t += 1;
        }

        self.data = Some(Trace::new(chunk.as_slice().to_vec(), chunk.channels())?);
        tracing::debug!(events = self.events.len(), "detector run");
        Ok(())
    }

    fn events(&self) -> &[usize] {
        &self.events
    }

    fn epochs(&self, merge: bool, invert: bool) -> Vec<Epoch> {
        let ns = self.data.as_ref().map_or(0, Trace::len);
        let half = self.tf / 2;
        let mut epochs: Vec<Epoch> = self
            .events
            .iter()
            .map(|&e| Epoch::new(e.saturating_sub(half), (e + self.tf - half).min(ns)))
            .collect();
        if merge {
            epochs = merge_epochs(&epochs, 0);
        }
        if invert {
            epochs = invert_epochs(&epochs, ns);
        }
        epochs
    }

    fn extract_events(&self, align_at: usize) -> Vec<(usize, Vec<f32>)> {
        let Some(data) = self.data.as_ref() else {
            return Vec::new();
        };
        let view = data.view();
        self.events
            .iter()
            .filter_map(|&e| {
                view.concatenated_window(e as isize - align_at as isize, self.tf)
                    .map(|w| (e, w))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn noisy(ns: usize, nc: usize) -> Vec<f32> {
        (0..ns * nc)
            .map(|i| if (i * 7) % 3 == 0 { 0.2 } else { -0.1 })
            .collect()
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(ThresholdDetector::new(0.0, 8, 10).is_err());
        assert!(ThresholdDetector::new(f32::NAN, 8, 10).is_err());
        assert!(ThresholdDetector::new(4.0, 0, 10).is_err());
    }

    #[test]
    fn test_events_at_negative_peaks() {
        let mut data = noisy(300, 2);
        // channel 1 spike with minimum at 102
        data[101 * 2 + 1] = -4.0;
        data[102 * 2 + 1] = -9.0;
        data[103 * 2 + 1] = -3.0;
        // channel 0 spike with minimum at 200
        data[200 * 2] = -9.0;

        let mut det = ThresholdDetector::new(5.0, 8, 8).unwrap();
        det.run(TraceView::new(&data, 2).unwrap()).unwrap();
        assert_eq!(det.events(), &[102, 200]);
    }

    #[test]
    fn test_flat_channel_never_fires() {
        let mut data = noisy(200, 2);
        for t in 0..200 {
            data[t * 2 + 1] = -2.0;
        }
        data[80 * 2] = -9.0;

        let mut det = ThresholdDetector::new(4.0, 8, 8).unwrap();
        det.run(TraceView::new(&data, 2).unwrap()).unwrap();
        assert_eq!(det.events(), &[80]);
        assert!(det.thresholds()[1].is_infinite());
    }

    #[test]
    fn test_refractory_suppresses_doublets() {
        let mut data = noisy(100, 1);
        data[40] = -9.0;
        data[52] = -9.0;
        let mut det = ThresholdDetector::new(4.0, 4, 20).unwrap();
        det.run(TraceView::new(&data, 1).unwrap()).unwrap();
        assert_eq!(det.events(), &[40]);

        let mut det = ThresholdDetector::new(4.0, 4, 5).unwrap();
        det.run(TraceView::new(&data, 1).unwrap()).unwrap();
        assert_eq!(det.events(), &[40, 52]);
    }

    #[test]
    fn test_absolute_energy() {
        let mut data = noisy(100, 1);
        data[30] = 9.0;
        let mut det = ThresholdDetector::new(4.0, 4, 5).unwrap();
        det.run(TraceView::new(&data, 1).unwrap()).unwrap();
        assert!(det.events().is_empty());

        let mut det = det.with_energy(DetectionEnergy::Absolute);
        det.run(TraceView::new(&data, 1).unwrap()).unwrap();
        assert_eq!(det.events(), &[30]);
    }

    #[test]
    fn test_epochs_and_extraction() {
        let mut data = noisy(100, 1);
        data[2] = -9.0;
        data[50] = -9.0;
        let mut det = ThresholdDetector::new(4.0, 8, 5).unwrap();
        det.run(TraceView::new(&data, 1).unwrap()).unwrap();
        assert_eq!(det.events(), &[2, 50]);

        assert_eq!(
            det.epochs(true, false),
            vec![Epoch::new(0, 6), Epoch::new(46, 54)]
        );
        assert_eq!(
            det.epochs(true, true),
            vec![Epoch::new(6, 46), Epoch::new(54, 100)]
        );

        // the first event is too close to the start for align_at = 3
        let waves = det.extract_events(3);
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].0, 50);
        assert_eq!(waves[0].1.len(), 8);
        assert_eq!(waves[0].1[3], -9.0);

        det.reset();
        assert!(det.events().is_empty());
        assert!(det.extract_events(0).is_empty());
    }
}
