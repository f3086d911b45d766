//! Python bindings for the spike and artifact detectors.

use botm::artifact::ZeroCrossingArtifactDetector;
use botm::detector::{DetectionEnergy, SpikeDetector as _, ThresholdDetector};
use numpy::PyReadonlyArray2;
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::utils::{to_py_err, trace_view};

/// Multichannel threshold spike detector.
///
/// # Example
/// ```python
/// det = bm.SpikeDetector(threshold=4.0, tf=32, refractory=32)
/// events = det.process(data)
/// ```
#[pyclass]
pub struct SpikeDetector {
    inner: ThresholdDetector,
}

#[pymethods]
impl SpikeDetector {
    /// Create a detector.
    ///
    /// Args:
    ///     threshold (float): Threshold in channel standard deviations.
    ///     tf (int): Window used for peak alignment and waveform cuts.
    ///     refractory (int): Refractory period in samples.
    ///     energy (str): 'negative' or 'absolute'.
    #[new]
    #[pyo3(signature = (threshold, tf, refractory, energy="negative"))]
    fn new(threshold: f32, tf: usize, refractory: usize, energy: &str) -> PyResult<Self> {
        let energy = match energy {
            "negative" => DetectionEnergy::NegativePeak,
            "absolute" => DetectionEnergy::Absolute,
            other => {
                return Err(PyValueError::new_err(format!(
                    "unknown energy '{}', expected 'negative' or 'absolute'",
                    other
                )))
            }
        };
        let inner = ThresholdDetector::new(threshold, tf, refractory)
            .map_err(to_py_err)?
            .with_energy(energy);
        Ok(Self { inner })
    }

    /// Detect events in `(samples, channels)` float32 data.
    ///
    /// Returns:
    ///     list[int]: Event samples.
    fn process(&mut self, data: PyReadonlyArray2<f32>) -> PyResult<Vec<usize>> {
        let view = trace_view(&data)?;
        self.inner.run(view).map_err(to_py_err)?;
        Ok(self.inner.events().to_vec())
    }

    /// Waveforms of the last call's events, cut `align_at` samples before
    /// each event.
    ///
    /// Returns:
    ///     list[tuple[int, list[float]]]: (event, waveform) pairs.
    fn waveforms(&self, align_at: usize) -> Vec<(usize, Vec<f32>)> {
        self.inner.extract_events(align_at)
    }

    /// Per-channel thresholds of the last call.
    #[getter]
    fn thresholds(&self) -> Vec<f32> {
        self.inner.thresholds().to_vec()
    }
}

/// Zero-crossing rate artifact detector.
#[pyclass]
pub struct ArtifactDetector {
    inner: ZeroCrossingArtifactDetector,
}

#[pymethods]
impl ArtifactDetector {
    /// Create a detector with sizes in milliseconds.
    ///
    /// Args:
    ///     sample_rate (float): Sampling rate in Hz.
    ///     window_ms (float): Integration window.
    ///     pad_ms (tuple[float, float]): Padding before and after each artifact.
    ///     min_distance_ms (float): Shorter clean gaps are absorbed.
    ///     zcr_threshold (float): Crossing rate below which data is an artifact.
    #[new]
    #[pyo3(signature = (sample_rate=32_000.0, window_ms=15.0, pad_ms=(5.0, 10.0), min_distance_ms=10.0, zcr_threshold=0.1))]
    fn new(
        sample_rate: f32,
        window_ms: f32,
        pad_ms: (f32, f32),
        min_distance_ms: f32,
        zcr_threshold: f32,
    ) -> PyResult<Self> {
        let inner = ZeroCrossingArtifactDetector::from_ms(window_ms, pad_ms, min_distance_ms, sample_rate, zcr_threshold)
            .map_err(to_py_err)?;
        Ok(Self { inner })
    }

    /// Detect artifacts in `(samples, channels)` float32 data.
    ///
    /// Returns:
    ///     list[tuple[int, int]]: Artifact epochs as (start, end).
    fn process(&mut self, data: PyReadonlyArray2<f32>) -> PyResult<Vec<(usize, usize)>> {
        let view = trace_view(&data)?;
        self.inner.run(view);
        Ok(self.inner.artifact_epochs().iter().map(|e| (e.start, e.end)).collect())
    }

    /// Complement of the last artifact epochs.
    fn clean_epochs(&self) -> Vec<(usize, usize)> {
        self.inner
            .non_artifact_epochs()
            .unwrap_or_default()
            .iter()
            .map(|e| (e.start, e.end))
            .collect()
    }

    /// Fragmentation index of the last call.
    #[getter]
    fn fragmentation(&self) -> Option<f64> {
        self.inner.fragmentation()
    }
}
