use numpy::{PyArray1, PyReadonlyArray1, PyReadonlyArray2};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use pyo3::Bound;

use ::botm::cluster::GaussianMixture;
use ::botm::covariance::{CovarianceEstimator, TimeSeriesCovariance};
use ::botm::detector::ThresholdDetector;
use ::botm::{
    AbotmSorter as BmAbotmSorter, AdaptiveConfig, BotmConfig, BotmSorter as BmBotmSorter, FilterBank,
    Resolution,
};

mod detection;
mod utils;

use detection::{ArtifactDetector, SpikeDetector};
use utils::{to_py_err, trace_view, trains_to_dict};

fn resolution(mode: &str, max_tau: usize) -> PyResult<Resolution> {
    match mode {
        "sic" => Ok(Resolution::Sic),
        "overlap" => {
            let max_tau = max_tau as isize;
            Ok(Resolution::OverlapChannels {
                taus: (-max_tau..=max_tau).collect(),
            })
        }
        other => Err(PyValueError::new_err(format!(
            "unknown resolution '{}', expected 'sic' or 'overlap'",
            other
        ))),
    }
}

fn split_templates(templates: &PyReadonlyArray2<f32>) -> PyResult<Vec<Vec<f32>>> {
    let rows = templates
        .as_array()
        .rows()
        .into_iter()
        .map(|r| r.to_vec())
        .collect::<Vec<_>>();
    if rows.is_empty() {
        return Err(PyValueError::new_err("at least one template is required"));
    }
    Ok(rows)
}

/// Bayes optimal template matching spike sorter.
///
/// Templates are rows of a `(units, tf * channels)` array, channel-major
/// within a row.
///
/// # Example
/// ```python
/// import botm_py as bm
/// import numpy as np
///
/// sorter = bm.BotmSorter(templates, tf=32, channels=4)
/// trains = sorter.sort(data)  # data: (samples, 4) float32
/// ```
#[pyclass]
struct BotmSorter {
    inner: BmBotmSorter<TimeSeriesCovariance>,
}

#[pymethods]
impl BotmSorter {
    /// Create a sorter.
    ///
    /// Args:
    ///     templates (np.ndarray): float32 array of shape (units, tf * channels).
    ///     tf (int): Template length in samples.
    ///     channels (int): Number of channels of the data.
    ///     chunk_size (int): Samples per processing chunk.
    ///     spike_prior (float): Prior probability of a spike per unit and sample.
    ///     noise_prior (float): Prior probability of noise.
    ///     resolution (str): 'sic' or 'overlap'.
    ///     max_tau (int): Largest overlap lag for 'overlap'.
    #[new]
    #[pyo3(signature = (templates, tf, channels, chunk_size=100_000, spike_prior=1e-6, noise_prior=1.0, resolution="sic", max_tau=None))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        templates: PyReadonlyArray2<f32>,
        tf: usize,
        channels: usize,
        chunk_size: usize,
        spike_prior: f64,
        noise_prior: f64,
        resolution: &str,
        max_tau: Option<usize>,
    ) -> PyResult<Self> {
        let config = BotmConfig {
            chunk_size,
            spike_prior,
            noise_prior,
            resolution: self::resolution(resolution, max_tau.unwrap_or(tf / 2))?,
            ..BotmConfig::default()
        };
        let ce = TimeSeriesCovariance::new(channels, tf).map_err(to_py_err)?;
        let inner = BmBotmSorter::new(split_templates(&templates)?, tf, ce, config).map_err(to_py_err)?;
        Ok(Self { inner })
    }

    /// Sort a recording.
    ///
    /// Args:
    ///     data (np.ndarray): float32 array of shape (samples, channels).
    ///
    /// Returns:
    ///     dict[int, np.ndarray]: Spike times per unit id.
    fn sort<'py>(&mut self, py: Python<'py>, data: PyReadonlyArray2<'py, f32>) -> PyResult<Bound<'py, PyDict>> {
        let view = trace_view(&data)?;
        let set = self.inner.sort(view).map_err(to_py_err)?;
        trains_to_dict(py, &set)
    }

    /// Feed noise samples into the covariance estimate.
    ///
    /// Args:
    ///     data (np.ndarray): float32 array of shape (samples, channels).
    fn update_noise(&mut self, data: PyReadonlyArray2<f32>) -> PyResult<()> {
        let view = trace_view(&data)?;
        let epochs = [::botm::Epoch::new(0, view.len())];
        self.inner
            .bank_mut()
            .covariance_mut()
            .update(view, &epochs)
            .map_err(to_py_err)
    }

    /// Posterior of each active unit for one concatenated waveform.
    fn posterior<'py>(&self, py: Python<'py>, waveform: PyReadonlyArray1<f32>) -> PyResult<Bound<'py, PyArray1<f32>>> {
        let p = self.inner.posterior(waveform.as_slice()?).map_err(to_py_err)?;
        Ok(PyArray1::from_vec(py, p))
    }

    #[getter]
    fn spike_prior(&self) -> f64 {
        self.inner.spike_prior()
    }

    #[setter]
    fn set_spike_prior(&mut self, value: f64) -> PyResult<()> {
        self.inner.set_spike_prior(value).map_err(to_py_err)
    }

    #[getter]
    fn noise_prior(&self) -> f64 {
        self.inner.noise_prior()
    }

    #[setter]
    fn set_noise_prior(&mut self, value: f64) -> PyResult<()> {
        self.inner.set_noise_prior(value).map_err(to_py_err)
    }

    /// Ids of the active units.
    #[getter]
    fn active_ids(&self) -> Vec<usize> {
        self.inner.bank().active_ids().to_vec()
    }
}

/// Adaptive BOTM sorter: learns noise and templates, discovers and retires
/// units while sorting.
#[pyclass]
struct AbotmSorter {
    inner: BmAbotmSorter<TimeSeriesCovariance, ThresholdDetector, GaussianMixture>,
}

#[pymethods]
impl AbotmSorter {
    /// Create an adaptive sorter.
    ///
    /// Args:
    ///     templates (np.ndarray): float32 array of shape (units, tf * channels).
    ///     tf (int): Template length in samples.
    ///     channels (int): Number of channels of the data.
    ///     sample_rate (float): Sampling rate in Hz.
    ///     threshold (float): Detector threshold in standard deviations.
    ///     chunk_size (int): Samples per processing chunk.
    ///     detection_limit (int): Unexplained waveforms collected before clustering.
    ///     min_cluster_size (int): Smallest cluster that becomes a unit.
    #[new]
    #[pyo3(signature = (templates, tf, channels, sample_rate=16_000.0, threshold=4.0, chunk_size=100_000, detection_limit=2000, min_cluster_size=50))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        templates: PyReadonlyArray2<f32>,
        tf: usize,
        channels: usize,
        sample_rate: f32,
        threshold: f32,
        chunk_size: usize,
        detection_limit: usize,
        min_cluster_size: usize,
    ) -> PyResult<Self> {
        let botm = BotmConfig {
            chunk_size,
            ..BotmConfig::default()
        };
        let config = AdaptiveConfig {
            sample_rate,
            detection_limit,
            min_cluster_size,
            ..AdaptiveConfig::default()
        };
        let ce = TimeSeriesCovariance::new(channels, tf).map_err(to_py_err)?;
        let sorter = BmBotmSorter::new(split_templates(&templates)?, tf, ce, botm).map_err(to_py_err)?;
        let detector = ThresholdDetector::new(threshold, tf, tf).map_err(to_py_err)?;
        let gmm = GaussianMixture::new(config.max_clusters);
        let inner = BmAbotmSorter::new(sorter, detector, gmm, config).map_err(to_py_err)?;
        Ok(Self { inner })
    }

    /// Sort a recording, adapting the model after every chunk.
    fn sort<'py>(&mut self, py: Python<'py>, data: PyReadonlyArray2<'py, f32>) -> PyResult<Bound<'py, PyDict>> {
        let view = trace_view(&data)?;
        let set = self.inner.sort(view).map_err(to_py_err)?;
        trains_to_dict(py, &set)
    }

    #[setter]
    fn set_noise_prior(&mut self, value: f64) -> PyResult<()> {
        self.inner.set_noise_prior(value).map_err(to_py_err)
    }

    #[getter]
    fn active_ids(&self) -> Vec<usize> {
        self.inner.sorter().bank().active_ids().to_vec()
    }

    /// Current templates of every unit ever created, `(units, tf * channels)`.
    fn templates(&self) -> Vec<Vec<f32>> {
        self.inner
            .sorter()
            .bank()
            .filters()
            .iter()
            .map(|f| f.template().to_vec())
            .collect()
    }

    #[getter]
    fn detection_buffer_len(&self) -> usize {
        self.inner.detection_buffer_len()
    }
}

#[pymodule]
fn botm_py(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<BotmSorter>()?;
    m.add_class::<AbotmSorter>()?;
    m.add_class::<SpikeDetector>()?;
    m.add_class::<ArtifactDetector>()?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}
