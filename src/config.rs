//! Sorter configuration.
//!
//! Plain data with defaults matching common extracellular recordings. All
//! values are checked when a sorter is constructed; prior setters on the
//! sorter validate again.

use alloc::vec::Vec;

/// Filter bank options.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BankConfig {
    /// Input channels to sort on; `None` uses every channel of the
    /// covariance estimator, in order.
    pub channels: Option<Vec<usize>>,
    /// Capacity of each filter's waveform buffer.
    pub buffer_capacity: usize,
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            channels: None,
            buffer_capacity: 350,
        }
    }
}

/// How candidate epochs are widened before merging.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Widening {
    /// Pad symmetrically to at least `⌊min_width_factor · tf⌋` samples.
    Symmetric { min_width_factor: f32 },
    /// Place the epoch's discriminant peak `align_at` samples into a window
    /// of `tf` samples (the epoch never shrinks).
    PeakAligned { align_at: usize },
}

impl Default for Widening {
    fn default() -> Self {
        Widening::Symmetric {
            min_width_factor: 1.2,
        }
    }
}

/// Widening and merging rule for one resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EpochPolicy {
    pub widening: Widening,
    /// Minimum gap between epochs after merging; `None` means `tf / 2`.
    pub merge_distance: Option<usize>,
}

impl EpochPolicy {
    /// Effective merge distance for templates of `tf` samples.
    pub fn merge_distance(&self, tf: usize) -> usize {
        self.merge_distance.unwrap_or(tf / 2)
    }
}

/// Epoch resolution strategy.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Resolution {
    /// Greedy subtractive interference cancellation.
    #[default]
    Sic,
    /// Argmax over single-unit and pairwise overlap columns at the given
    /// lags.
    OverlapChannels { taus: Vec<isize> },
}

/// Options for [`BotmSorter`](crate::BotmSorter).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BotmConfig {
    pub bank: BankConfig,
    /// Samples per chunk.
    pub chunk_size: usize,
    /// Prior probability of a given unit firing at a given sample.
    pub spike_prior: f64,
    /// Prior probability of noise; `ln` of it is the detection threshold.
    pub noise_prior: f64,
    pub resolution: Resolution,
    pub sic_epochs: EpochPolicy,
    pub overlap_epochs: EpochPolicy,
}

impl Default for BotmConfig {
    fn default() -> Self {
        Self {
            bank: BankConfig::default(),
            chunk_size: 100_000,
            spike_prior: 1e-6,
            noise_prior: 1.0,
            resolution: Resolution::Sic,
            sic_epochs: EpochPolicy::default(),
            overlap_epochs: EpochPolicy::default(),
        }
    }
}

impl BotmConfig {
    /// Epoch policy of the configured resolution strategy.
    pub fn epoch_policy(&self) -> &EpochPolicy {
        match self.resolution {
            Resolution::Sic => &self.sic_epochs,
            Resolution::OverlapChannels { .. } => &self.overlap_epochs,
        }
    }
}

/// Source of the epochs the noise covariance is learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NoiseLearning {
    /// Keep the covariance fixed.
    Disabled,
    /// Complement of the sorted spikes, each cut `tf` wide.
    #[default]
    FromSorting,
    /// Complement of the parallel detector's events.
    FromDetection,
}

/// Options for the adaptive controller.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdaptiveConfig {
    /// Alignment sample for learned waveforms; `None` means
    /// `round(0.25 · tf)`.
    pub learn_templates: Option<usize>,
    pub learn_noise: NoiseLearning,
    /// Capacity of the detection buffer.
    pub detection_limit: usize,
    /// Smallest cluster that becomes a new unit.
    pub min_cluster_size: usize,
    /// Clustering passes a waveform may survive in a too-small cluster
    /// before it is dropped.
    pub max_cluster_retries: u32,
    /// Half-width (samples) of the window searched when checking whether a
    /// detection is explained by the filter bank.
    pub explain_tolerance: usize,
    /// Filters with a lower per-sample SNR are retired.
    pub snr_floor: f32,
    /// Filters firing below this rate (Hz) are retired.
    pub rate_floor_hz: f32,
    /// Sampling rate used to convert spike counts to rates.
    pub sample_rate: f32,
    /// Exponential smoothing factor of the rate estimate.
    pub rate_smoothing: f32,
    /// Largest mixture order tried when clustering.
    pub max_clusters: usize,
    /// Principal components kept before clustering.
    pub pca_components: usize,
    /// Remove zero-crossing artifact epochs from the noise epochs.
    pub exclude_artifacts: bool,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            learn_templates: None,
            learn_noise: NoiseLearning::FromSorting,
            detection_limit: 2000,
            min_cluster_size: 50,
            max_cluster_retries: 3,
            explain_tolerance: 2,
            snr_floor: 0.5,
            rate_floor_hz: 0.1,
            sample_rate: 16_000.0,
            rate_smoothing: 0.5,
            max_clusters: 6,
            pca_components: 4,
            exclude_artifacts: false,
        }
    }
}

impl AdaptiveConfig {
    /// Alignment sample for templates of `tf` samples.
    pub fn align_at(&self, tf: usize) -> usize {
        self.learn_templates
            .unwrap_or_else(|| libm::roundf(0.25 * tf as f32) as usize)
            .min(tf.saturating_sub(1))
    }
}
