//! Adaptive BOTM (ABOTM).
//!
//! [`AbotmSorter`] wraps a [`BotmSorter`] and closes the loop after every
//! chunk. Once a chunk is sorted it runs, in order:
//!
//! 1. noise learning: the covariance estimator is updated from epochs free of
//!    spikes (sorted or detected), optionally minus artifact epochs;
//! 2. template learning: spikes without a neighbour from another unit are
//!    cut, aligned on their minimum and appended to their filter's buffer;
//! 3. discovery: detector events the discriminants do not explain are
//!    buffered; a full buffer is whitened, projected and clustered, and large
//!    enough clusters become new units;
//! 4. retirement: filters with too low an SNR or firing rate leave the active
//!    set.
//!
//! A failing step is logged and does not keep the later steps from running.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use crate::artifact::ZeroCrossingArtifactDetector;
use crate::botm::BotmSorter;
use crate::buffer::RingBuffer;
use crate::cluster::{whiten, Clustering, Pca};
use crate::config::{AdaptiveConfig, NoiseLearning};
use crate::covariance::CovarianceEstimator;
use crate::detector::SpikeDetector;
use crate::discriminant::Discriminants;
use crate::engine::{run_chunked, ChunkContext, ChunkSpikes, ChunkStages, SpikeTrainSet};
use crate::epochs::{
    epochs_from_mask, epochs_from_spike_trains, mask_from_epochs, overlaps, Epoch,
};
use crate::error::{BotmError, Result};
use crate::filter::{FilterBank, FilterId};
use crate::trace::{Trace, TraceView};

/// Unexplained waveform waiting to be clustered.
#[derive(Debug, Clone)]
struct PendingWaveform {
    waveform: Vec<f32>,
    /// Clustering passes survived in a too-small cluster.
    retries: u32,
}

/// Self-updating BOTM sorter.
#[derive(Debug)]
pub struct AbotmSorter<E, D, K> {
    sorter: BotmSorter<E>,
    detector: D,
    clustering: K,
    artifacts: Option<ZeroCrossingArtifactDetector>,
    config: AdaptiveConfig,
    detection: RingBuffer<PendingWaveform>,
}

impl<E, D, K> AbotmSorter<E, D, K>
where
    E: CovarianceEstimator,
    D: SpikeDetector,
    K: Clustering,
{
    /// Wraps `sorter` with a detector and a clustering back end.
    ///
    /// With `exclude_artifacts` set, a zero-crossing artifact detector with
    /// a 15 ms window, (5 ms, 10 ms) padding and 10 ms merge distance is
    /// attached; use [`with_artifact_detector`](Self::with_artifact_detector)
    /// to replace it.
    ///
    /// # Errors
    ///
    /// `Configuration` for a zero detection limit; `Value` for a
    /// non-positive sample rate or a smoothing factor outside `(0, 1]`.
    pub fn new(sorter: BotmSorter<E>, detector: D, clustering: K, config: AdaptiveConfig) -> Result<Self> {
        if config.detection_limit == 0 {
            return Err(BotmError::config("detection limit must be positive"));
        }
        if !(config.sample_rate > 0.0) {
            return Err(BotmError::Value {
                name: "sample_rate",
                value: config.sample_rate as f64,
            });
        }
        if !(config.rate_smoothing > 0.0 && config.rate_smoothing <= 1.0) {
            return Err(BotmError::Value {
                name: "rate_smoothing",
                value: config.rate_smoothing as f64,
            });
        }
        let artifacts = if config.exclude_artifacts {
            Some(ZeroCrossingArtifactDetector::from_ms(
                15.0,
                (5.0, 10.0),
                10.0,
                config.sample_rate,
                0.1,
            )?)
        } else {
            None
        };
        Ok(Self {
            sorter,
            detector,
            clustering,
            artifacts,
            detection: RingBuffer::new(config.detection_limit),
            config,
        })
    }

    /// Uses `detector` to exclude artifacts from noise learning.
    pub fn with_artifact_detector(mut self, detector: ZeroCrossingArtifactDetector) -> Self {
        self.artifacts = Some(detector);
        self.config.exclude_artifacts = true;
        self
    }

    /// The wrapped BOTM sorter, with its filter bank and priors.
    pub fn sorter(&self) -> &BotmSorter<E> {
        &self.sorter
    }

    pub fn sorter_mut(&mut self) -> &mut BotmSorter<E> {
        &mut self.sorter
    }

    /// Detector used to find unexplained events.
    pub fn detector(&self) -> &D {
        &self.detector
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    /// See [`BotmSorter::set_spike_prior`].
    pub fn set_spike_prior(&mut self, value: f64) -> Result<()> {
        self.sorter.set_spike_prior(value)
    }

    /// See [`BotmSorter::set_noise_prior`].
    pub fn set_noise_prior(&mut self, value: f64) -> Result<()> {
        self.sorter.set_noise_prior(value)
    }

    /// Waveforms waiting in the detection buffer.
    pub fn detection_buffer_len(&self) -> usize {
        self.detection.len()
    }

    /// Adds a waveform to the detection buffer, bypassing the detector.
    ///
    /// # Errors
    ///
    /// `DimensionMismatch` if the waveform is not `tf · nc` long.
    pub fn buffer_waveform(&mut self, waveform: Vec<f32>) -> Result<()> {
        let expected = self.sorter.template_length() * self.sorter.bank().nc();
        if waveform.len() != expected {
            return Err(BotmError::DimensionMismatch {
                expected,
                got: waveform.len(),
            });
        }
        self.detection.push(PendingWaveform { waveform, retries: 0 });
        Ok(())
    }

    /// Sorts a whole recording, adapting the model after every chunk.
    pub fn sort(&mut self, data: TraceView<'_>) -> Result<SpikeTrainSet> {
        let chunk_size = self.sorter.config().chunk_size;
        run_chunked(self, data, chunk_size)
    }

    /// Clusters the detection buffer and creates a filter for every cluster
    /// of at least `min_cluster_size` waveforms, from the cluster mean.
    ///
    /// Members of smaller clusters go back into the buffer until they have
    /// been through `max_cluster_retries` passes; then they are dropped.
    /// Returns the ids of the new filters.
    pub fn discover_from_buffer(&mut self) -> Result<Vec<FilterId>> {
        if self.detection.is_empty() {
            return Ok(Vec::new());
        }
        let tf = self.sorter.template_length();
        let raw: Vec<Vec<f32>> = self.detection.iter().map(|p| p.waveform.clone()).collect();

        let whitening = self.sorter.bank().covariance().whitening(tf)?;
        let white = whiten(&raw, &whitening)?;
        let pca = Pca::fit(&white, self.config.pca_components)?;
        let features: Vec<Vec<f32>> = white.iter().map(|w| pca.transform(w)).collect();
        let labels = self.clustering.cluster(&features)?;
        if labels.len() != raw.len() {
            return Err(BotmError::DimensionMismatch {
                expected: raw.len(),
                got: labels.len(),
            });
        }

        let n_clusters = labels.iter().max().map_or(0, |&m| m + 1);
        let mut groups: Vec<Vec<PendingWaveform>> = (0..n_clusters).map(|_| Vec::new()).collect();
        for (pending, &label) in self.detection.drain_all().into_iter().zip(&labels) {
            groups[label].push(pending);
        }

        let mut created = Vec::new();
        let mut requeued = 0usize;
        for group in groups {
            if !group.is_empty() && group.len() >= self.config.min_cluster_size {
                let id = self.sorter.bank_mut().create_filter(mean_waveform(&group))?;
                created.push(id);
                continue;
            }
            for mut pending in group {
                pending.retries += 1;
                if pending.retries <= self.config.max_cluster_retries {
                    self.detection.push(pending);
                    requeued += 1;
                }
            }
        }
        tracing::info!(
            waveforms = raw.len(),
            clusters = n_clusters,
            created = created.len(),
            requeued,
            "detection buffer clustered"
        );
        Ok(created)
    }

    fn learn_noise(
        &mut self,
        data: TraceView<'_>,
        trains: &BTreeMap<FilterId, Vec<i64>>,
        detected: bool,
    ) -> Result<()> {
        let tf = self.sorter.template_length();
        let latency = self.sorter.bank().latency() as i64;
        let ns = data.len();
        let mut epochs = match self.config.learn_noise {
            NoiseLearning::Disabled => return Ok(()),
            NoiseLearning::FromSorting => {
                // centre of each spike's waveform
                let centres: Vec<i64> = trains
                    .values()
                    .flatten()
                    .map(|&peak| peak - latency + (tf / 2) as i64)
                    .collect();
                epochs_from_spike_trains(&centres, (tf, tf), ns).noise
            }
            NoiseLearning::FromDetection => {
                if !detected {
                    return Err(BotmError::config("no detection result for this chunk"));
                }
                self.detector.epochs(true, true)
            }
        };

        if self.config.exclude_artifacts {
            if let Some(artifacts) = self.artifacts.as_mut() {
                artifacts.run(data);
                if let Some(clean) = artifacts.non_artifact_epochs() {
                    epochs = intersect_epochs(&epochs, &clean, ns);
                }
            }
        }
        if epochs.is_empty() {
            return Ok(());
        }
        self.sorter.bank_mut().covariance_mut().update(data, &epochs)?;
        tracing::debug!(epochs = epochs.len(), "noise covariance updated");
        Ok(())
    }

    fn learn_templates(&mut self, data: TraceView<'_>, trains: &BTreeMap<FilterId, Vec<i64>>) -> Result<()> {
        let tf = self.sorter.template_length();
        let latency = self.sorter.bank().latency() as i64;
        let align_at = self.config.align_at(tf);
        let flags = overlaps(trains, tf);

        for (&id, times) in trains {
            let Some(flags) = flags.get(&id) else {
                continue;
            };
            let waveforms: Vec<Vec<f32>> = times
                .iter()
                .zip(flags)
                .filter(|&(_, &overlapping)| !overlapping)
                .filter_map(|(&peak, _)| aligned_waveform(&data, peak - latency, tf, align_at))
                .collect();
            if waveforms.is_empty() {
                continue;
            }
            tracing::debug!(id, waveforms = waveforms.len(), "template update");
            self.sorter.bank_mut().extend_filter(id, waveforms)?;
        }
        Ok(())
    }

    fn discover(&mut self, disc: &Discriminants, detected: bool) -> Result<()> {
        if !detected {
            return Err(BotmError::config("no detection result for this chunk"));
        }
        let tf = self.sorter.template_length();
        let latency = self.sorter.bank().latency();
        let align_at = self.config.align_at(tf);
        let lpn = self.sorter.log_noise_prior();

        let mut unexplained = 0usize;
        for (event, waveform) in self.detector.extract_events(align_at) {
            // the waveform starts `align_at` samples before the event
            let peak = (event + latency).saturating_sub(align_at);
            if !explained(disc, peak, self.config.explain_tolerance, lpn) {
                self.detection.push(PendingWaveform { waveform, retries: 0 });
                unexplained += 1;
            }
        }
        if unexplained > 0 {
            tracing::debug!(unexplained, buffered = self.detection.len(), "unexplained events");
        }

        if self.detection.is_full() {
            self.discover_from_buffer()?;
        }
        Ok(())
    }

    fn retire(&mut self, ns: usize, trains: &BTreeMap<FilterId, Vec<i64>>) -> Result<()> {
        if ns == 0 {
            return Ok(());
        }
        let seconds = ns as f32 / self.config.sample_rate;
        let bank = self.sorter.bank_mut();
        for (&id, times) in trains {
            bank.observe_rate(id, times.len() as f32 / seconds, self.config.rate_smoothing);
            let (snr, rate) = match bank.filter(id) {
                Some(f) if f.is_active() => (f.snr(), f.rate().unwrap_or(0.0)),
                _ => continue,
            };
            if snr < self.config.snr_floor || rate < self.config.rate_floor_hz {
                tracing::info!(id, snr, rate, "retiring filter");
                bank.deactivate(id);
            }
        }
        Ok(())
    }
}

impl<E, D, K> ChunkStages for AbotmSorter<E, D, K>
where
    E: CovarianceEstimator,
    D: SpikeDetector,
    K: Clustering,
{
    fn template_length(&self) -> usize {
        self.sorter.template_length()
    }

    fn active_ids(&self) -> Vec<FilterId> {
        self.sorter.active_ids()
    }

    fn begin(&mut self) -> Result<()> {
        self.detector.reset();
        self.sorter.begin()
    }

    fn filter(&mut self, ctx: &ChunkContext<'_>) -> Result<Trace> {
        self.sorter.filter(ctx)
    }

    fn post_filter(&mut self, ctx: &ChunkContext<'_>, fout: &Trace) -> Result<Discriminants> {
        self.sorter.post_filter(ctx, fout)
    }

    fn sort_chunk(
        &mut self,
        ctx: &ChunkContext<'_>,
        fout: &Trace,
        disc: &Discriminants,
    ) -> Result<ChunkSpikes> {
        self.sorter.sort_chunk(ctx, fout, disc)
    }

    fn post_sort(
        &mut self,
        ctx: &ChunkContext<'_>,
        disc: &Discriminants,
        spikes: &ChunkSpikes,
    ) -> Result<()> {
        let selected = self.sorter.bank().select(ctx.chunk)?;
        let data = selected.view();
        let trains = spikes.trains(&self.sorter.active_ids());

        let detected = match self.detector.run(data) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(offset = ctx.offset, %err, "detector failed");
                false
            }
        };

        let result = self.learn_noise(data, &trains, detected);
        report("noise", ctx.offset, result);
        let result = self.learn_templates(data, &trains);
        report("templates", ctx.offset, result);
        let result = self.discover(disc, detected);
        report("discovery", ctx.offset, result);
        // filters created by discovery are not in `trains` and are spared
        let result = self.retire(data.len(), &trains);
        report("retirement", ctx.offset, result);
        Ok(())
    }
}

fn report(step: &'static str, offset: usize, result: Result<()>) {
    if let Err(err) = result {
        tracing::warn!(step, offset, %err, "adaptive step failed");
    }
}

/// Returns true if any discriminant reaches `lpn` within `tol` samples of
/// `peak`.
fn explained(disc: &Discriminants, peak: usize, tol: usize, lpn: f32) -> bool {
    let lo = peak.saturating_sub(tol);
    let hi = (peak + tol + 1).min(disc.len());
    (lo..hi).any(|t| disc.row_max(t).is_some_and(|m| m >= lpn))
}

/// Cuts `tf` samples so that the waveform minimum within
/// `[onset, onset + tf)` lands on `align_at`.
fn aligned_waveform(data: &TraceView<'_>, onset: i64, tf: usize, align_at: usize) -> Option<Vec<f32>> {
    if onset < 0 || onset as usize + tf > data.len() {
        return None;
    }
    let onset = onset as usize;
    let mut min = (onset, f32::INFINITY);
    for t in onset..onset + tf {
        for &v in data.sample(t) {
            if v < min.1 {
                min = (t, v);
            }
        }
    }
    data.concatenated_window(min.0 as isize - align_at as isize, tf)
}

fn mean_waveform(group: &[PendingWaveform]) -> Vec<f32> {
    let len = group.first().map_or(0, |p| p.waveform.len());
    let mut mean = vec![0.0f32; len];
    for p in group {
        for (m, &v) in mean.iter_mut().zip(&p.waveform) {
            *m += v;
        }
    }
    let n = group.len().max(1) as f32;
    mean.iter_mut().for_each(|m| *m /= n);
    mean
}

fn intersect_epochs(a: &[Epoch], b: &[Epoch], len: usize) -> Vec<Epoch> {
    let mask: Vec<bool> = mask_from_epochs(a, len)
        .into_iter()
        .zip(mask_from_epochs(b, len))
        .map(|(x, y)| x && y)
        .collect();
    epochs_from_mask(&mask)
}
