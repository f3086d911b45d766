//! Bayes optimal template matching sorter.
//!
//! [`BotmSorter`] owns a matched filter bank and sorts recordings chunk by
//! chunk: filter outputs become log-posterior discriminants, candidate
//! epochs are thresholded at `ln(p_noise)`, and every epoch is resolved with
//! the configured strategy.
//!
//! # Example
//!
//! ```
//! use botm::{BotmConfig, BotmSorter, TraceView};
//! use botm::covariance::TimeSeriesCovariance;
//!
//! let template = vec![0.0, -6.0, -15.0, -9.0, 3.0, 6.0, 3.0, 0.0];
//! let mut data = vec![0.0f32; 400];
//! data[100..108].copy_from_slice(&template);
//!
//! let ce = TimeSeriesCovariance::new(1, 8).unwrap();
//! let mut sorter = BotmSorter::new(vec![template], 8, ce, BotmConfig::default()).unwrap();
//! let spikes = sorter.sort(TraceView::new(&data, 1).unwrap()).unwrap();
//! // onset 100, reported round(tf / 4) samples later
//! assert_eq!(spikes.get(0), Some(&[102i64][..]));
//! ```

use alloc::vec::Vec;

use crate::config::{BotmConfig, Resolution};
use crate::covariance::CovarianceEstimator;
use crate::discriminant::{build_discriminants, Discriminants};
use crate::engine::{run_chunked, ChunkContext, ChunkSpikes, ChunkStages, SpikeTrainSet};
use crate::error::{BotmError, Result};
use crate::filter::{FilterBank, FilterId, MatchedFilterBank};
use crate::resolver::EpochResolver;
use crate::trace::{Trace, TraceView};

/// Chunked BOTM spike sorter.
#[derive(Debug, Clone)]
pub struct BotmSorter<E> {
    bank: MatchedFilterBank<E>,
    config: BotmConfig,
    log_spike_prior: f32,
    log_noise_prior: f32,
}

impl<E: CovarianceEstimator> BotmSorter<E> {
    /// Builds a sorter from initial templates (channel-major, `tf` samples
    /// per channel).
    ///
    /// # Errors
    ///
    /// `Configuration` if `templates` is empty or the configuration is
    /// inconsistent; `Value` for priors that are not positive.
    pub fn new(templates: Vec<Vec<f32>>, tf: usize, estimator: E, config: BotmConfig) -> Result<Self> {
        if templates.is_empty() {
            return Err(BotmError::config("at least one template is required"));
        }
        let channels = config
            .bank
            .channels
            .clone()
            .unwrap_or_else(|| (0..estimator.channels()).collect());
        let mut bank = MatchedFilterBank::new(tf, channels, estimator, config.bank.buffer_capacity)?;
        for template in templates {
            bank.create_filter(template)?;
        }
        Self::with_bank(bank, config)
    }

    /// Wraps an existing bank.
    pub fn with_bank(bank: MatchedFilterBank<E>, config: BotmConfig) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(BotmError::config("chunk size must be positive"));
        }
        let mut sorter = Self {
            bank,
            log_spike_prior: 0.0,
            log_noise_prior: 0.0,
            config,
        };
        sorter.set_spike_prior(sorter.config.spike_prior)?;
        sorter.set_noise_prior(sorter.config.noise_prior)?;
        Ok(sorter)
    }

    /// Sets the per-unit spike prior.
    ///
    /// # Errors
    ///
    /// `Value` if `value <= 0`; the sorter is left unchanged.
    pub fn set_spike_prior(&mut self, value: f64) -> Result<()> {
        self.log_spike_prior = log_prior("spike_prior", value)?;
        self.config.spike_prior = value;
        Ok(())
    }

    /// Sets the noise prior, whose log is the detection threshold.
    ///
    /// # Errors
    ///
    /// `Value` if `value <= 0`; the sorter is left unchanged.
    pub fn set_noise_prior(&mut self, value: f64) -> Result<()> {
        self.log_noise_prior = log_prior("noise_prior", value)?;
        self.config.noise_prior = value;
        Ok(())
    }

    /// Prior probability of a spike of one unit at one sample.
    pub fn spike_prior(&self) -> f64 {
        self.config.spike_prior
    }

    pub fn noise_prior(&self) -> f64 {
        self.config.noise_prior
    }

    pub fn log_spike_prior(&self) -> f32 {
        self.log_spike_prior
    }

    /// Natural logarithm of the noise prior, the epoch threshold.
    pub fn log_noise_prior(&self) -> f32 {
        self.log_noise_prior
    }

    pub fn config(&self) -> &BotmConfig {
        &self.config
    }

    /// Filter bank holding templates, filters and the noise estimator.
    pub fn bank(&self) -> &MatchedFilterBank<E> {
        &self.bank
    }

    pub fn bank_mut(&mut self) -> &mut MatchedFilterBank<E> {
        &mut self.bank
    }

    /// Resolver configured for this sorter's strategy and priors.
    pub fn resolver(&self) -> EpochResolver {
        EpochResolver::new(
            self.bank.template_length(),
            self.log_spike_prior,
            self.log_noise_prior,
            *self.config.epoch_policy(),
        )
    }

    /// Sorts a whole recording (`[samples × channels]`).
    pub fn sort(&mut self, data: TraceView<'_>) -> Result<SpikeTrainSet> {
        let chunk_size = self.config.chunk_size;
        run_chunked(self, data, chunk_size)
    }

    /// Normalised posterior of each active unit for one concatenated
    /// waveform, in `active_ids` order.
    ///
    /// Uses `ln p_i = −½ (x − ξ_i)ᵀ C⁻¹ (x − ξ_i) + ln(p_spike)`.
    pub fn posterior(&self, waveform: &[f32]) -> Result<Vec<f32>> {
        let tf = self.bank.template_length();
        let n = tf * self.bank.nc();
        if waveform.len() != n {
            return Err(BotmError::DimensionMismatch {
                expected: n,
                got: waveform.len(),
            });
        }
        let inverse = self.bank.covariance().inverse(tf)?;

        let mut log_p = Vec::with_capacity(self.bank.active_ids().len());
        for &id in self.bank.active_ids() {
            let Some(filter) = self.bank.filter(id) else {
                continue;
            };
            let resid: Vec<f64> = waveform
                .iter()
                .zip(filter.template())
                .map(|(&x, &m)| (x - m) as f64)
                .collect();
            let maha: f64 = inverse
                .mul_vec(&resid)
                .iter()
                .zip(&resid)
                .map(|(a, b)| a * b)
                .sum();
            log_p.push(-0.5 * maha + self.log_spike_prior as f64);
        }

        let max = log_p.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let weights: Vec<f64> = log_p.iter().map(|&lp| libm::exp(lp - max)).collect();
        let total: f64 = weights.iter().sum();
        Ok(weights.into_iter().map(|w| (w / total) as f32).collect())
    }
}

fn log_prior(name: &'static str, value: f64) -> Result<f32> {
    if value.is_nan() || value <= 0.0 {
        return Err(BotmError::Value { name, value });
    }
    Ok(libm::log(value) as f32)
}

impl<E: CovarianceEstimator> ChunkStages for BotmSorter<E> {
    fn template_length(&self) -> usize {
        self.bank.template_length()
    }

    fn active_ids(&self) -> Vec<FilterId> {
        self.bank.active_ids().to_vec()
    }

    fn begin(&mut self) -> Result<()> {
        self.bank.reset_history();
        Ok(())
    }

    fn filter(&mut self, ctx: &ChunkContext<'_>) -> Result<Trace> {
        // runs without active filters too, to keep the history current
        self.bank.apply_with_lookahead(ctx.chunk, ctx.ahead)
    }

    fn post_filter(&mut self, _ctx: &ChunkContext<'_>, fout: &Trace) -> Result<Discriminants> {
        let taus: &[isize] = match &self.config.resolution {
            Resolution::Sic => &[],
            Resolution::OverlapChannels { taus } => taus,
        };
        Ok(build_discriminants(fout, &self.bank, self.log_spike_prior, taus))
    }

    fn sort_chunk(
        &mut self,
        ctx: &ChunkContext<'_>,
        fout: &Trace,
        disc: &Discriminants,
    ) -> Result<ChunkSpikes> {
        let mut spikes = ChunkSpikes::default();
        let resolver = self.resolver();
        let epochs = resolver.candidate_epochs(disc);
        if epochs.is_empty() {
            return Ok(spikes);
        }

        let assignments = match self.config.resolution {
            Resolution::Sic => resolver.resolve_sic(disc, fout, &self.bank, &epochs, ctx.offset),
            Resolution::OverlapChannels { .. } => resolver.resolve_overlap(disc, &epochs),
        };
        let ids = self.bank.active_ids();
        for a in assignments {
            spikes.push(ids[a.filter], a.time);
        }
        tracing::debug!(
            offset = ctx.offset,
            epochs = epochs.len(),
            spikes = spikes.len(),
            "epochs resolved"
        );
        Ok(spikes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance::TimeSeriesCovariance;
    use alloc::vec;

    const TF: usize = 8;
    const UNIT_A: [f32; 8] = [0.0, -6.0, -15.0, -9.0, 3.0, 6.0, 3.0, 0.0];
    const UNIT_B: [f32; 8] = [0.0, 9.0, 12.0, -3.0, -12.0, -6.0, 0.0, 0.0];

    fn sorter(templates: &[[f32; 8]], config: BotmConfig) -> BotmSorter<TimeSeriesCovariance> {
        let ce = TimeSeriesCovariance::new(1, TF).unwrap();
        BotmSorter::new(templates.iter().map(|t| t.to_vec()).collect(), TF, ce, config).unwrap()
    }

    fn insert(data: &mut [f32], onset: usize, template: &[f32]) {
        for (k, v) in template.iter().enumerate() {
            data[onset + k] += v;
        }
    }

    fn overlap_config() -> BotmConfig {
        BotmConfig {
            resolution: Resolution::OverlapChannels {
                taus: (-4..=4).collect(),
            },
            ..BotmConfig::default()
        }
    }

    #[test]
    fn test_single_template_both_strategies() {
        let mut data = vec![0.0f32; 400];
        insert(&mut data, 100, &UNIT_A);
        let expected = 100 + 2;

        for config in [BotmConfig::default(), overlap_config()] {
            let mut s = sorter(&[UNIT_A, UNIT_B], config);
            let set = s.sort(TraceView::new(&data, 1).unwrap()).unwrap();
            assert_eq!(set.get(0), Some(&[expected][..]));
            assert_eq!(set.get(1), Some(&[][..]));
        }
    }

    #[test]
    fn test_chunk_size_invariance() {
        let mut data = vec![0.0f32; 1000];
        insert(&mut data, 50, &UNIT_A);
        insert(&mut data, 500, &UNIT_B);

        for chunk_size in [100, 300, 1000, 100_000] {
            for resolution in [BotmConfig::default(), overlap_config()] {
                let config = BotmConfig {
                    chunk_size,
                    ..resolution
                };
                let mut s = sorter(&[UNIT_A, UNIT_B], config);
                let set = s.sort(TraceView::new(&data, 1).unwrap()).unwrap();
                assert_eq!(set.get(0), Some(&[52i64][..]), "chunk size {}", chunk_size);
                assert_eq!(set.get(1), Some(&[502i64][..]), "chunk size {}", chunk_size);
            }
        }
    }

    #[test]
    fn test_repeated_sort_is_independent() {
        let mut data = vec![0.0f32; 300];
        insert(&mut data, 290, &UNIT_A);
        let mut s = sorter(&[UNIT_A], BotmConfig::default());
        let first = s.sort(TraceView::new(&data, 1).unwrap()).unwrap();
        let second = s.sort(TraceView::new(&data, 1).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_priors_rejected() {
        let mut s = sorter(&[UNIT_A], BotmConfig::default());
        for bad in [0.0, -1.0, f64::NAN] {
            let err = s.set_noise_prior(bad).unwrap_err();
            assert!(matches!(err, BotmError::Value { name: "noise_prior", .. }));
            assert!(s.set_spike_prior(bad).is_err());
        }
        assert_eq!(s.noise_prior(), 1.0);
        assert_eq!(s.log_noise_prior(), 0.0);
        assert_eq!(s.spike_prior(), 1e-6);

        s.set_noise_prior(0.5).unwrap();
        assert_eq!(s.noise_prior(), 0.5);
    }

    #[test]
    fn test_construction_errors() {
        let ce = TimeSeriesCovariance::new(1, TF).unwrap();
        let err = BotmSorter::new(Vec::new(), TF, ce.clone(), BotmConfig::default()).unwrap_err();
        assert!(matches!(err, BotmError::Configuration(_)));

        let config = BotmConfig {
            spike_prior: 0.0,
            ..BotmConfig::default()
        };
        let err = BotmSorter::new(vec![UNIT_A.to_vec()], TF, ce.clone(), config).unwrap_err();
        assert!(matches!(err, BotmError::Value { .. }));

        let err = BotmSorter::new(vec![vec![1.0; 5]], TF, ce, BotmConfig::default()).unwrap_err();
        assert!(matches!(err, BotmError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_no_active_filters_is_noop() {
        let mut data = vec![0.0f32; 200];
        insert(&mut data, 50, &UNIT_A);
        let mut s = sorter(&[UNIT_A], BotmConfig::default());
        s.bank_mut().deactivate(0);
        let set = s.sort(TraceView::new(&data, 1).unwrap()).unwrap();
        assert_eq!(set.total_spikes(), 0);
    }

    #[test]
    fn test_posterior_prefers_matching_unit() {
        let s = sorter(&[UNIT_A, UNIT_B], BotmConfig::default());
        let p = s.posterior(&UNIT_B).unwrap();
        assert_eq!(p.len(), 2);
        assert!(p[1] > 0.99);
        assert!(libm::fabsf(p[0] + p[1] - 1.0) < 1e-6);
        assert!(s.posterior(&[0.0; 3]).is_err());
    }

    #[test]
    fn test_channel_subset() {
        // unit lives on input channel 2 of 3
        let mut data = vec![0.0f32; 3 * 300];
        for (k, v) in UNIT_A.iter().enumerate() {
            data[(120 + k) * 3 + 2] = *v;
            data[(120 + k) * 3] = 100.0;
        }
        let ce = TimeSeriesCovariance::new(1, TF).unwrap();
        let config = BotmConfig {
            bank: crate::config::BankConfig {
                channels: Some(vec![2]),
                ..Default::default()
            },
            ..BotmConfig::default()
        };
        let mut s = BotmSorter::new(vec![UNIT_A.to_vec()], TF, ce, config).unwrap();
        let set = s.sort(TraceView::new(&data, 3).unwrap()).unwrap();
        assert_eq!(set.get(0), Some(&[122i64][..]));
    }
}
