use alloc::vec;
use alloc::vec::Vec;

use super::{FilterBank, FilterId, MatchedFilter};
use crate::covariance::CovarianceEstimator;
use crate::error::{BotmError, Result};
use crate::linalg::Matrix;
use crate::trace::{Trace, TraceView};
use crate::xcorr::mc_xcorr;

/// Filter bank owning its filters and the noise covariance estimator.
///
/// The cross-correlation cache is a `[k × k × (2·tf − 1)]` tensor over the
/// active filters. Any template, active-set or covariance change marks it
/// stale; it is rebuilt at the start of the next [`apply`](FilterBank::apply),
/// so a chunk is always filtered against a consistent model. If the
/// estimator cannot be inverted at that point, the last inverse that worked
/// is reused and a warning is logged.
#[derive(Debug, Clone)]
pub struct MatchedFilterBank<E> {
    tf: usize,
    channels: Vec<usize>,
    filters: Vec<MatchedFilter>,
    active: Vec<FilterId>,
    estimator: E,
    capacity: usize,
    history: Trace,
    xcorrs: Vec<f32>,
    inverse: Option<Matrix>,
    stale: bool,
}

impl<E: CovarianceEstimator> MatchedFilterBank<E> {
    /// Creates an empty bank for templates of `tf` samples on the given
    /// input channels. `capacity` bounds each filter's waveform buffer.
    ///
    /// # Errors
    ///
    /// `Configuration` if `tf` is zero, the channel set is empty, or the
    /// estimator cannot serve windows of `tf` samples; `DimensionMismatch`
    /// if the estimator's channel count differs from the channel set.
    pub fn new(tf: usize, channels: Vec<usize>, estimator: E, capacity: usize) -> Result<Self> {
        if tf == 0 {
            return Err(BotmError::config("template length must be positive"));
        }
        if channels.is_empty() {
            return Err(BotmError::config("filter bank needs at least one channel"));
        }
        if estimator.channels() != channels.len() {
            return Err(BotmError::DimensionMismatch {
                expected: channels.len(),
                got: estimator.channels(),
            });
        }
        if estimator.max_lag() < tf {
            return Err(BotmError::config(alloc::format!(
                "covariance estimator covers {} lags, templates need {}",
                estimator.max_lag(),
                tf
            )));
        }
        let nc = channels.len();
        Ok(Self {
            tf,
            channels,
            filters: Vec::new(),
            active: Vec::new(),
            estimator,
            capacity,
            history: Trace::zeros(super::latency(tf), nc),
            xcorrs: Vec::new(),
            inverse: None,
            stale: true,
        })
    }

    /// Number of channels each template spans.
    pub fn nc(&self) -> usize {
        self.channels.len()
    }

    /// Every filter ever created, indexed by id.
    pub fn filters(&self) -> &[MatchedFilter] {
        &self.filters
    }

    /// Noise covariance estimator shared by all filters.
    pub fn covariance(&self) -> &E {
        &self.estimator
    }

    /// Mutable access to the estimator. Marks the cache stale.
    pub fn covariance_mut(&mut self) -> &mut E {
        self.stale = true;
        &mut self.estimator
    }

    /// Returns true if the next `apply` will rebuild the cache.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Copies the bank's channels out of a full-width chunk.
    pub fn select(&self, chunk: TraceView<'_>) -> Result<Trace> {
        chunk.select_channels(&self.channels)
    }

    /// Updates a filter's smoothed firing rate. Unknown ids are ignored.
    pub fn observe_rate(&mut self, id: FilterId, observed: f32, alpha: f32) {
        if let Some(f) = self.filters.get_mut(id) {
            f.observe_rate(observed, alpha);
        }
    }

    #[inline]
    fn lags(&self) -> usize {
        2 * self.tf - 1
    }

    #[inline]
    fn xcorr_index(&self, i: usize, j: usize) -> usize {
        (i * self.active.len() + j) * self.lags()
    }
}

impl<E: CovarianceEstimator> FilterBank for MatchedFilterBank<E> {
    fn template_length(&self) -> usize {
        self.tf
    }

    fn channels(&self) -> &[usize] {
        &self.channels
    }

    fn active_ids(&self) -> &[FilterId] {
        &self.active
    }

    fn filter(&self, id: FilterId) -> Option<&MatchedFilter> {
        self.filters.get(id)
    }

    fn apply_with_lookahead(&mut self, chunk: TraceView<'_>, ahead: TraceView<'_>) -> Result<Trace> {
        if self.filters.is_empty() {
            return Err(BotmError::config("filter bank has no templates"));
        }
        let k = self.active.len();
        if self.stale && k > 0 {
            self.rebuild_cache()?;
        }

        let x = self.select(chunk)?;
        let ns = x.len();
        let nc = self.nc();
        let tf = self.tf;
        let hist = self.history.len();
        let reach = tf - 1 - hist;

        // history, the new samples, then up to `reach` samples of lookahead
        let mut ext = Trace::zeros(hist + ns + reach, nc);
        ext.as_mut_slice()[..hist * nc].copy_from_slice(self.history.as_slice());
        ext.as_mut_slice()[hist * nc..(hist + ns) * nc].copy_from_slice(x.as_slice());
        let peek = self.select(ahead.slice(0, reach.min(ahead.len())))?;
        ext.as_mut_slice()[(hist + ns) * nc..(hist + ns + peek.len()) * nc]
            .copy_from_slice(peek.as_slice());

        let mut out = Trace::zeros(ns, k);
        for (col, &id) in self.active.iter().enumerate() {
            let coef = self.filters[id].coefficients();
            for t in 0..ns {
                let mut acc = 0.0f32;
                for c in 0..nc {
                    let taps = &coef[c * tf..(c + 1) * tf];
                    for (kk, &w) in taps.iter().enumerate() {
                        acc += w * ext.get(t + kk, c);
                    }
                }
                out.set(t, col, acc);
            }
        }

        // last `hist` samples of history followed by chunk
        self.history
            .as_mut_slice()
            .copy_from_slice(&ext.as_slice()[ns * nc..(ns + hist) * nc]);
        Ok(out)
    }

    fn xcorr_self(&self, i: usize) -> f32 {
        self.xcorrs[self.xcorr_index(i, i) + self.tf - 1]
    }

    fn xcorr_pair(&self, i: usize, j: usize, tau: isize) -> f32 {
        let lag = tau + self.tf as isize - 1;
        if lag < 0 || lag as usize >= self.lags() {
            return 0.0;
        }
        self.xcorrs[self.xcorr_index(i, j) + lag as usize]
    }

    fn xcorr_lags(&self, i: usize, j: usize) -> &[f32] {
        let start = self.xcorr_index(i, j);
        &self.xcorrs[start..start + self.lags()]
    }

    fn rebuild_cache(&mut self) -> Result<()> {
        let inverse = match (self.estimator.inverse(self.tf), self.inverse.take()) {
            (Ok(inverse), _) => inverse,
            (Err(err), Some(previous)) => {
                tracing::warn!(%err, "noise covariance not invertible, keeping previous whitening");
                previous
            }
            (Err(err), None) => return Err(err),
        };
        for &id in &self.active {
            self.filters[id].whiten(&inverse);
        }

        let k = self.active.len();
        let (tf, nc) = (self.tf, self.nc());
        let mut xcorrs = vec![0.0f32; k * k * self.lags()];
        for (i, &fi) in self.active.iter().enumerate() {
            for (j, &fj) in self.active.iter().enumerate() {
                let lags = mc_xcorr(
                    self.filters[fj].coefficients(),
                    self.filters[fi].template(),
                    tf,
                    nc,
                );
                let start = (i * k + j) * lags.len();
                xcorrs[start..start + lags.len()].copy_from_slice(&lags);
            }
        }
        self.xcorrs = xcorrs;
        self.inverse = Some(inverse);
        self.stale = false;
        tracing::debug!(filters = k, tf, "filter bank cache rebuilt");
        Ok(())
    }

    fn create_filter(&mut self, template: Vec<f32>) -> Result<FilterId> {
        let filter = MatchedFilter::new(template, self.tf, self.nc(), self.capacity)?;
        let id = self.filters.len();
        self.filters.push(filter);
        self.active.push(id);
        self.stale = true;
        tracing::info!(id, "filter created");
        Ok(id)
    }

    fn deactivate(&mut self, id: FilterId) {
        if let Some(f) = self.filters.get_mut(id) {
            if f.is_active() {
                f.set_active(false);
                self.active.retain(|&a| a != id);
                self.stale = true;
                tracing::info!(id, "filter deactivated");
            }
        }
    }

    fn extend_filter(&mut self, id: FilterId, waveforms: Vec<Vec<f32>>) -> Result<()> {
        let filter = self
            .filters
            .get_mut(id)
            .ok_or_else(|| BotmError::config(alloc::format!("unknown filter id {}", id)))?;
        filter.extend(waveforms)?;
        self.stale = true;
        Ok(())
    }

    fn reset_history(&mut self) {
        self.history = Trace::zeros(super::latency(self.tf), self.nc());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance::TimeSeriesCovariance;

    fn bank(tf: usize, nc: usize) -> MatchedFilterBank<TimeSeriesCovariance> {
        let ce = TimeSeriesCovariance::new(nc, tf).unwrap();
        MatchedFilterBank::new(tf, (0..nc).collect(), ce, 10).unwrap()
    }

    #[test]
    fn test_construction_checks() {
        let ce = TimeSeriesCovariance::new(2, 4).unwrap();
        assert!(MatchedFilterBank::new(4, vec![0], ce.clone(), 10).is_err());
        assert!(MatchedFilterBank::new(0, vec![0, 1], ce.clone(), 10).is_err());
        assert!(MatchedFilterBank::new(5, vec![0, 1], ce.clone(), 10).is_err());
        assert!(MatchedFilterBank::new(4, vec![], ce, 10).is_err());
    }

    #[test]
    fn test_apply_without_templates_fails() {
        let mut b = bank(3, 1);
        let data = [0.0f32; 10];
        let err = b.apply(TraceView::new(&data, 1).unwrap()).unwrap_err();
        assert!(matches!(err, BotmError::Configuration(_)));
    }

    #[test]
    fn test_peak_at_latency() {
        let mut b = bank(3, 1);
        b.create_filter(vec![1.0, 2.0, 3.0]).unwrap();
        let mut data = vec![0.0f32; 20];
        data[5..8].copy_from_slice(&[1.0, 2.0, 3.0]);
        let out = b.apply(TraceView::new(&data, 1).unwrap()).unwrap();
        assert_eq!(out.channels(), 1);
        assert_eq!(b.latency(), 2);
        let col = out.column(0);
        assert_eq!(col[7], 14.0);
        assert_eq!(b.xcorr_self(0), 14.0);
        let (peak, _) = crate::xcorr::find_peak(&col);
        assert_eq!(peak, 7);
    }

    #[test]
    fn test_peak_lands_before_template_end() {
        let mut b = bank(8, 1);
        let template = [0.0f32, -2.0, -5.0, -3.0, 1.0, 2.0, 1.0, 0.0];
        b.create_filter(template.to_vec()).unwrap();
        let mut data = vec![0.0f32; 40];
        data[10..18].copy_from_slice(&template);
        let out = b.apply(TraceView::new(&data, 1).unwrap()).unwrap();
        let (peak, value) = crate::xcorr::find_peak(&out.column(0));
        assert_eq!(b.latency(), 6);
        assert_eq!(peak, 16);
        assert_eq!(value, b.xcorr_self(0));
    }

    #[test]
    fn test_chunked_apply_matches_whole() {
        let mut b = bank(8, 2);
        b.create_filter(vec![
            1.0, -1.0, 2.0, 0.5, 0.0, 1.0, -2.0, 1.0, 0.5, 0.0, -1.0, 3.0, 1.0, 0.0, 0.0, -0.5,
        ])
        .unwrap();
        let data: Vec<f32> = (0..120).map(|i| ((i * 7) % 11) as f32 - 5.0).collect();
        let view = TraceView::new(&data, 2).unwrap();

        let whole = b.apply(view).unwrap();
        b.reset_history();
        let first = b.apply_with_lookahead(view.slice(0, 13), view.slice(13, 21)).unwrap();
        // chunk shorter than the history
        let second = b.apply_with_lookahead(view.slice(13, 16), view.slice(16, 24)).unwrap();
        let third = b.apply(view.slice(16, 60)).unwrap();
        let joined: Vec<f32> = first
            .column(0)
            .into_iter()
            .chain(second.column(0))
            .chain(third.column(0))
            .collect();
        assert_eq!(joined, whole.column(0));
    }

    #[test]
    fn test_history_advances_without_active_filters() {
        let template = vec![0.0f32, -2.0, -5.0, -3.0, 1.0, 2.0, 1.0, 0.0];
        let mut data = vec![0.0f32; 60];
        data[26..34].copy_from_slice(&template);
        let view = TraceView::new(&data, 1).unwrap();

        let mut reference = bank(8, 1);
        reference.create_filter(template.clone()).unwrap();
        let whole = reference.apply(view).unwrap();

        let mut b = bank(8, 1);
        let first = b.create_filter(vec![1.0; 8]).unwrap();
        b.deactivate(first);
        let out = b.apply_with_lookahead(view.slice(0, 30), view.slice(30, 38)).unwrap();
        assert_eq!(out.channels(), 0);

        // a filter created mid-recording sees the samples before its first chunk
        b.create_filter(template).unwrap();
        let out = b.apply(view.slice(30, 60)).unwrap();
        assert_eq!(out.column(0), whole.column(0)[30..].to_vec());
    }

    /// Identity covariance that can be told to stop inverting.
    #[derive(Debug, Clone)]
    struct Flaky {
        broken: bool,
    }

    impl CovarianceEstimator for Flaky {
        fn channels(&self) -> usize {
            1
        }

        fn max_lag(&self) -> usize {
            4
        }

        fn update(&mut self, _data: TraceView<'_>, _epochs: &[crate::epochs::Epoch]) -> Result<()> {
            Ok(())
        }

        fn covariance(&self, tf: usize) -> Result<Matrix> {
            if self.broken {
                return Err(crate::linalg::LinalgError::NotPositiveDefinite.into());
            }
            Ok(Matrix::identity(tf))
        }
    }

    #[test]
    fn test_failed_inverse_keeps_previous_whitening() {
        let data: Vec<f32> = (0..30).map(|i| ((i * 5) % 7) as f32 - 3.0).collect();
        let view = TraceView::new(&data, 1).unwrap();
        let mut b = MatchedFilterBank::new(4, vec![0], Flaky { broken: false }, 10).unwrap();
        b.create_filter(vec![1.0, 3.0, -1.0, 0.0]).unwrap();
        let before = b.apply(view).unwrap();

        b.covariance_mut().broken = true;
        assert!(b.is_stale());
        b.reset_history();
        let after = b.apply(view).unwrap();
        assert_eq!(after, before);
        assert!(!b.is_stale());

        let mut fresh = MatchedFilterBank::new(4, vec![0], Flaky { broken: true }, 10).unwrap();
        fresh.create_filter(vec![1.0, 3.0, -1.0, 0.0]).unwrap();
        assert!(matches!(fresh.apply(view), Err(BotmError::Linalg(_))));
    }

    #[test]
    fn test_xcorr_pair_matches_filter_response() {
        let mut b = bank(4, 1);
        let t0 = vec![1.0f32, 3.0, -1.0, 0.0];
        let t1 = vec![0.0f32, 2.0, 2.0, -1.0];
        b.create_filter(t0.clone()).unwrap();
        b.create_filter(t1).unwrap();

        let mut data = vec![0.0f32; 30];
        data[10..14].copy_from_slice(&t0);
        let out = b.apply(TraceView::new(&data, 1).unwrap()).unwrap();
        // template 0 at onset 10 peaks at 10 + latency; filter 1 at peak + tau
        let peak = 10 + b.latency() as isize;
        for tau in -3isize..=3 {
            let t = (peak + tau) as usize;
            assert_eq!(out.get(t, 1), b.xcorr_pair(0, 1, tau));
        }
        assert_eq!(b.xcorr_pair(0, 1, 4), 0.0);
    }

    #[test]
    fn test_deactivate_and_stale_cache() {
        let mut b = bank(2, 1);
        let a = b.create_filter(vec![1.0, 0.0]).unwrap();
        let c = b.create_filter(vec![0.0, 1.0]).unwrap();
        let data = [0.0f32; 4];
        b.apply(TraceView::new(&data, 1).unwrap()).unwrap();
        assert!(!b.is_stale());

        b.deactivate(a);
        assert!(b.is_stale());
        assert_eq!(b.active_ids(), &[c]);
        assert!(!b.filter(a).unwrap().is_active());
        let out = b.apply(TraceView::new(&data, 1).unwrap()).unwrap();
        assert_eq!(out.channels(), 1);

        b.extend_filter(c, vec![vec![2.0, 1.0]]).unwrap();
        assert!(b.is_stale());
        assert!(b.extend_filter(99, vec![]).is_err());
        b.covariance_mut();
        assert!(b.is_stale());
    }
}
