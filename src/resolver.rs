//! Epoch extraction and spike assignment on a discriminant surface.
//!
//! Candidate epochs are the runs where the best valid discriminant of a
//! sample exceeds `ln(p_noise)`. They are widened, merged, and each merged
//! epoch is resolved into unit assignments by one of two strategies:
//!
//! - overlap channels: one argmax per epoch over single-unit and pairwise
//!   overlap columns
//! - subtractive interference cancellation (SIC): repeatedly take the best
//!   unit, subtract its expected filter response from the epoch and search
//!   again until nothing exceeds the threshold

use alloc::vec;
use alloc::vec::Vec;

use crate::config::{EpochPolicy, Widening};
use crate::discriminant::{Column, Discriminants};
use crate::epochs::{epochs_from_mask, merge_epochs, Epoch};
use crate::filter::FilterBank;
use crate::trace::Trace;

/// A spike of the active filter at position `filter`, at chunk-local
/// sample `time` (the discriminant peak).
///
/// Assignments order by filter position first, then by time.
///
/// # Example
///
/// ```
/// use botm::resolver::Assignment;
///
/// let mut spikes = vec![
///     Assignment { filter: 1, time: 4 },
///     Assignment { filter: 0, time: 9 },
/// ];
/// spikes.sort();
/// assert_eq!(spikes[0].filter, 0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Assignment {
    /// Position of the unit among the active filters, not its `FilterId`.
    pub filter: usize,
    /// Chunk-local sample of the discriminant peak.
    pub time: usize,
}

/// Result of resolving one epoch with SIC.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SicEpoch {
    /// Accepted spikes in the order they were subtracted.
    pub spikes: Vec<Assignment>,
    /// Subtraction attempts made, never more than twice the filter count.
    pub iterations: usize,
}

/// Thresholds, widens, merges and resolves epochs for one chunk.
///
/// The resolver holds no per-chunk state; a sorter builds a fresh one from
/// its current priors before each chunk.
///
/// # Example
///
/// ```
/// use botm::resolver::EpochResolver;
/// use botm::EpochPolicy;
///
/// let resolver = EpochResolver::new(32, -4.6, 0.0, EpochPolicy::default());
/// assert_eq!(resolver.noise_threshold(), 0.0);
/// ```
#[derive(Debug, Clone)]
pub struct EpochResolver {
    tf: usize,
    log_spike_prior: f32,
    log_noise_prior: f32,
    policy: EpochPolicy,
}

impl EpochResolver {
    /// Resolver for templates of `tf` samples. The priors are natural
    /// logarithms; `log_noise_prior` is the epoch threshold.
    pub fn new(tf: usize, log_spike_prior: f32, log_noise_prior: f32, policy: EpochPolicy) -> Self {
        Self {
            tf,
            log_spike_prior,
            log_noise_prior,
            policy,
        }
    }

    /// Threshold a discriminant must exceed to open an epoch.
    pub fn noise_threshold(&self) -> f32 {
        self.log_noise_prior
    }

    /// Widened and merged candidate epochs of `disc`, sorted by start.
    pub fn candidate_epochs(&self, disc: &Discriminants) -> Vec<Epoch> {
        let ns = disc.len();
        if disc.columns() == 0 || ns == 0 {
            return Vec::new();
        }
        let mask: Vec<bool> = (0..ns)
            .map(|t| disc.row_max(t).is_some_and(|m| m > self.log_noise_prior))
            .collect();

        let widened: Vec<Epoch> = epochs_from_mask(&mask)
            .into_iter()
            .map(|ep| match self.policy.widening {
                Widening::Symmetric { min_width_factor } => {
                    let min_width = libm::floorf(min_width_factor * self.tf as f32) as usize;
                    ep.widen(min_width, ns)
                }
                Widening::PeakAligned { align_at } => {
                    let peak = (ep.start..ep.end)
                        .filter_map(|t| disc.row_max(t).map(|m| (t, m)))
                        .fold(None, |best: Option<(usize, f32)>, (t, m)| match best {
                            Some((_, b)) if b >= m => best,
                            _ => Some((t, m)),
                        })
                        .map_or(ep.start, |(t, _)| t);
                    let start = peak.saturating_sub(align_at);
                    Epoch::new(
                        start.min(ep.start),
                        (start + self.tf).max(ep.end).min(ns),
                    )
                }
            })
            .collect();

        merge_epochs(&widened, self.policy.merge_distance(self.tf))
    }

    /// Overlap-channel strategy: one decision per epoch.
    pub fn resolve_overlap(&self, disc: &Discriminants, epochs: &[Epoch]) -> Vec<Assignment> {
        let mut out = Vec::new();
        for ep in epochs {
            let Some((t, col)) = disc.argmax(ep.start..ep.end) else {
                continue;
            };
            match disc.column(col) {
                Column::Filter(i) => out.push(Assignment { filter: i, time: t }),
                Column::Overlap(oc) => {
                    out.push(Assignment {
                        filter: oc.f0,
                        time: t,
                    });
                    out.push(Assignment {
                        filter: oc.f1,
                        time: (t as isize + oc.tau) as usize,
                    });
                }
            }
        }
        out
    }

    /// SIC strategy over all epochs. `offset` is the chunk's global start,
    /// used only for diagnostics.
    pub fn resolve_sic<B: FilterBank + ?Sized>(
        &self,
        disc: &Discriminants,
        fout: &Trace,
        bank: &B,
        epochs: &[Epoch],
        offset: usize,
    ) -> Vec<Assignment> {
        epochs
            .iter()
            .flat_map(|ep| self.resolve_sic_epoch(disc, fout, bank, *ep, offset).spikes)
            .collect()
    }

    /// SIC on a single epoch.
    pub fn resolve_sic_epoch<B: FilterBank + ?Sized>(
        &self,
        disc: &Discriminants,
        fout: &Trace,
        bank: &B,
        ep: Epoch,
        offset: usize,
    ) -> SicEpoch {
        let k = disc.filters();
        let len = ep.len();
        let tf = self.tf as isize;
        let mut result = SicEpoch::default();
        if k == 0 || len == 0 {
            return result;
        }

        let mut ep_disc = vec![0.0f32; len * k];
        let mut ep_fout = vec![0.0f32; len * k];
        for r in 0..len {
            for j in 0..k {
                ep_disc[r * k + j] = disc.get(ep.start + r, j).unwrap_or(f32::NEG_INFINITY);
                ep_fout[r * k + j] = fout.get(ep.start + r, j);
            }
        }
        // every subtraction is measured against the untouched epoch output
        let norm = frobenius(&ep_fout);
        let mut sub = vec![0.0f32; len * k];
        let mut candidate = vec![0.0f32; len * k];

        loop {
            let (best, value) = argmax(&ep_disc);
            if value <= self.log_noise_prior {
                break;
            }
            if result.iterations >= 2 * k {
                break;
            }
            result.iterations += 1;
            if result.iterations == k + 1 {
                tracing::warn!(
                    start = ep.start + offset,
                    end = ep.end + offset,
                    iterations = result.iterations,
                    "more spikes than filters found in epoch"
                );
            }

            let (t_star, c_star) = (best / k, best % k);
            sub.iter_mut().for_each(|v| *v = 0.0);
            for r in 0..len {
                let d = r as isize - t_star as isize;
                if d.abs() >= tf {
                    continue;
                }
                for j in 0..k {
                    let lags = bank.xcorr_lags(c_star, j);
                    sub[r * k + j] = -lags[(d + tf - 1) as usize];
                }
            }

            for ((c, f), s) in candidate.iter_mut().zip(&ep_fout).zip(&sub) {
                *c = f + s;
            }
            let reduced = frobenius(&candidate);
            if reduced >= norm {
                break;
            }

            for (d, s) in ep_disc.iter_mut().zip(&sub) {
                *d += s + self.log_spike_prior;
            }
            result.spikes.push(Assignment {
                filter: c_star,
                time: ep.start + t_star,
            });
        }

        result
    }
}

fn frobenius(values: &[f32]) -> f64 {
    libm::sqrt(values.iter().map(|&v| v as f64 * v as f64).sum())
}

/// Flat index and value of the maximum; the first of equal maxima wins.
fn argmax(values: &[f32]) -> (usize, f32) {
    let mut best = (0, f32::NEG_INFINITY);
    for (i, &v) in values.iter().enumerate() {
        if v > best.1 {
            best = (i, v);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance::TimeSeriesCovariance;
    use crate::discriminant::build_discriminants;
    use crate::filter::MatchedFilterBank;
    use crate::trace::TraceView;
    use proptest::prelude::*;

    const TEMPLATE_A: [f32; 8] = [0.0, -2.0, -5.0, -3.0, 1.0, 2.0, 1.0, 0.0];
    const TEMPLATE_B: [f32; 8] = [0.0, 3.0, 4.0, -1.0, -4.0, -2.0, 0.0, 0.0];

    fn bank(templates: &[&[f32]]) -> MatchedFilterBank<TimeSeriesCovariance> {
        let ce = TimeSeriesCovariance::new(1, 8).unwrap();
        let mut b = MatchedFilterBank::new(8, vec![0], ce, 10).unwrap();
        for t in templates {
            b.create_filter(t.to_vec()).unwrap();
        }
        b
    }

    fn resolver(policy: EpochPolicy) -> EpochResolver {
        EpochResolver::new(8, libm::logf(1e-6), 0.0, policy)
    }

    #[test]
    fn test_candidate_epochs_symmetric() {
        let mut b = bank(&[&TEMPLATE_A]);
        let mut data = vec![0.0f32; 200];
        data[100..108].copy_from_slice(&TEMPLATE_A);
        let fout = b.apply(TraceView::new(&data, 1).unwrap()).unwrap();
        let disc = build_discriminants(&fout, &b, libm::logf(1e-6), &[]);

        let eps = resolver(EpochPolicy::default()).candidate_epochs(&disc);
        assert_eq!(eps.len(), 1);
        assert!(eps[0].contains(106));
        assert!(eps[0].len() >= 9);
    }

    #[test]
    fn test_candidate_epochs_peak_aligned() {
        let mut b = bank(&[&TEMPLATE_A]);
        let mut data = vec![0.0f32; 200];
        data[100..108].copy_from_slice(&TEMPLATE_A);
        let fout = b.apply(TraceView::new(&data, 1).unwrap()).unwrap();
        let disc = build_discriminants(&fout, &b, libm::logf(1e-6), &[]);

        let policy = EpochPolicy {
            widening: Widening::PeakAligned { align_at: 3 },
            merge_distance: Some(0),
        };
        let eps = resolver(policy).candidate_epochs(&disc);
        assert_eq!(eps.len(), 1);
        // peak at 106, three samples into an eight sample window
        assert_eq!(eps[0].start, 103);
        assert!(eps[0].end >= 111);
    }

    #[test]
    fn test_no_filters_no_epochs() {
        let b = bank(&[]);
        let fout = Trace::zeros(10, 0);
        let disc = build_discriminants(&fout, &b, 0.0, &[]);
        let r = resolver(EpochPolicy::default());
        assert!(r.candidate_epochs(&disc).is_empty());
        assert!(r.resolve_sic(&disc, &fout, &b, &[Epoch::new(0, 5)], 0).is_empty());
    }

    #[test]
    fn test_sic_separates_overlapping_units() {
        // strong enough that each unit survives the spike prior after the
        // other one is subtracted
        let a: Vec<f32> = TEMPLATE_A.iter().map(|v| v * 3.0).collect();
        let b3: Vec<f32> = TEMPLATE_B.iter().map(|v| v * 3.0).collect();
        let mut b = bank(&[&a, &b3]);
        let mut data = vec![0.0f32; 200];
        for (k, v) in a.iter().enumerate() {
            data[100 + k] += v;
        }
        for (k, v) in b3.iter().enumerate() {
            data[104 + k] += v;
        }
        let fout = b.apply(TraceView::new(&data, 1).unwrap()).unwrap();
        let disc = build_discriminants(&fout, &b, libm::logf(1e-6), &[]);
        let r = resolver(EpochPolicy::default());
        let eps = r.candidate_epochs(&disc);
        assert_eq!(eps.len(), 1);

        let mut spikes = r.resolve_sic(&disc, &fout, &b, &eps, 0);
        spikes.sort();
        assert_eq!(
            spikes,
            vec![
                Assignment { filter: 0, time: 106 },
                Assignment { filter: 1, time: 110 },
            ]
        );
    }

    #[test]
    fn test_sic_judges_each_subtraction_against_epoch_output() {
        // after unit 0 is taken, removing unit 1 alone still shrinks the
        // original epoch output even though removing both does not shrink
        // what is left after unit 0
        let a: Vec<f32> = TEMPLATE_A.iter().map(|v| v * 4.0).collect();
        let b4: Vec<f32> = TEMPLATE_B.iter().map(|v| v * 4.0).collect();
        let mut b = bank(&[&a, &b4]);
        let mut data = vec![0.0f32; 200];
        for (k, v) in a.iter().enumerate() {
            data[100 + k] += v;
        }
        for (k, v) in b4.iter().enumerate() {
            data[102 + k] += v;
        }
        let fout = b.apply(TraceView::new(&data, 1).unwrap()).unwrap();
        let disc = build_discriminants(&fout, &b, libm::logf(1e-6), &[]);
        let r = resolver(EpochPolicy::default());
        let eps = r.candidate_epochs(&disc);
        assert_eq!(eps, vec![Epoch::new(102, 114)]);

        let res = r.resolve_sic_epoch(&disc, &fout, &b, eps[0], 0);
        assert_eq!(
            res.spikes,
            vec![
                Assignment { filter: 0, time: 105 },
                Assignment { filter: 1, time: 108 },
            ]
        );
        assert_eq!(res.iterations, 3);
    }

    #[test]
    fn test_overlap_channel_emits_pair() {
        let mut b = bank(&[&TEMPLATE_A, &TEMPLATE_B]);
        let mut data = vec![0.0f32; 200];
        for (k, v) in TEMPLATE_A.iter().enumerate() {
            data[100 + k] += v;
        }
        for (k, v) in TEMPLATE_B.iter().enumerate() {
            data[102 + k] += v;
        }
        let fout = b.apply(TraceView::new(&data, 1).unwrap()).unwrap();
        let taus: Vec<isize> = (-4..=4).collect();
        let disc = build_discriminants(&fout, &b, libm::logf(1e-6), &taus);
        let r = resolver(EpochPolicy::default());
        let eps = r.candidate_epochs(&disc);
        assert_eq!(eps.len(), 1);

        let spikes = r.resolve_overlap(&disc, &eps);
        assert_eq!(
            spikes,
            vec![
                Assignment { filter: 0, time: 106 },
                Assignment { filter: 1, time: 108 },
            ]
        );
    }

    #[test]
    fn test_sic_iteration_cap() {
        let mut b = bank(&[&TEMPLATE_A]);
        let mut data = vec![0.0f32; 200];
        for onset in [100usize, 106, 112, 118, 124] {
            for (k, v) in TEMPLATE_A.iter().enumerate() {
                data[onset + k] += v;
            }
        }
        let fout = b.apply(TraceView::new(&data, 1).unwrap()).unwrap();
        let disc = build_discriminants(&fout, &b, 0.0, &[]);
        // spike prior 1: subtraction never lowers the surface by itself
        let r = EpochResolver::new(8, 0.0, -1e6, EpochPolicy::default());
        let eps = r.candidate_epochs(&disc);
        for ep in eps {
            let res = r.resolve_sic_epoch(&disc, &fout, &b, ep, 0);
            assert!(res.iterations <= 2);
        }
    }

    proptest! {
        #[test]
        fn prop_sic_terminates(
            data in proptest::collection::vec(-10.0f32..10.0, 60..120),
            ta in proptest::collection::vec(-5.0f32..5.0, 8),
            tb in proptest::collection::vec(-5.0f32..5.0, 8),
            lnp in -50.0f32..5.0,
        ) {
            let mut b = bank(&[&ta, &tb]);
            let fout = b.apply(TraceView::new(&data, 1).unwrap()).unwrap();
            let disc = build_discriminants(&fout, &b, 0.0, &[]);
            let r = EpochResolver::new(8, 0.0, lnp, EpochPolicy::default());
            for ep in r.candidate_epochs(&disc) {
                let res = r.resolve_sic_epoch(&disc, &fout, &b, ep, 0);
                prop_assert!(res.iterations <= 4);
                prop_assert!(res.spikes.len() <= res.iterations);
            }
        }
    }
}
