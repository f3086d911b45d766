//! Epoch bookkeeping over half-open sample intervals.
//!
//! An [`Epoch`] is a `[start, end)` range of sample indices. Every piece of
//! interval arithmetic in the sorter goes through the functions here:
//!
//! - [`epochs_from_mask`] - maximal runs of `true` in a boolean mask
//! - [`mask_from_epochs`] - the inverse, for checking and for masking data
//! - [`merge_epochs`] - fuse epochs closer than a minimum distance
//! - [`invert_epochs`] - complement within `[0, end)`
//! - [`symmetric_pad`] - split a width deficit into left/right padding
//! - [`epochs_from_spike_trains`] - spike and noise epochs around spike times
//! - [`overlaps`] - flag spikes that sit close to another unit's spike
//!
//! # Example
//!
//! ```
//! use botm::epochs::{epochs_from_mask, merge_epochs, invert_epochs, Epoch};
//!
//! let mask = [false, true, true, false, false, true, false];
//! let eps = epochs_from_mask(&mask);
//! assert_eq!(eps, vec![Epoch::new(1, 3), Epoch::new(5, 6)]);
//!
//! // Gap of 2 samples is below min_dist = 3, so both fuse
//! assert_eq!(merge_epochs(&eps, 3), vec![Epoch::new(1, 6)]);
//!
//! let gaps = invert_epochs(&eps, 7);
//! assert_eq!(gaps, vec![Epoch::new(0, 1), Epoch::new(3, 5), Epoch::new(6, 7)]);
//! ```

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

/// Half-open interval `[start, end)` of sample indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Epoch {
    /// First sample (inclusive)
    pub start: usize,
    /// Last sample (exclusive)
    pub end: usize,
}

impl Epoch {
    /// Creates a new epoch.
    #[inline]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Number of samples covered.
    #[inline]
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Returns true if the epoch covers no samples.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Returns true if `t` lies inside the epoch.
    #[inline]
    pub fn contains(&self, t: usize) -> bool {
        t >= self.start && t < self.end
    }

    /// Shifts the epoch by a fixed offset.
    #[inline]
    pub fn offset(&self, by: usize) -> Self {
        Self::new(self.start + by, self.end + by)
    }

    /// Pads the epoch to at least `min_width` samples, splitting the deficit
    /// with [`symmetric_pad`], then clips to `[0, bound)`.
    pub fn widen(&self, min_width: usize, bound: usize) -> Self {
        let len = self.len();
        if len >= min_width {
            return Self::new(self.start, self.end.min(bound));
        }
        let (left, right) = symmetric_pad(min_width - len);
        Self::new(
            self.start.saturating_sub(left),
            (self.end + right).min(bound),
        )
    }
}

/// Returns the maximal runs of `true` in `mask`, ordered by start.
pub fn epochs_from_mask(mask: &[bool]) -> Vec<Epoch> {
    let mut epochs = Vec::new();
    let mut run_start = None;

    for (i, &on) in mask.iter().enumerate() {
        match (on, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(s)) => {
                epochs.push(Epoch::new(s, i));
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = run_start {
        epochs.push(Epoch::new(s, mask.len()));
    }

    epochs
}

/// Rebuilds a boolean mask of length `len` from a set of epochs.
///
/// Parts of epochs beyond `len` are ignored.
pub fn mask_from_epochs(epochs: &[Epoch], len: usize) -> Vec<bool> {
    let mut mask = vec![false; len];
    for ep in epochs {
        let end = ep.end.min(len);
        if ep.start < end {
            mask[ep.start..end].fill(true);
        }
    }
    mask
}

/// Sorts epochs by start and fuses neighbours whose gap is below `min_dist`.
///
/// Overlapping epochs always fuse (their gap is negative). The result is
/// ordered and non-overlapping, and merging it again with the same
/// `min_dist` returns it unchanged.
pub fn merge_epochs(epochs: &[Epoch], min_dist: usize) -> Vec<Epoch> {
    let mut sorted: Vec<Epoch> = epochs.iter().copied().filter(|e| !e.is_empty()).collect();
    sorted.sort_unstable();

    let mut merged: Vec<Epoch> = Vec::with_capacity(sorted.len());
    for ep in sorted {
        match merged.last_mut() {
            Some(last) if (ep.start as i64 - last.end as i64) < min_dist as i64 => {
                last.end = last.end.max(ep.end);
            }
            _ => merged.push(ep),
        }
    }
    merged
}

/// Complement of `epochs` within `[0, end)`.
///
/// The input need not be sorted or disjoint.
pub fn invert_epochs(epochs: &[Epoch], end: usize) -> Vec<Epoch> {
    let merged = merge_epochs(epochs, 0);
    let mut gaps = Vec::with_capacity(merged.len() + 1);
    let mut cursor = 0;

    for ep in merged {
        if ep.start >= end {
            break;
        }
        if ep.start > cursor {
            gaps.push(Epoch::new(cursor, ep.start));
        }
        cursor = cursor.max(ep.end);
    }
    if cursor < end {
        gaps.push(Epoch::new(cursor, end));
    }
    gaps
}

/// Splits a width deficit into `(left, right)` padding, left getting the
/// floor half.
///
/// ```
/// use botm::epochs::symmetric_pad;
/// assert_eq!(symmetric_pad(5), (2, 3));
/// assert_eq!(symmetric_pad(4), (2, 2));
/// ```
#[inline]
pub fn symmetric_pad(deficit: usize) -> (usize, usize) {
    let left = deficit / 2;
    (left, deficit - left)
}

/// Spike and noise epochs derived from spike times.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpikeTrainEpochs {
    /// Merged `[t - cut.0, t + cut.1)` windows around every spike
    pub spike: Vec<Epoch>,
    /// Complement of `spike` within `[0, end)`
    pub noise: Vec<Epoch>,
}

/// Builds epochs around every spike in `times` (any unit), clipped to
/// `[0, end)`, and their complement.
///
/// Spike times may be negative or beyond `end`; windows are clipped.
pub fn epochs_from_spike_trains<'a, I>(times: I, cut: (usize, usize), end: usize) -> SpikeTrainEpochs
where
    I: IntoIterator<Item = &'a i64>,
{
    let mut spike = Vec::new();
    for &t in times {
        let start = (t - cut.0 as i64).clamp(0, end as i64) as usize;
        let stop = (t + cut.1 as i64).clamp(0, end as i64) as usize;
        if stop > start {
            spike.push(Epoch::new(start, stop));
        }
    }
    let spike = merge_epochs(&spike, 0);
    let noise = invert_epochs(&spike, end);
    SpikeTrainEpochs { spike, noise }
}

/// Flags every spike that has a spike of a *different* unit closer than
/// `window` samples.
///
/// Spike lists must be sorted ascending. The returned map has one flag per
/// spike, in the same order as the input.
pub fn overlaps<K>(trains: &BTreeMap<K, Vec<i64>>, window: usize) -> BTreeMap<K, Vec<bool>>
where
    K: Ord + Copy,
{
    let w = window as i64;
    let mut flags = BTreeMap::new();

    for (&unit, times) in trains {
        let mut unit_flags = vec![false; times.len()];
        for (&other, other_times) in trains {
            if other == unit || other_times.is_empty() {
                continue;
            }
            for (i, &t) in times.iter().enumerate() {
                if unit_flags[i] {
                    continue;
                }
                // first spike of `other` not before t - w + 1
                let idx = other_times.partition_point(|&o| o <= t - w);
                if let Some(&o) = other_times.get(idx) {
                    if o < t + w {
                        unit_flags[i] = true;
                    }
                }
            }
        }
        flags.insert(unit, unit_flags);
    }

    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_mask() {
        assert!(epochs_from_mask(&[]).is_empty());
        assert!(epochs_from_mask(&[false, false]).is_empty());
    }

    #[test]
    fn test_mask_runs_at_edges() {
        let eps = epochs_from_mask(&[true, true, false, true]);
        assert_eq!(eps, vec![Epoch::new(0, 2), Epoch::new(3, 4)]);
    }

    #[test]
    fn test_merge_overlapping_and_unsorted() {
        let eps = [Epoch::new(10, 20), Epoch::new(0, 5), Epoch::new(15, 25)];
        assert_eq!(
            merge_epochs(&eps, 0),
            vec![Epoch::new(0, 5), Epoch::new(10, 25)]
        );
        // gap 5 < 6 merges
        assert_eq!(merge_epochs(&eps, 6), vec![Epoch::new(0, 25)]);
    }

    #[test]
    fn test_merge_keeps_adjacent_at_zero_distance() {
        let eps = [Epoch::new(0, 5), Epoch::new(5, 8)];
        assert_eq!(merge_epochs(&eps, 0).len(), 2);
        assert_eq!(merge_epochs(&eps, 1), vec![Epoch::new(0, 8)]);
    }

    #[test]
    fn test_invert_clips_to_end() {
        let eps = [Epoch::new(2, 4), Epoch::new(8, 20)];
        assert_eq!(
            invert_epochs(&eps, 10),
            vec![Epoch::new(0, 2), Epoch::new(4, 8)]
        );
        assert_eq!(invert_epochs(&[], 3), vec![Epoch::new(0, 3)]);
    }

    #[test]
    fn test_widen_clips_at_bounds() {
        let ep = Epoch::new(1, 3);
        assert_eq!(ep.widen(9, 100), Epoch::new(0, 7));
        assert_eq!(Epoch::new(95, 97).widen(9, 100), Epoch::new(92, 100));
        assert_eq!(Epoch::new(10, 30).widen(9, 100), Epoch::new(10, 30));
    }

    #[test]
    fn test_spike_train_epochs() {
        let times = [5i64, 7, 40];
        let eps = epochs_from_spike_trains(times.iter(), (4, 4), 50);
        assert_eq!(eps.spike, vec![Epoch::new(1, 11), Epoch::new(36, 44)]);
        assert_eq!(
            eps.noise,
            vec![Epoch::new(0, 1), Epoch::new(11, 36), Epoch::new(44, 50)]
        );
    }

    #[test]
    fn test_overlaps_flags_only_other_units() {
        let mut trains = BTreeMap::new();
        trains.insert(0usize, vec![10i64, 12, 100]);
        trains.insert(1usize, vec![15i64, 300]);
        let flags = overlaps(&trains, 8);
        assert_eq!(flags[&0], vec![true, true, false]);
        assert_eq!(flags[&1], vec![true, false]);
    }

    fn arb_epochs() -> impl Strategy<Value = Vec<Epoch>> {
        prop::collection::vec((0usize..200, 0usize..30), 0..20)
            .prop_map(|v| v.into_iter().map(|(s, l)| Epoch::new(s, s + l)).collect())
    }

    proptest! {
        #[test]
        fn prop_mask_round_trip(mask in prop::collection::vec(any::<bool>(), 0..300)) {
            let eps = epochs_from_mask(&mask);
            for pair in eps.windows(2) {
                prop_assert!(pair[0].end < pair[1].start);
            }
            prop_assert_eq!(mask_from_epochs(&eps, mask.len()), mask);
        }

        #[test]
        fn prop_merge_idempotent(eps in arb_epochs(), min_dist in 0usize..20) {
            let once = merge_epochs(&eps, min_dist);
            let twice = merge_epochs(&once, min_dist);
            prop_assert_eq!(&once, &twice);
            for pair in once.windows(2) {
                prop_assert!(pair[0].end <= pair[1].start);
            }
        }

        #[test]
        fn prop_invert_partitions_range(eps in arb_epochs(), end in 1usize..250) {
            let inv = invert_epochs(&eps, end);
            let covered = mask_from_epochs(&eps, end);
            let gaps = mask_from_epochs(&inv, end);
            for t in 0..end {
                prop_assert!(covered[t] ^ gaps[t]);
            }
        }
    }
}
