//! Log-posterior discriminant functions from filter outputs.
//!
//! Column `i < k` holds the single-unit discriminant of active filter `i`:
//!
//! ```text
//! D[t, i] = F[t, i] + ln(p_spike) − ½ · xcorr_self(i)
//! ```
//!
//! In overlap mode every unordered filter pair `(f0, f1)` and every declared
//! lag `τ` adds a column
//!
//! ```text
//! D[t, oc] = D[t, f0] + D[t + τ, f1] − xcorr_pair(f0, f1, τ)
//! ```
//!
//! which is only defined where `t + τ` stays inside the chunk. Instead of
//! filling the rest with NaN, each column carries its valid sample range and
//! every maximum search skips entries outside it.

use alloc::vec::Vec;
use core::ops::Range;

use crate::filter::FilterBank;
use crate::trace::Trace;

/// One synthetic column for two units firing `tau` samples apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlapColumn {
    /// First filter (active position)
    pub f0: usize,
    /// Second filter (active position), fires at `t + tau`
    pub f1: usize,
    /// Relative lag of `f1`
    pub tau: isize,
}

/// What a discriminant column stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    /// Single unit at the given active position.
    Filter(usize),
    /// Pair of units.
    Overlap(OverlapColumn),
}

/// Discriminant matrix with explicit per-column validity.
#[derive(Debug, Clone)]
pub struct Discriminants {
    values: Trace,
    valid: Vec<Range<usize>>,
    filters: usize,
    overlaps: Vec<OverlapColumn>,
}

impl Discriminants {
    /// Number of samples.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of single-unit columns.
    pub fn filters(&self) -> usize {
        self.filters
    }

    /// Total number of columns.
    pub fn columns(&self) -> usize {
        self.filters + self.overlaps.len()
    }

    /// Meaning of column `col`.
    pub fn column(&self, col: usize) -> Column {
        if col < self.filters {
            Column::Filter(col)
        } else {
            Column::Overlap(self.overlaps[col - self.filters])
        }
    }

    /// Valid sample range of column `col`.
    pub fn valid_range(&self, col: usize) -> Range<usize> {
        self.valid[col].clone()
    }

    /// Value at `(t, col)`, `None` outside the column's valid range.
    #[inline]
    pub fn get(&self, t: usize, col: usize) -> Option<f32> {
        if self.valid[col].contains(&t) {
            Some(self.values.get(t, col))
        } else {
            None
        }
    }

    /// Raw `[samples × columns]` values. Entries outside a column's valid
    /// range are zero and carry no meaning.
    pub fn values(&self) -> &Trace {
        &self.values
    }

    /// Maximum over the valid entries of row `t`.
    pub fn row_max(&self, t: usize) -> Option<f32> {
        (0..self.columns())
            .filter_map(|c| self.get(t, c))
            .fold(None, |m, v| Some(m.map_or(v, |m: f32| m.max(v))))
    }

    /// Position `(t, col)` of the maximum over rows `rows`, scanning row by
    /// row then column by column; the first of equal maxima wins.
    pub fn argmax(&self, rows: Range<usize>) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize, f32)> = None;
        for t in rows {
            for c in 0..self.columns() {
                if let Some(v) = self.get(t, c) {
                    if best.map_or(true, |(_, _, b)| v > b) {
                        best = Some((t, c, v));
                    }
                }
            }
        }
        best.map(|(t, c, _)| (t, c))
    }
}

/// Builds the discriminant matrix for filter outputs `fout`
/// (`[samples × active filters]`).
///
/// `taus` enables overlap columns; pass an empty slice for single-unit
/// discriminants only.
pub fn build_discriminants<B: FilterBank + ?Sized>(
    fout: &Trace,
    bank: &B,
    log_spike_prior: f32,
    taus: &[isize],
) -> Discriminants {
    let ns = fout.len();
    let k = fout.channels();

    let mut overlaps = Vec::new();
    for f0 in 0..k {
        for f1 in f0 + 1..k {
            for &tau in taus {
                overlaps.push(OverlapColumn { f0, f1, tau });
            }
        }
    }

    let ncols = k + overlaps.len();
    let mut values = Trace::zeros(ns, ncols);
    let mut valid = Vec::with_capacity(ncols);

    for i in 0..k {
        let bias = log_spike_prior - 0.5 * bank.xcorr_self(i);
        for t in 0..ns {
            values.set(t, i, fout.get(t, i) + bias);
        }
        valid.push(0..ns);
    }

    for (n, oc) in overlaps.iter().enumerate() {
        let col = k + n;
        let pair = bank.xcorr_pair(oc.f0, oc.f1, oc.tau);
        let ns_i = ns as isize;
        let start = (-oc.tau).clamp(0, ns_i) as usize;
        let end = (ns_i - oc.tau).clamp(0, ns_i) as usize;
        let start = start.min(end);
        for t in start..end {
            let t1 = (t as isize + oc.tau) as usize;
            let v = values.get(t, oc.f0) + values.get(t1, oc.f1) - pair;
            values.set(t, col, v);
        }
        valid.push(start..end);
    }

    Discriminants {
        values,
        valid,
        filters: k,
        overlaps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::covariance::TimeSeriesCovariance;
    use crate::filter::MatchedFilterBank;
    use crate::trace::TraceView;
    use alloc::vec;

    fn two_filter_bank() -> MatchedFilterBank<TimeSeriesCovariance> {
        let ce = TimeSeriesCovariance::new(1, 4).unwrap();
        let mut b = MatchedFilterBank::new(4, vec![0], ce, 10).unwrap();
        b.create_filter(vec![1.0, 3.0, -1.0, 0.0]).unwrap();
        b.create_filter(vec![0.0, 2.0, 2.0, -1.0]).unwrap();
        b
    }

    fn noise(n: usize) -> Vec<f32> {
        (0..n).map(|i| (((i * 37) % 17) as f32 - 8.0) * 0.25).collect()
    }

    #[test]
    fn test_single_unit_columns() {
        let mut b = two_filter_bank();
        let data = noise(40);
        let fout = b.apply(TraceView::new(&data, 1).unwrap()).unwrap();
        let lps = libm::logf(1e-6);
        let d = build_discriminants(&fout, &b, lps, &[]);

        assert_eq!(d.columns(), 2);
        let bias = lps - 0.5 * b.xcorr_self(1);
        for t in 0..40 {
            let expected = fout.get(t, 1) + bias;
            assert_eq!(d.get(t, 1), Some(expected));
        }
    }

    #[test]
    fn test_overlap_lag_zero_equals_pair_sum() {
        let mut b = two_filter_bank();
        let data = noise(50);
        let fout = b.apply(TraceView::new(&data, 1).unwrap()).unwrap();
        let d = build_discriminants(&fout, &b, libm::logf(1e-4), &[-2, 0, 2]);

        // one pair, three lags
        assert_eq!(d.columns(), 5);
        let col = 3;
        assert_eq!(d.column(col), Column::Overlap(OverlapColumn { f0: 0, f1: 1, tau: 0 }));
        assert_eq!(d.valid_range(col), 0..50);
        let pair = b.xcorr_pair(0, 1, 0);
        for t in 0..50 {
            let expected = d.get(t, 0).unwrap() + d.get(t, 1).unwrap() - pair;
            assert_eq!(d.get(t, col), Some(expected));
        }
    }

    #[test]
    fn test_overlap_validity_ranges() {
        let mut b = two_filter_bank();
        let data = noise(20);
        let fout = b.apply(TraceView::new(&data, 1).unwrap()).unwrap();
        let d = build_discriminants(&fout, &b, 0.0, &[-2, 3]);
        assert_eq!(d.valid_range(2), 2..20);
        assert_eq!(d.valid_range(3), 0..17);
        assert_eq!(d.get(0, 2), None);
        assert_eq!(d.get(19, 3), None);
        assert!(d.get(5, 3).is_some());
    }

    #[test]
    fn test_row_max_and_argmax_skip_invalid() {
        let mut b = two_filter_bank();
        let data = noise(10);
        let fout = b.apply(TraceView::new(&data, 1).unwrap()).unwrap();
        let d = build_discriminants(&fout, &b, 0.0, &[5]);

        let row0 = d.row_max(9).unwrap();
        assert_eq!(row0, d.get(9, 0).unwrap().max(d.get(9, 1).unwrap()));

        let (t, c) = d.argmax(0..10).unwrap();
        assert!(d.get(t, c).is_some());
        assert!(d.argmax(3..3).is_none());
    }
}
