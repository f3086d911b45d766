//! Matched filter bank.
//!
//! A [`FilterBank`] maps a data chunk to a `[samples × active filters]`
//! output matrix and exposes the noise-whitened cross-correlations between
//! its templates and filters that the discriminant builder and the SIC
//! resolver need.
//!
//! # Output convention
//!
//! With latency `L = min(⌊tf/2⌋ + round(tf/4), tf − 1)` (see [`latency`]):
//!
//! ```text
//! out[t, i] = Σ_c Σ_k f_i[c, k] · x[t − L + k, c]
//! ```
//!
//! so a template starting at sample `s` produces its peak at `s + L`. The
//! sorter's final `⌊tf/2⌋` correction then reports the spike at
//! `s + round(tf/4)`, the sample learned templates are aligned on.
//!
//! Each output looks `tf − 1 − L` samples past its own sample. The bank
//! keeps `L` samples of history between calls and takes the samples after a
//! chunk from the caller, so chunked filtering matches filtering the whole
//! recording at once.
//!
//! ```
//! use botm::filter::latency;
//!
//! assert_eq!(latency(8), 6);
//! assert_eq!(latency(32), 24);
//! assert_eq!(latency(2), 1);
//! ```

mod bank;
mod matched;

pub use bank::MatchedFilterBank;
pub use matched::MatchedFilter;

use alloc::vec::Vec;

use crate::error::Result;
use crate::trace::{Trace, TraceView};

/// Samples between a template's onset and the peak of its filter output.
pub fn latency(tf: usize) -> usize {
    let quarter = libm::roundf(0.25 * tf as f32) as usize;
    (tf / 2 + quarter).min(tf.saturating_sub(1))
}

/// Stable filter identifier. Filters are never removed, so ids stay valid.
pub type FilterId = usize;

/// Bank of matched filters applied chunk by chunk.
///
/// Cross-correlation accessors take *positions* into
/// [`active_ids`](FilterBank::active_ids), matching the column order of
/// [`apply`](FilterBank::apply).
pub trait FilterBank {
    /// Template length `tf` in samples.
    fn template_length(&self) -> usize;

    /// Input channels the bank operates on.
    fn channels(&self) -> &[usize];

    /// Ids of the active filters in output-column order.
    fn active_ids(&self) -> &[FilterId];

    /// Filter by id, active or not.
    fn filter(&self, id: FilterId) -> Option<&MatchedFilter>;

    /// Onset-to-peak delay of the filter outputs, [`latency`] of the
    /// template length.
    fn latency(&self) -> usize {
        latency(self.template_length())
    }

    /// Applies every active filter to `chunk`, continuing from the history
    /// left by the previous call. `ahead` holds the samples that follow the
    /// chunk (all input channels); missing samples count as zero.
    fn apply_with_lookahead(&mut self, chunk: TraceView<'_>, ahead: TraceView<'_>) -> Result<Trace>;

    /// [`apply_with_lookahead`](FilterBank::apply_with_lookahead) for the
    /// last chunk of a recording.
    fn apply(&mut self, chunk: TraceView<'_>) -> Result<Trace> {
        let end = chunk.len();
        self.apply_with_lookahead(chunk, chunk.slice(end, end))
    }

    /// Whitened energy of active filter `i`, the response at lag zero.
    fn xcorr_self(&self, i: usize) -> f32;

    /// Response of filter `j` to template `i` when `j`'s own template would
    /// sit `tau` samples after `i`'s. Zero for `|tau| >= tf`.
    fn xcorr_pair(&self, i: usize, j: usize, tau: isize) -> f32;

    /// Full response of filter `j` to template `i`, `2·tf − 1` lags
    /// starting at `−(tf − 1)`.
    fn xcorr_lags(&self, i: usize, j: usize) -> &[f32];

    /// Re-whitens every active filter and rebuilds the cross-correlation
    /// cache.
    fn rebuild_cache(&mut self) -> Result<()>;

    /// Adds a new active filter and returns its id.
    fn create_filter(&mut self, template: Vec<f32>) -> Result<FilterId>;

    /// Removes a filter from the active set. It stays in the bank.
    fn deactivate(&mut self, id: FilterId);

    /// Feeds aligned waveforms to a filter's template estimate.
    fn extend_filter(&mut self, id: FilterId, waveforms: Vec<Vec<f32>>) -> Result<()>;

    /// Clears the filtering history, as at the start of a new recording.
    fn reset_history(&mut self);
}
