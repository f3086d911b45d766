//! Chunked streaming driver.
//!
//! [`run_chunked`] slices an arbitrarily long recording into chunks and
//! pushes each one through the stages of a [`ChunkStages`] implementation:
//!
//! ```text
//! pre_filter → filter → post_filter → pre_sort → sort_chunk → post_sort
//! ```
//!
//! Chunks are processed strictly in order; whatever `post_sort` changes in
//! the model is seen by the next chunk's `filter`. Spike times are collected
//! per unit in global sample coordinates and shifted by `⌊tf/2⌋` once all
//! chunks are done. With the filter bank's latency this reports a spike
//! `round(tf/4)` samples after its waveform onset.
//!
//! Results match an unchunked run as long as no spike epoch straddles a
//! chunk boundary; a chunk size well above the template length keeps that
//! rare but does not rule it out.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::discriminant::Discriminants;
use crate::error::{BotmError, Result};
use crate::filter::FilterId;
use crate::trace::{Trace, TraceView};

/// The chunk currently being processed.
#[derive(Debug, Clone, Copy)]
pub struct ChunkContext<'a> {
    /// Samples of this chunk, all input channels.
    pub chunk: TraceView<'a>,
    /// Up to `tf` samples following the chunk, empty for the last one.
    pub ahead: TraceView<'a>,
    /// Global index of the chunk's first sample.
    pub offset: usize,
}

/// Spikes found in one chunk, chunk-local times.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkSpikes {
    /// `(unit, chunk-local time)` pairs in the order they were found.
    pub events: Vec<(FilterId, usize)>,
}

impl ChunkSpikes {
    /// Records a spike of `id` at chunk-local `time`.
    pub fn push(&mut self, id: FilterId, time: usize) {
        self.events.push((id, time));
    }

    /// Number of spikes over all units.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Per-unit sorted spike times; every id in `units` gets an entry.
    pub fn trains(&self, units: &[FilterId]) -> BTreeMap<FilterId, Vec<i64>> {
        let mut trains: BTreeMap<FilterId, Vec<i64>> =
            units.iter().map(|&id| (id, Vec::new())).collect();
        for &(id, t) in &self.events {
            trains.entry(id).or_default().push(t as i64);
        }
        for times in trains.values_mut() {
            times.sort_unstable();
        }
        trains
    }
}

/// Per-unit spike times in global sample coordinates.
///
/// # Example
///
/// ```
/// use botm::SpikeTrainSet;
///
/// let mut set = SpikeTrainSet::new();
/// set.push(1, 40);
/// set.push(0, 10);
/// assert_eq!(set.to_events(), vec![(0, 10), (1, 40)]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpikeTrainSet {
    trains: BTreeMap<FilterId, Vec<i64>>,
}

impl SpikeTrainSet {
    /// Empty set with no units.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes sure `id` has an entry, possibly empty.
    pub fn ensure(&mut self, id: FilterId) {
        self.trains.entry(id).or_default();
    }

    /// Appends `time` to the train of `id`. Times are not re-sorted.
    pub fn push(&mut self, id: FilterId, time: i64) {
        self.trains.entry(id).or_default().push(time);
    }

    /// Spike times of one unit.
    pub fn get(&self, id: FilterId) -> Option<&[i64]> {
        self.trains.get(&id).map(Vec::as_slice)
    }

    /// Unit ids with an entry.
    pub fn units(&self) -> impl Iterator<Item = FilterId> + '_ {
        self.trains.keys().copied()
    }

    /// Units with their spike times, in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (FilterId, &[i64])> + '_ {
        self.trains.iter().map(|(&id, t)| (id, t.as_slice()))
    }

    pub fn as_map(&self) -> &BTreeMap<FilterId, Vec<i64>> {
        &self.trains
    }

    /// Number of units with an entry.
    pub fn len(&self) -> usize {
        self.trains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trains.is_empty()
    }

    /// Total number of spikes over all units.
    pub fn total_spikes(&self) -> usize {
        self.trains.values().map(Vec::len).sum()
    }

    /// Two-column `(unit, time)` event log, ordered by time then unit.
    pub fn to_events(&self) -> Vec<(FilterId, i64)> {
        let mut events: Vec<(FilterId, i64)> = self
            .trains
            .iter()
            .flat_map(|(&id, times)| times.iter().map(move |&t| (id, t)))
            .collect();
        events.sort_by_key(|&(id, t)| (t, id));
        events
    }

    /// Sorts every train and shifts all times by `-shift`.
    pub(crate) fn finalize(&mut self, shift: i64) {
        for times in self.trains.values_mut() {
            times.sort_unstable();
            times.iter_mut().for_each(|t| *t -= shift);
        }
    }
}

/// Stages of the per-chunk sorting pipeline.
///
/// Only `filter`, `post_filter` and `sort_chunk` are required; the other
/// hooks default to no-ops.
pub trait ChunkStages {
    /// Template length `tf` of the model.
    fn template_length(&self) -> usize;

    /// Ids of the currently active units.
    fn active_ids(&self) -> Vec<FilterId>;

    /// Called once before the first chunk.
    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn pre_filter(&mut self, _ctx: &ChunkContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Filter outputs for the chunk, `[samples × active filters]`.
    fn filter(&mut self, ctx: &ChunkContext<'_>) -> Result<Trace>;

    /// Discriminants built from the filter outputs.
    fn post_filter(&mut self, ctx: &ChunkContext<'_>, fout: &Trace) -> Result<Discriminants>;

    fn pre_sort(&mut self, _ctx: &ChunkContext<'_>, _disc: &Discriminants) -> Result<()> {
        Ok(())
    }

    /// Spike assignments of the chunk.
    fn sort_chunk(
        &mut self,
        ctx: &ChunkContext<'_>,
        fout: &Trace,
        disc: &Discriminants,
    ) -> Result<ChunkSpikes>;

    /// Model updates once the chunk is sorted.
    fn post_sort(
        &mut self,
        _ctx: &ChunkContext<'_>,
        _disc: &Discriminants,
        _spikes: &ChunkSpikes,
    ) -> Result<()> {
        Ok(())
    }
}

/// Runs `stages` over `data` in chunks of `chunk_size` samples.
///
/// # Errors
///
/// `Configuration` if `chunk_size` is zero; otherwise the first error from
/// any stage.
pub fn run_chunked<S: ChunkStages + ?Sized>(
    stages: &mut S,
    data: TraceView<'_>,
    chunk_size: usize,
) -> Result<SpikeTrainSet> {
    if chunk_size == 0 {
        return Err(BotmError::config("chunk size must be positive"));
    }
    stages.begin()?;

    let tf = stages.template_length();
    let mut trains = SpikeTrainSet::new();
    for id in stages.active_ids() {
        trains.ensure(id);
    }

    let ns = data.len();
    let mut offset = 0;
    while offset < ns {
        let end = (offset + chunk_size).min(ns);
        let ctx = ChunkContext {
            chunk: data.slice(offset, end),
            ahead: data.slice(end, (end + tf).min(ns)),
            offset,
        };

        stages.pre_filter(&ctx)?;
        let fout = stages.filter(&ctx)?;
        let disc = stages.post_filter(&ctx, &fout)?;
        stages.pre_sort(&ctx, &disc)?;
        let spikes = stages.sort_chunk(&ctx, &fout, &disc)?;

        tracing::debug!(
            offset,
            len = end - offset,
            filters = fout.channels(),
            spikes = spikes.len(),
            "chunk sorted"
        );
        for &(id, t) in &spikes.events {
            trains.push(id, (offset + t) as i64);
        }

        stages.post_sort(&ctx, &disc, &spikes)?;
        for id in stages.active_ids() {
            trains.ensure(id);
        }
        offset = end;
    }

    trains.finalize((tf / 2) as i64);
    Ok(trains)
}
