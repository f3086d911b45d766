//! Bayes optimal template matching (BOTM) spike sorting.
//!
//! Multichannel extracellular recordings are streamed through a bank of
//! matched filters in fixed-size chunks. Filter outputs become per-unit
//! log-posterior discriminants under a Gaussian noise model; samples where a
//! unit beats the noise hypothesis form epochs, and each epoch is resolved
//! into spikes either by enumerating pairwise overlaps or by subtractive
//! interference cancellation. [`AbotmSorter`] adds the adaptive loop that
//! learns noise statistics and templates, discovers new units and retires
//! weak ones as the recording goes on.
//!
//! The crate is `no_std` with `alloc`; all float math goes through `libm`.
//!
//! # Layout
//!
//! Sample data is interleaved `[samples × channels]` `f32` ([`Trace`],
//! [`TraceView`]). Templates are channel-major: sample `k` of channel `c`
//! sits at `c · tf + k`.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod adaptive;
pub mod artifact;
pub mod botm;
pub mod buffer;
pub mod cluster;
pub mod config;
pub mod covariance;
pub mod detector;
pub mod discriminant;
pub mod engine;
pub mod epochs;
pub mod error;
pub mod filter;
pub mod linalg;
pub mod resolver;
pub mod stats;
pub mod trace;
pub mod xcorr;

pub use adaptive::AbotmSorter;
pub use botm::BotmSorter;
pub use buffer::RingBuffer;
pub use config::{AdaptiveConfig, BankConfig, BotmConfig, EpochPolicy, NoiseLearning, Resolution, Widening};
pub use engine::SpikeTrainSet;
pub use epochs::Epoch;
pub use error::{BotmError, Result};
pub use filter::{FilterBank, FilterId, MatchedFilter, MatchedFilterBank};
pub use stats::OnlineStats;
pub use trace::{Trace, TraceView};
