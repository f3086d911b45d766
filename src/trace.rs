//! Interleaved multichannel sample storage.
//!
//! Traces use the same interleaved layout as the rest of the crate: each
//! row is one time sample holding every channel.
//!
//! ```text
//! [ch0, ch1, ch2, ch0, ch1, ch2, ...]
//!  ^-- sample 0 -^ ^-- sample 1 -^
//! ```
//!
//! The same layout is reused for filter outputs (`[samples × filters]`) and
//! discriminant matrices (`[samples × columns]`).

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{BotmError, Result};

/// Borrowed `[samples × channels]` view.
#[derive(Debug, Clone, Copy)]
pub struct TraceView<'a> {
    data: &'a [f32],
    channels: usize,
}

impl<'a> TraceView<'a> {
    /// Wraps an interleaved slice.
    ///
    /// # Errors
    ///
    /// Fails if `channels` is zero or does not divide the slice length.
    pub fn new(data: &'a [f32], channels: usize) -> Result<Self> {
        if channels == 0 {
            return Err(BotmError::config("trace needs at least one channel"));
        }
        if data.len() % channels != 0 {
            return Err(BotmError::DimensionMismatch {
                expected: (data.len() / channels + 1) * channels,
                got: data.len(),
            });
        }
        Ok(Self { data, channels })
    }

    /// Number of time samples.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() / self.channels
    }

    /// Returns true if the view holds no samples.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of channels (columns).
    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// All channels of sample `t`.
    #[inline]
    pub fn sample(&self, t: usize) -> &'a [f32] {
        &self.data[t * self.channels..(t + 1) * self.channels]
    }

    /// Value of channel `c` at sample `t`.
    #[inline]
    pub fn get(&self, t: usize, c: usize) -> f32 {
        self.data[t * self.channels + c]
    }

    /// Samples `[start, end)` as a new view.
    pub fn slice(&self, start: usize, end: usize) -> TraceView<'a> {
        TraceView {
            data: &self.data[start * self.channels..end * self.channels],
            channels: self.channels,
        }
    }

    /// Raw interleaved data.
    pub fn as_slice(&self) -> &'a [f32] {
        self.data
    }

    /// Copies a subset of channels into a new trace, in the given order.
    ///
    /// # Errors
    ///
    /// Fails if any channel index is out of range.
    pub fn select_channels(&self, channels: &[usize]) -> Result<Trace> {
        if let Some(&bad) = channels.iter().find(|&&c| c >= self.channels) {
            return Err(BotmError::config(alloc::format!(
                "channel {} out of range for {} channel trace",
                bad, self.channels
            )));
        }
        let mut out = Trace::zeros(self.len(), channels.len());
        for t in 0..self.len() {
            let row = self.sample(t);
            for (dst, &c) in out.row_mut(t).iter_mut().zip(channels) {
                *dst = row[c];
            }
        }
        Ok(out)
    }

    /// Copies `tf` samples starting at `start` into a channel-major vector
    /// (`[ch0 samples..., ch1 samples..., ...]`).
    ///
    /// Returns `None` if the window leaves the trace.
    pub fn concatenated_window(&self, start: isize, tf: usize) -> Option<Vec<f32>> {
        if start < 0 || start as usize + tf > self.len() {
            return None;
        }
        let start = start as usize;
        let mut out = vec![0.0; tf * self.channels];
        for c in 0..self.channels {
            for k in 0..tf {
                out[c * tf + k] = self.get(start + k, c);
            }
        }
        Some(out)
    }
}

/// Owned `[samples × channels]` storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    data: Vec<f32>,
    channels: usize,
}

impl Trace {
    /// Takes ownership of interleaved data.
    ///
    /// # Errors
    ///
    /// Same shape checks as [`TraceView::new`].
    pub fn new(data: Vec<f32>, channels: usize) -> Result<Self> {
        TraceView::new(&data, channels)?;
        Ok(Self { data, channels })
    }

    /// All-zero trace.
    pub fn zeros(samples: usize, channels: usize) -> Self {
        Self {
            data: vec![0.0; samples * channels],
            channels,
        }
    }

    /// Builds a trace from per-channel (planar) vectors of equal length.
    pub fn from_channels(channels: &[Vec<f32>]) -> Result<Self> {
        let nc = channels.len();
        let ns = channels.first().map_or(0, |c| c.len());
        if let Some(bad) = channels.iter().find(|c| c.len() != ns) {
            return Err(BotmError::DimensionMismatch {
                expected: ns,
                got: bad.len(),
            });
        }
        let mut out = Trace::zeros(ns, nc);
        for (c, ch) in channels.iter().enumerate() {
            for (t, &v) in ch.iter().enumerate() {
                out.set(t, c, v);
            }
        }
        Ok(out)
    }

    /// Borrowed view of the whole trace.
    #[inline]
    pub fn view(&self) -> TraceView<'_> {
        TraceView {
            data: &self.data,
            channels: self.channels,
        }
    }

    /// Number of time samples.
    #[inline]
    pub fn len(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.data.len() / self.channels
        }
    }

    /// Returns true if the trace holds no samples.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of channels (columns).
    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Value at `(t, c)`.
    #[inline]
    pub fn get(&self, t: usize, c: usize) -> f32 {
        self.data[t * self.channels + c]
    }

    /// Sets the value at `(t, c)`.
    #[inline]
    pub fn set(&mut self, t: usize, c: usize, value: f32) {
        self.data[t * self.channels + c] = value;
    }

    /// Row `t`.
    #[inline]
    pub fn row(&self, t: usize) -> &[f32] {
        &self.data[t * self.channels..(t + 1) * self.channels]
    }

    /// Mutable row `t`.
    #[inline]
    pub fn row_mut(&mut self, t: usize) -> &mut [f32] {
        &mut self.data[t * self.channels..(t + 1) * self.channels]
    }

    /// Copy of column `c`.
    pub fn column(&self, c: usize) -> Vec<f32> {
        (0..self.len()).map(|t| self.get(t, c)).collect()
    }

    /// Raw interleaved data.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Mutable raw interleaved data.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_shape_checks() {
        let data = [0.0f32; 12];
        let view = TraceView::new(&data, 3).unwrap();
        assert_eq!(view.len(), 4);
        assert!(TraceView::new(&data, 5).is_err());
        assert!(TraceView::new(&data, 0).is_err());
    }

    #[test]
    fn test_select_channels_reorders() {
        let data = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let view = TraceView::new(&data, 3).unwrap();
        let picked = view.select_channels(&[2, 0]).unwrap();
        assert_eq!(picked.as_slice(), &[3.0, 1.0, 6.0, 4.0]);
        assert!(view.select_channels(&[3]).is_err());
    }

    #[test]
    fn test_concatenated_window_is_channel_major() {
        let data = [1.0f32, 10.0, 2.0, 20.0, 3.0, 30.0];
        let view = TraceView::new(&data, 2).unwrap();
        let w = view.concatenated_window(1, 2).unwrap();
        assert_eq!(w, vec![2.0, 3.0, 20.0, 30.0]);
        assert!(view.concatenated_window(2, 2).is_none());
        assert!(view.concatenated_window(-1, 2).is_none());
    }

    #[test]
    fn test_from_channels() {
        let t = Trace::from_channels(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(t.as_slice(), &[1.0, 3.0, 2.0, 4.0]);
        assert!(Trace::from_channels(&[vec![1.0], vec![1.0, 2.0]]).is_err());
    }
}
