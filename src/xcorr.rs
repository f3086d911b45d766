//! Cross-correlation primitives for templates and filters.
//!
//! The filter bank needs the correlation of every filter with every template
//! at every relative lag. For multichannel waveforms this is the sum of the
//! per-channel correlations, with waveforms stored channel-major
//! (`[ch0 samples..., ch1 samples..., ...]`).
//!
//! # Lag Convention
//!
//! For inputs of length `N` and `M`, the full output has length `N + M - 1`
//! and output index `k` corresponds to lag `k - (M - 1)`:
//!
//! ```text
//! (x ⋆ y)[lag] = Σ_n x[n] · y[n + lag]
//! ```
//!
//! # Example
//!
//! ```
//! use botm::xcorr::{xcorr, find_peak};
//!
//! let x = [0.0f32, 0.0, 1.0, 2.0, 1.0, 0.0, 0.0, 0.0];
//! let y = [0.0f32, 0.0, 0.0, 0.0, 1.0, 2.0, 1.0, 0.0]; // x delayed by 2
//!
//! let out = xcorr(&x, &y);
//! let (idx, _) = find_peak(&out);
//! assert_eq!(idx as i32 - 7, 2);
//! ```

use alloc::vec;
use alloc::vec::Vec;

/// Full cross-correlation of two signals.
///
/// Output index `k` holds lag `k - (y.len() - 1)`.
pub fn xcorr(x: &[f32], y: &[f32]) -> Vec<f32> {
    let mut output = vec![0.0; x.len() + y.len() - 1];
    xcorr_into(x, y, &mut output);
    output
}

/// Cross-correlation into a caller-provided buffer.
///
/// Returns the number of samples written (`x.len() + y.len() - 1`).
///
/// # Panics
///
/// Panics if `output` is shorter than `x.len() + y.len() - 1`.
pub fn xcorr_into(x: &[f32], y: &[f32], output: &mut [f32]) -> usize {
    let n = x.len() as isize;
    let m = y.len() as isize;
    let out_len = (n + m - 1).max(0) as usize;
    assert!(
        output.len() >= out_len,
        "Output buffer too small: need {}, got {}",
        out_len,
        output.len()
    );

    for (k, out_val) in output.iter_mut().take(out_len).enumerate() {
        let lag = k as isize - (m - 1);

        // n must satisfy: 0 <= n < N and 0 <= n + lag < M
        let n_start = (-lag).max(0);
        let n_end = n.min(m - lag).max(0);

        let mut sum = 0.0f32;
        for i in n_start..n_end {
            sum += x[i as usize] * y[(i + lag) as usize];
        }
        *out_val = sum;
    }

    out_len
}

/// Cross-correlation of two channel-major multichannel waveforms, summed
/// over channels.
///
/// Both inputs hold `nc` channels of `tf` samples each; the output has
/// `2 * tf - 1` entries with lag `k - (tf - 1)`.
///
/// # Panics
///
/// Panics if either input is not `tf * nc` long.
pub fn mc_xcorr(a: &[f32], b: &[f32], tf: usize, nc: usize) -> Vec<f32> {
    assert_eq!(a.len(), tf * nc, "first waveform must hold tf * nc samples");
    assert_eq!(b.len(), tf * nc, "second waveform must hold tf * nc samples");

    let mut output = vec![0.0f32; 2 * tf - 1];
    let mut scratch = vec![0.0f32; 2 * tf - 1];
    for c in 0..nc {
        let ca = &a[c * tf..(c + 1) * tf];
        let cb = &b[c * tf..(c + 1) * tf];
        xcorr_into(ca, cb, &mut scratch);
        for (o, s) in output.iter_mut().zip(&scratch) {
            *o += s;
        }
    }
    output
}

/// Dot product of two equal-length vectors, accumulated in `f64`.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(&x, &y)| x as f64 * y as f64).sum()
}

/// Find the peak (maximum) value and its index.
///
/// Returns `(0, -inf)` for empty input.
pub fn find_peak(correlation: &[f32]) -> (usize, f32) {
    let mut max_idx = 0;
    let mut max_val = f32::NEG_INFINITY;

    for (i, &val) in correlation.iter().enumerate() {
        if val > max_val {
            max_val = val;
            max_idx = i;
        }
    }

    (max_idx, max_val)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xcorr_identical_signals() {
        let signal = [1.0f32, 2.0, 3.0, 2.0, 1.0];
        let output = xcorr(&signal, &signal);
        assert_eq!(output.len(), 9);

        let (peak, _) = find_peak(&output);
        assert_eq!(peak, 4);
        assert_eq!(output[4], 19.0);
    }

    #[test]
    fn test_xcorr_partial_overlap() {
        let x = [1.0f32, 2.0, 3.0];
        let y = [1.0f32, 0.5];
        let out = xcorr(&x, &y);
        assert_eq!(out.len(), 4);
        assert!(libm::fabsf(out[1] - 2.0) < 1e-6); // lag 0: 1*1 + 2*0.5
    }

    #[test]
    #[should_panic(expected = "Output buffer too small")]
    fn test_xcorr_into_small_buffer() {
        let mut out = [0.0f32; 2];
        xcorr_into(&[1.0, 2.0], &[1.0, 2.0], &mut out);
    }

    #[test]
    fn test_mc_xcorr_sums_channels() {
        // two channels, tf = 2
        let a = [1.0f32, 0.0, 0.0, 2.0];
        let out = mc_xcorr(&a, &a, 2, 2);
        assert_eq!(out.len(), 3);
        // lag 0: 1*1 + 2*2
        assert_eq!(out[1], 5.0);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[2], 0.0);
    }

    #[test]
    fn test_dot() {
        assert_eq!(dot(&[1.0, 2.0], &[3.0, 4.0]), 11.0);
    }
}
