use alloc::vec;
use alloc::vec::Vec;

/// Welford running mean/variance, one accumulator per channel.
#[derive(Debug, Clone)]
pub struct OnlineStats {
    count: u64,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl OnlineStats {
    /// Empty accumulator for `channels` channels.
    pub fn new(channels: usize) -> Self {
        Self {
            count: 0,
            mean: vec![0.0; channels],
            m2: vec![0.0; channels],
        }
    }

    /// Adds one multichannel sample. Extra values beyond the channel count
    /// are ignored.
    pub fn update(&mut self, sample: &[f32]) {
        self.count += 1;
        let n = self.count as f64;

        for ((mean, m2), &x) in self.mean.iter_mut().zip(self.m2.iter_mut()).zip(sample) {
            let x = x as f64;
            let delta = x - *mean;
            *mean += delta / n;
            let delta2 = x - *mean;
            *m2 += delta * delta2;
        }
    }

    /// Running mean per channel.
    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    /// Sample variance per channel, zero until two samples were seen.
    pub fn variance(&self) -> Vec<f64> {
        if self.count < 2 {
            return vec![0.0; self.mean.len()];
        }
        self.m2
            .iter()
            .map(|m2| m2 / (self.count - 1) as f64)
            .collect()
    }

    pub fn std_dev(&self) -> Vec<f64> {
        self.variance().into_iter().map(libm::sqrt).collect()
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Forgets all samples, keeping the channel count.
    pub fn reset(&mut self) {
        self.count = 0;
        self.mean.iter_mut().for_each(|m| *m = 0.0);
        self.m2.iter_mut().for_each(|m| *m = 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_mean_and_variance() {
        let mut stats = OnlineStats::new(2);
        for s in [[1.0f32, 10.0], [2.0, 10.0], [3.0, 10.0], [4.0, 10.0]] {
            stats.update(&s);
        }
        assert_eq!(stats.count(), 4);
        assert_abs_diff_eq!(stats.mean()[0], 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.variance()[0], 5.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.variance()[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_reset() {
        let mut stats = OnlineStats::new(1);
        stats.update(&[5.0]);
        stats.update(&[7.0]);
        stats.reset();
        assert_eq!(stats.count(), 0);
        assert_eq!(stats.variance(), vec![0.0]);
    }
}
