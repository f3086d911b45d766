//! Clustering of unexplained waveforms into candidate units.
//!
//! New units are discovered by whitening buffered waveforms with the noise
//! model, projecting them onto their leading principal components and
//! fitting Gaussian mixtures of increasing order, keeping the order with the
//! lowest Bayesian information criterion.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{BotmError, Result};
use crate::linalg::Matrix;

/// Assigns a cluster label to every input vector.
pub trait Clustering {
    /// Labels are `0..n_clusters`, one per input row.
    fn cluster(&mut self, data: &[Vec<f32>]) -> Result<Vec<usize>>;
}

/// Applies a whitening operator to every waveform.
pub fn whiten(waveforms: &[Vec<f32>], whitening: &Matrix) -> Result<Vec<Vec<f32>>> {
    waveforms
        .iter()
        .map(|w| {
            if w.len() != whitening.dim() {
                return Err(BotmError::DimensionMismatch {
                    expected: whitening.dim(),
                    got: w.len(),
                });
            }
            let x: Vec<f64> = w.iter().map(|&v| v as f64).collect();
            Ok(whitening.mul_vec(&x).into_iter().map(|v| v as f32).collect())
        })
        .collect()
}

/// Principal component projection.
#[derive(Debug, Clone)]
pub struct Pca {
    mean: Vec<f64>,
    components: Vec<Vec<f64>>,
    explained: Vec<f64>,
}

impl Pca {
    /// Fits the `n_components` leading components of `data`.
    ///
    /// # Errors
    ///
    /// `Configuration` for empty input; `DimensionMismatch` for ragged rows;
    /// `Linalg` if the eigen solver does not converge.
    pub fn fit(data: &[Vec<f32>], n_components: usize) -> Result<Self> {
        let first = data
            .first()
            .ok_or_else(|| BotmError::config("PCA needs at least one sample"))?;
        let d = first.len();
        if let Some(bad) = data.iter().find(|r| r.len() != d) {
            return Err(BotmError::DimensionMismatch {
                expected: d,
                got: bad.len(),
            });
        }
        let n = data.len() as f64;

        let mut mean = vec![0.0f64; d];
        for row in data {
            for (m, &v) in mean.iter_mut().zip(row) {
                *m += v as f64 / n;
            }
        }

        let mut cov = Matrix::zeros(d);
        for row in data {
            for i in 0..d {
                let di = row[i] as f64 - mean[i];
                for j in i..d {
                    let dj = row[j] as f64 - mean[j];
                    cov.set(i, j, cov.get(i, j) + di * dj / n);
                }
            }
        }
        for i in 0..d {
            for j in 0..i {
                cov.set(i, j, cov.get(j, i));
            }
        }

        let tol = 1e-10 * libm::fabs(cov.trace()).max(1.0);
        let eig = cov.eigen_symmetric(200 * d * d + 100, tol)?;
        let k = n_components.min(d);
        let components = (0..k).map(|c| eig.eigenvector(c)).collect();
        let explained = eig.eigenvalues[..k].to_vec();

        Ok(Self {
            mean,
            components,
            explained,
        })
    }

    /// Variance along each kept component, descending.
    pub fn explained_variance(&self) -> &[f64] {
        &self.explained
    }

    pub fn n_components(&self) -> usize {
        self.components.len()
    }

    /// Projects one row onto the components.
    pub fn transform(&self, row: &[f32]) -> Vec<f32> {
        self.components
            .iter()
            .map(|comp| {
                comp.iter()
                    .zip(row)
                    .zip(&self.mean)
                    .map(|((&c, &x), &m)| c * (x as f64 - m))
                    .sum::<f64>() as f32
            })
            .collect()
    }
}

/// Diagonal-covariance Gaussian mixture with BIC model selection.
///
/// Mixtures of order `1..=max_components` are fitted by EM from a
/// deterministic farthest-point initialisation; the order with the lowest
/// BIC labels the data.
#[derive(Debug, Clone)]
pub struct GaussianMixture {
    max_components: usize,
    max_iter: usize,
    tol: f64,
    reg_covar: f64,
    selected: Option<usize>,
}

#[derive(Debug, Clone)]
struct MixtureFit {
    weights: Vec<f64>,
    means: Vec<Vec<f64>>,
    vars: Vec<Vec<f64>>,
    log_likelihood: f64,
}

impl GaussianMixture {
    /// Model selection tries 1 to `max_components` components.
    pub fn new(max_components: usize) -> Self {
        Self {
            max_components: max_components.max(1),
            max_iter: 200,
            tol: 1e-6,
            reg_covar: 1e-3,
            selected: None,
        }
    }

    /// Mixture order chosen by the last `cluster` call.
    pub fn selected_components(&self) -> Option<usize> {
        self.selected
    }

    fn bic(&self, fit: &MixtureFit, n: usize, d: usize) -> f64 {
        let k = fit.weights.len();
        let params = (k * 2 * d + k - 1) as f64;
        -2.0 * fit.log_likelihood + params * libm::log(n as f64)
    }

    fn fit(&self, data: &[Vec<f64>], k: usize) -> MixtureFit {
        let n = data.len();
        let d = data[0].len();

        // global variance as the starting spread
        let mut gmean = vec![0.0; d];
        for x in data {
            for (g, v) in gmean.iter_mut().zip(x) {
                *g += v / n as f64;
            }
        }
        let mut gvar = vec![0.0; d];
        for x in data {
            for ((g, v), m) in gvar.iter_mut().zip(x).zip(&gmean) {
                *g += (v - m) * (v - m) / n as f64;
            }
        }
        // variance floor scaled to the data
        let reg = self.reg_covar * gvar.iter().sum::<f64>() / d as f64 + 1e-12;
        gvar.iter_mut().for_each(|v| *v += reg);

        let mut fit = MixtureFit {
            weights: vec![1.0 / k as f64; k],
            means: farthest_points(data, k, &gmean),
            vars: vec![gvar; k],
            log_likelihood: f64::NEG_INFINITY,
        };

        let mut resp = vec![0.0f64; n * k];
        let mut log_p = vec![0.0f64; k];
        for _ in 0..self.max_iter {
            // E step
            let mut ll = 0.0;
            for (i, x) in data.iter().enumerate() {
                for (j, lp) in log_p.iter_mut().enumerate() {
                    *lp = libm::log(fit.weights[j].max(f64::MIN_POSITIVE))
                        + log_gaussian(x, &fit.means[j], &fit.vars[j]);
                }
                let lse = log_sum_exp(&log_p);
                ll += lse;
                for j in 0..k {
                    resp[i * k + j] = libm::exp(log_p[j] - lse);
                }
            }

            // M step
            for j in 0..k {
                let nk: f64 = (0..n).map(|i| resp[i * k + j]).sum::<f64>() + 1e-10;
                fit.weights[j] = nk / n as f64;
                let mut mean = vec![0.0; d];
                for (i, x) in data.iter().enumerate() {
                    let r = resp[i * k + j];
                    for (m, v) in mean.iter_mut().zip(x) {
                        *m += r * v / nk;
                    }
                }
                let mut var = vec![reg; d];
                for (i, x) in data.iter().enumerate() {
                    let r = resp[i * k + j];
                    for ((s, v), m) in var.iter_mut().zip(x).zip(&mean) {
                        *s += r * (v - m) * (v - m) / nk;
                    }
                }
                fit.means[j] = mean;
                fit.vars[j] = var;
            }

            let converged = libm::fabs(ll - fit.log_likelihood) < self.tol * libm::fabs(ll).max(1.0);
            fit.log_likelihood = ll;
            if converged {
                break;
            }
        }
        fit
    }

    fn labels(fit: &MixtureFit, data: &[Vec<f64>]) -> Vec<usize> {
        data.iter()
            .map(|x| {
                let mut best = (0, f64::NEG_INFINITY);
                for j in 0..fit.weights.len() {
                    let lp = libm::log(fit.weights[j].max(f64::MIN_POSITIVE))
                        + log_gaussian(x, &fit.means[j], &fit.vars[j]);
                    if lp > best.1 {
                        best = (j, lp);
                    }
                }
                best.0
            })
            .collect()
    }
}

impl Clustering for GaussianMixture {
    fn cluster(&mut self, data: &[Vec<f32>]) -> Result<Vec<usize>> {
        let Some(first) = data.first() else {
            return Ok(Vec::new());
        };
        let d = first.len();
        if let Some(bad) = data.iter().find(|r| r.len() != d) {
            return Err(BotmError::DimensionMismatch {
                expected: d,
                got: bad.len(),
            });
        }
        let data: Vec<Vec<f64>> = data
            .iter()
            .map(|r| r.iter().map(|&v| v as f64).collect())
            .collect();
        let n = data.len();

        let mut best: Option<(f64, MixtureFit)> = None;
        for k in 1..=self.max_components.min(n) {
            let fit = self.fit(&data, k);
            let bic = self.bic(&fit, n, d);
            tracing::trace!(k, bic, "mixture fitted");
            if best.as_ref().map_or(true, |(b, _)| bic < *b) {
                best = Some((bic, fit));
            }
        }

        let Some((_, fit)) = best else {
            return Ok(Vec::new());
        };
        let raw = Self::labels(&fit, &data);

        // relabel densely in order of first appearance
        let mut map: Vec<Option<usize>> = vec![None; fit.weights.len()];
        let mut next = 0;
        let labels = raw
            .into_iter()
            .map(|l| {
                *map[l].get_or_insert_with(|| {
                    next += 1;
                    next - 1
                })
            })
            .collect();
        self.selected = Some(next);
        Ok(labels)
    }
}

fn log_gaussian(x: &[f64], mean: &[f64], var: &[f64]) -> f64 {
    const LN_2PI: f64 = 1.837_877_066_409_345_5;
    x.iter()
        .zip(mean)
        .zip(var)
        .map(|((&v, &m), &s)| -0.5 * (LN_2PI + libm::log(s) + (v - m) * (v - m) / s))
        .sum()
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return max;
    }
    max + libm::log(values.iter().map(|&v| libm::exp(v - max)).sum::<f64>())
}

/// `k` starting means: the point nearest the data mean, then repeatedly the
/// point farthest from every chosen one.
fn farthest_points(data: &[Vec<f64>], k: usize, center: &[f64]) -> Vec<Vec<f64>> {
    let dist = |a: &[f64], b: &[f64]| -> f64 { a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum() };

    let mut first = 0;
    let mut best = f64::INFINITY;
    for (i, x) in data.iter().enumerate() {
        let d = dist(x, center);
        if d < best {
            best = d;
            first = i;
        }
    }

    let mut chosen = vec![data[first].clone()];
    let mut nearest: Vec<f64> = data.iter().map(|x| dist(x, &chosen[0])).collect();
    while chosen.len() < k {
        let mut far = 0;
        for i in 1..data.len() {
            if nearest[i] > nearest[far] {
                far = i;
            }
        }
        let next = data[far].clone();
        for (n, x) in nearest.iter_mut().zip(data) {
            *n = n.min(dist(x, &next));
        }
        chosen.push(next);
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn blob(rng: &mut StdRng, center: &[f32], n: usize, sd: f32) -> Vec<Vec<f32>> {
        (0..n)
            .map(|_| {
                center
                    .iter()
                    .map(|&c| c + sd * rng.sample::<f32, _>(StandardNormal))
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_pca_finds_dominant_axis() {
        let mut rng = StdRng::seed_from_u64(3);
        let data: Vec<Vec<f32>> = (0..300)
            .map(|_| {
                let t = 5.0 * rng.sample::<f32, _>(StandardNormal);
                vec![t, t, 0.1 * rng.sample::<f32, _>(StandardNormal)]
            })
            .collect();
        let pca = Pca::fit(&data, 2).unwrap();
        assert_eq!(pca.n_components(), 2);
        assert!(pca.explained_variance()[0] > 10.0 * pca.explained_variance()[1]);

        let a = pca.transform(&[1.0, 1.0, 0.0]);
        let b = pca.transform(&[-1.0, -1.0, 0.0]);
        assert!(libm::fabsf(a[0] - b[0]) > 2.5);
    }

    #[test]
    fn test_pca_rejects_bad_input() {
        assert!(Pca::fit(&[], 2).is_err());
        assert!(Pca::fit(&[vec![1.0, 2.0], vec![1.0]], 1).is_err());
    }

    #[test]
    fn test_gmm_two_blobs() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut data = blob(&mut rng, &[0.0, 0.0], 80, 0.5);
        data.extend(blob(&mut rng, &[8.0, -8.0], 60, 0.5));

        let mut gmm = GaussianMixture::new(4);
        let labels = gmm.cluster(&data).unwrap();
        assert_eq!(gmm.selected_components(), Some(2));
        assert!(labels[..80].iter().all(|&l| l == 0));
        assert!(labels[80..].iter().all(|&l| l == 1));
    }

    #[test]
    fn test_gmm_single_blob() {
        let mut rng = StdRng::seed_from_u64(5);
        let data = blob(&mut rng, &[1.0, 2.0, 3.0], 120, 1.0);
        let mut gmm = GaussianMixture::new(3);
        let labels = gmm.cluster(&data).unwrap();
        assert_eq!(gmm.selected_components(), Some(1));
        assert!(labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn test_gmm_empty_and_ragged() {
        let mut gmm = GaussianMixture::new(2);
        assert!(gmm.cluster(&[]).unwrap().is_empty());
        assert!(gmm.cluster(&[vec![1.0], vec![1.0, 2.0]]).is_err());
    }

    #[test]
    fn test_whiten_identity_and_mismatch() {
        let w = Matrix::identity(2);
        let out = whiten(&[vec![1.0, -2.0]], &w).unwrap();
        assert_eq!(out, vec![vec![1.0, -2.0]]);
        assert!(whiten(&[vec![1.0]], &w).is_err());
    }
}
