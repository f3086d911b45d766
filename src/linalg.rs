//! Linear algebra for the noise model and the clustering path.
//!
//! Provides a dynamically sized square matrix with the decompositions needed
//! to invert noise covariance matrices, build whitening operators, and run
//! principal component analysis on waveform sets.
//!
//! Storage is a flat row-major `Vec<f64>`; entry `(i, j)` of an `n × n`
//! matrix lives at `i * n + j`.
//!
//! # Numerical Stability
//!
//! Covariance estimates built from short noise epochs can be ill-conditioned.
//! Use [`Matrix::add_diagonal`] with a small loading term (e.g. 1e-6 of the
//! trace) before decomposing.

use alloc::vec;
use alloc::vec::Vec;

/// Matrix decomposition failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LinalgError {
    /// Cholesky hit a non-positive pivot
    #[error("matrix is not positive definite")]
    NotPositiveDefinite,

    /// Jacobi sweeps ran out before the off-diagonal mass vanished
    #[error("eigenvalue decomposition did not converge")]
    ConvergenceFailed,

    /// Operand sizes disagree
    #[error("matrix dimensions are incompatible")]
    DimensionMismatch,
}

/// Dense square `f64` matrix.
///
/// # Example
///
/// ```
/// use botm::linalg::Matrix;
///
/// let eye = Matrix::identity(2);
/// assert_eq!(eye.get(0, 0), 1.0);
/// assert_eq!(eye.get(0, 1), 0.0);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    n: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// Creates a matrix from row-major data.
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if `data.len() != n * n`.
    pub fn new(n: usize, data: Vec<f64>) -> Result<Self, LinalgError> {
        if data.len() != n * n {
            return Err(LinalgError::DimensionMismatch);
        }
        Ok(Self { n, data })
    }

    /// Zero matrix.
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            data: vec![0.0; n * n],
        }
    }

    /// Identity matrix.
    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n);
        for i in 0..n {
            m.data[i * n + i] = 1.0;
        }
        m
    }

    /// Dimension of the matrix.
    #[inline]
    pub fn dim(&self) -> usize {
        self.n
    }

    /// Element at row i, column j.
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j]
    }

    /// Sets element at row i, column j.
    #[inline]
    pub fn set(&mut self, i: usize, j: usize, value: f64) {
        self.data[i * self.n + j] = value;
    }

    /// Row-major data.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Sum of the diagonal.
    pub fn trace(&self) -> f64 {
        (0..self.n).map(|i| self.get(i, i)).sum()
    }

    /// Transposed copy.
    pub fn transpose(&self) -> Self {
        let mut result = Self::zeros(self.n);
        for i in 0..self.n {
            for j in 0..self.n {
                result.set(j, i, self.get(i, j));
            }
        }
        result
    }

    /// Add a constant to the diagonal (for regularization).
    ///
    /// This is used to improve numerical stability: A + λI
    pub fn add_diagonal(&mut self, lambda: f64) {
        for i in 0..self.n {
            self.data[i * self.n + i] += lambda;
        }
    }

    /// Matrix product `self × other`.
    pub fn matmul(&self, other: &Self) -> Result<Self, LinalgError> {
        if self.n != other.n {
            return Err(LinalgError::DimensionMismatch);
        }
        let n = self.n;
        let mut result = Self::zeros(n);
        for i in 0..n {
            for k in 0..n {
                let a = self.get(i, k);
                if a == 0.0 {
                    continue;
                }
                for j in 0..n {
                    result.data[i * n + j] += a * other.get(k, j);
                }
            }
        }
        Ok(result)
    }

    /// Matrix-vector product `self × v`.
    ///
    /// # Panics
    ///
    /// Panics if `v.len() != self.dim()`.
    pub fn mul_vec(&self, v: &[f64]) -> Vec<f64> {
        assert_eq!(v.len(), self.n, "vector length must match matrix dimension");
        (0..self.n)
            .map(|i| {
                self.data[i * self.n..(i + 1) * self.n]
                    .iter()
                    .zip(v)
                    .map(|(a, b)| a * b)
                    .sum()
            })
            .collect()
    }

    /// Lower triangular factor `L` with `self = L Lᵀ`, computed column by
    /// column.
    ///
    /// # Errors
    ///
    /// `NotPositiveDefinite` on a non-positive pivot.
    pub fn cholesky(&self) -> Result<Self, LinalgError> {
        let n = self.n;
        let mut l = Self::zeros(n);

        for j in 0..n {
            for i in j..n {
                let mut sum = self.get(i, j);
                for k in 0..j {
                    sum -= l.get(i, k) * l.get(j, k);
                }

                if i == j {
                    if sum.is_nan() || sum <= 0.0 {
                        return Err(LinalgError::NotPositiveDefinite);
                    }
                    l.set(i, j, libm::sqrt(sum));
                } else {
                    let l_jj = l.get(j, j);
                    if libm::fabs(l_jj) < 1e-15 {
                        return Err(LinalgError::NotPositiveDefinite);
                    }
                    l.set(i, j, sum / l_jj);
                }
            }
        }

        Ok(l)
    }

    /// Forward substitution: solve Lx = b where `self` is lower triangular.
    pub fn forward_substitute(&self, b: &[f64]) -> Vec<f64> {
        let n = self.n;
        let mut x = vec![0.0; n];
        for i in 0..n {
            let mut sum = b[i];
            for (j, xj) in x.iter().enumerate().take(i) {
                sum -= self.get(i, j) * xj;
            }
            x[i] = sum / self.get(i, i);
        }
        x
    }

    /// Backward substitution: solve L^T x = b where `self` is lower triangular.
    pub fn backward_substitute(&self, b: &[f64]) -> Vec<f64> {
        let n = self.n;
        let mut x = vec![0.0; n];
        for i in (0..n).rev() {
            let mut sum = b[i];
            for (j, xj) in x.iter().enumerate().skip(i + 1) {
                sum -= self.get(j, i) * xj; // transpose indexing
            }
            x[i] = sum / self.get(i, i);
        }
        x
    }

    /// Solves `self · x = b` for a symmetric positive definite `self`.
    pub fn solve(&self, b: &[f64]) -> Result<Vec<f64>, LinalgError> {
        if b.len() != self.n {
            return Err(LinalgError::DimensionMismatch);
        }
        let l = self.cholesky()?;
        Ok(l.backward_substitute(&l.forward_substitute(b)))
    }

    /// Inverse of a symmetric positive definite matrix via Cholesky.
    pub fn inverse_spd(&self) -> Result<Self, LinalgError> {
        let n = self.n;
        let l = self.cholesky()?;
        let mut inv = Self::zeros(n);
        let mut e = vec![0.0; n];
        for col in 0..n {
            e.iter_mut().for_each(|v| *v = 0.0);
            e[col] = 1.0;
            let y = l.forward_substitute(&e);
            let x = l.backward_substitute(&y);
            for (row, v) in x.into_iter().enumerate() {
                inv.set(row, col, v);
            }
        }
        Ok(inv)
    }

    /// Inverse of a lower triangular matrix.
    ///
    /// For a Cholesky factor L of C this is the whitening operator: if
    /// `x ~ N(0, C)` then `L^-1 x ~ N(0, I)`.
    pub fn lower_inverse(&self) -> Result<Self, LinalgError> {
        let n = self.n;
        let mut inv = Self::zeros(n);
        let mut e = vec![0.0; n];
        for col in 0..n {
            if libm::fabs(self.get(col, col)) < 1e-15 {
                return Err(LinalgError::NotPositiveDefinite);
            }
            e.iter_mut().for_each(|v| *v = 0.0);
            e[col] = 1.0;
            let x = self.forward_substitute(&e);
            for (row, v) in x.into_iter().enumerate() {
                inv.set(row, col, v);
            }
        }
        Ok(inv)
    }

    /// Classical Jacobi eigen solver for symmetric matrices: `self = V Λ Vᵀ`.
    ///
    /// Each step rotates away the largest off-diagonal entry; iteration
    /// stops once that entry is below `tol`.
    ///
    /// # Errors
    ///
    /// `ConvergenceFailed` after `max_iters` rotations.
    pub fn eigen_symmetric(
        &self,
        max_iters: usize,
        tol: f64,
    ) -> Result<EigenDecomposition, LinalgError> {
        let n = self.n;
        let mut a = self.clone();
        let mut v = Self::identity(n);

        if n < 2 {
            return Ok(EigenDecomposition {
                eigenvalues: (0..n).map(|i| a.get(i, i)).collect(),
                eigenvectors: v,
            });
        }

        for _ in 0..max_iters {
            let (p, q, off) = find_max_off_diagonal(&a);
            if off < tol {
                let mut eigenvalues: Vec<f64> = (0..n).map(|i| a.get(i, i)).collect();
                sort_eigen(&mut eigenvalues, &mut v);
                return Ok(EigenDecomposition {
                    eigenvalues,
                    eigenvectors: v,
                });
            }

            let (c, s) = jacobi_rotation(&a, p, q);
            rotate(&mut a, p, q, c, s);
            rotate_columns(&mut v, p, q, c, s);
        }

        Err(LinalgError::ConvergenceFailed)
    }
}

/// Eigenpairs of a symmetric matrix.
#[derive(Debug, Clone)]
pub struct EigenDecomposition {
    /// Largest first
    pub eigenvalues: Vec<f64>,
    /// Column `k` pairs with `eigenvalues[k]`
    pub eigenvectors: Matrix,
}

impl EigenDecomposition {
    /// Column `k` of the eigenvector matrix.
    pub fn eigenvector(&self, k: usize) -> Vec<f64> {
        let n = self.eigenvectors.dim();
        (0..n).map(|i| self.eigenvectors.get(i, k)).collect()
    }
}

/// Largest upper-triangle entry by magnitude, as `(row, col, |value|)`.
fn find_max_off_diagonal(a: &Matrix) -> (usize, usize, f64) {
    let n = a.dim();
    (0..n)
        .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
        .map(|(i, j)| (i, j, libm::fabs(a.get(i, j))))
        .fold((0, 1, f64::NEG_INFINITY), |best, cur| if cur.2 > best.2 { cur } else { best })
}

/// `(cos, sin)` of the rotation zeroing `a[i, j]`.
fn jacobi_rotation(a: &Matrix, i: usize, j: usize) -> (f64, f64) {
    let a_ii = a.get(i, i);
    let a_jj = a.get(j, j);
    let a_ij = a.get(i, j);

    if a_ii == a_jj {
        // 45 degrees
        let r = core::f64::consts::FRAC_1_SQRT_2;
        return (r, r);
    }

    let tau = (a_jj - a_ii) / (2.0 * a_ij);
    let t = if tau >= 0.0 {
        1.0 / (tau + libm::sqrt(1.0 + tau * tau))
    } else {
        -1.0 / (-tau + libm::sqrt(1.0 + tau * tau))
    };

    let c = 1.0 / libm::sqrt(1.0 + t * t);
    (c, t * c)
}

/// Rotates rows and columns `i`, `j` of `a` in place.
fn rotate(a: &mut Matrix, i: usize, j: usize, c: f64, s: f64) {
    let n = a.dim();
    let a_ii = a.get(i, i);
    let a_jj = a.get(j, j);
    let a_ij = a.get(i, j);

    a.set(i, i, c * c * a_ii - 2.0 * c * s * a_ij + s * s * a_jj);
    a.set(j, j, s * s * a_ii + 2.0 * c * s * a_ij + c * c * a_jj);
    a.set(i, j, 0.0);
    a.set(j, i, 0.0);

    for k in 0..n {
        if k != i && k != j {
            let a_ki = a.get(k, i);
            let a_kj = a.get(k, j);

            let new_ki = c * a_ki - s * a_kj;
            let new_kj = s * a_ki + c * a_kj;

            a.set(k, i, new_ki);
            a.set(i, k, new_ki);
            a.set(k, j, new_kj);
            a.set(j, k, new_kj);
        }
    }
}

/// Accumulates the rotation into the eigenvector columns.
fn rotate_columns(v: &mut Matrix, i: usize, j: usize, c: f64, s: f64) {
    for k in 0..v.dim() {
        let v_ki = v.get(k, i);
        let v_kj = v.get(k, j);
        v.set(k, i, c * v_ki - s * v_kj);
        v.set(k, j, s * v_ki + c * v_kj);
    }
}

/// Orders eigenpairs by decreasing eigenvalue.
fn sort_eigen(eigenvalues: &mut [f64], eigenvectors: &mut Matrix) {
    let n = eigenvalues.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eigenvalues[b].total_cmp(&eigenvalues[a]));

    let values: Vec<f64> = order.iter().map(|&k| eigenvalues[k]).collect();
    let mut vectors = Matrix::zeros(n);
    for (dst, &src) in order.iter().enumerate() {
        for row in 0..n {
            vectors.set(row, dst, eigenvectors.get(row, src));
        }
    }
    eigenvalues.copy_from_slice(&values);
    *eigenvectors = vectors;
}
