//! Small dense linear algebra for per-frequency separation updates
//!
//! Separation works on one `n_chan × n_chan` problem per frequency bin, so
//! the matrices here are tiny (a handful of microphones) and are stored
//! row-major in a flat `Vec`. The only large system is the Gram matrix of
//! the evaluation projections, which gets its own real LU factorisation
//! so that one factorisation serves many right-hand sides.

use crate::types::Complex;

const PIVOT_EPS: f64 = 1e-14;

/// Dense complex matrix, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct CMatrix {
    rows: usize,
    cols: usize,
    data: Vec<Complex>,
}

impl CMatrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![Complex::new(0.0, 0.0); rows * cols],
        }
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m.set(i, i, Complex::new(1.0, 0.0));
        }
        m
    }

    /// Build from a row-major buffer.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<Complex>) -> Self {
        assert_eq!(data.len(), rows * cols, "buffer does not match shape");
        Self { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> Complex {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, v: Complex) {
        self.data[r * self.cols + c] = v;
    }

    pub fn row(&self, r: usize) -> &[Complex] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [Complex] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn column(&self, c: usize) -> Vec<Complex> {
        (0..self.rows).map(|r| self.get(r, c)).collect()
    }

    /// Matrix product `self · other`.
    pub fn mul(&self, other: &CMatrix) -> CMatrix {
        assert_eq!(self.cols, other.rows, "inner dimensions differ");
        let mut out = CMatrix::zeros(self.rows, other.cols);
        for i in 0..self.rows {
            for k in 0..self.cols {
                let a = self.get(i, k);
                if a == Complex::new(0.0, 0.0) {
                    continue;
                }
                for j in 0..other.cols {
                    let idx = i * out.cols + j;
                    out.data[idx] += a * other.get(k, j);
                }
            }
        }
        out
    }

    /// Matrix-vector product.
    pub fn mul_vec(&self, v: &[Complex]) -> Vec<Complex> {
        assert_eq!(self.cols, v.len());
        (0..self.rows)
            .map(|i| self.row(i).iter().zip(v).map(|(a, b)| a * b).sum())
            .collect()
    }

    /// Conjugate transpose.
    pub fn hermitian(&self) -> CMatrix {
        let mut out = CMatrix::zeros(self.cols, self.rows);
        for i in 0..self.rows {
            for j in 0..self.cols {
                out.set(j, i, self.get(i, j).conj());
            }
        }
        out
    }

    /// Sub-matrix of the given row and column ranges.
    pub fn block(&self, rows: std::ops::Range<usize>, cols: std::ops::Range<usize>) -> CMatrix {
        let mut out = CMatrix::zeros(rows.len(), cols.len());
        for (i, r) in rows.clone().enumerate() {
            for (j, c) in cols.clone().enumerate() {
                out.set(i, j, self.get(r, c));
            }
        }
        out
    }

    pub fn frobenius_norm(&self) -> f64 {
        self.data.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|c| c.re.is_finite() && c.im.is_finite())
    }

    /// Inverse by Gauss-Jordan elimination with partial pivoting.
    ///
    /// Returns `None` when a pivot falls below working precision.
    pub fn inverse(&self) -> Option<CMatrix> {
        assert_eq!(self.rows, self.cols, "inverse of a non-square matrix");
        self.solve(&CMatrix::identity(self.rows))
    }

    /// Solve `self · X = rhs`.
    pub fn solve(&self, rhs: &CMatrix) -> Option<CMatrix> {
        assert_eq!(self.rows, self.cols, "solve with a non-square matrix");
        assert_eq!(self.rows, rhs.rows, "right-hand side has wrong height");
        let n = self.rows;
        let m = rhs.cols;
        let w = n + m;
        let scale = self
            .data
            .iter()
            .map(|c| c.norm())
            .fold(0.0f64, f64::max)
            .max(f64::MIN_POSITIVE);

        // Augmented matrix [A | B]
        let mut aug = vec![Complex::new(0.0, 0.0); n * w];
        for i in 0..n {
            for j in 0..n {
                aug[i * w + j] = self.get(i, j);
            }
            for j in 0..m {
                aug[i * w + n + j] = rhs.get(i, j);
            }
        }

        for col in 0..n {
            let mut max_val = 0.0f64;
            let mut max_row = col;
            for row in col..n {
                let val = aug[row * w + col].norm();
                if val > max_val {
                    max_val = val;
                    max_row = row;
                }
            }
            if max_val < PIVOT_EPS * scale {
                return None;
            }

            if max_row != col {
                for j in 0..w {
                    aug.swap(col * w + j, max_row * w + j);
                }
            }

            let pivot = aug[col * w + col];
            for j in col..w {
                aug[col * w + j] /= pivot;
            }

            for row in 0..n {
                if row != col {
                    let factor = aug[row * w + col];
                    if factor == Complex::new(0.0, 0.0) {
                        continue;
                    }
                    for j in col..w {
                        let val = aug[col * w + j];
                        aug[row * w + j] -= factor * val;
                    }
                }
            }
        }

        let mut out = CMatrix::zeros(n, m);
        for i in 0..n {
            for j in 0..m {
                out.set(i, j, aug[i * w + n + j]);
            }
        }
        Some(out)
    }
}

/// `(1/T) Σ_t x_t x_tᴴ` for observations given as `(n_chan, n_frames)`.
pub fn covariance(x: &[Vec<Complex>]) -> CMatrix {
    weighted_covariance(x, None)
}

/// `(1/T) Σ_t λ_t x_t x_tᴴ`; `weights = None` means all ones.
pub fn weighted_covariance(x: &[Vec<Complex>], weights: Option<&[f64]>) -> CMatrix {
    let n = x.len();
    let t_len = x.first().map_or(0, |c| c.len());
    let mut cov = CMatrix::zeros(n, n);
    if t_len == 0 {
        return cov;
    }
    for i in 0..n {
        for j in i..n {
            let mut acc = Complex::new(0.0, 0.0);
            match weights {
                Some(wt) => {
                    for t in 0..t_len {
                        acc += x[i][t] * x[j][t].conj() * wt[t];
                    }
                }
                None => {
                    for t in 0..t_len {
                        acc += x[i][t] * x[j][t].conj();
                    }
                }
            }
            acc /= t_len as f64;
            cov.set(i, j, acc);
            cov.set(j, i, acc.conj());
        }
    }
    cov
}

/// Hermitian form `vᴴ A v` (real part; the imaginary part vanishes for Hermitian `A`).
pub fn quadratic_form(a: &CMatrix, v: &[Complex]) -> f64 {
    let av = a.mul_vec(v);
    v.iter().zip(&av).map(|(x, y)| x.conj() * y).sum::<Complex>().re
}

/// Eigen-decomposition of a Hermitian matrix by cyclic complex Jacobi rotations.
///
/// Returns eigenvalues in ascending order and the matching unit eigenvectors
/// as the columns of the returned matrix.
pub fn hermitian_eigen(a: &CMatrix) -> (Vec<f64>, CMatrix) {
    assert_eq!(a.rows, a.cols, "eigen-decomposition of a non-square matrix");
    let n = a.rows;
    let mut m = a.clone();
    let mut v = CMatrix::identity(n);
    let total = m.frobenius_norm().max(f64::MIN_POSITIVE);

    for _sweep in 0..100 {
        let mut off = 0.0;
        for p in 0..n {
            for q in (p + 1)..n {
                off += m.get(p, q).norm_sqr();
            }
        }
        if off.sqrt() < 1e-14 * total {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let b = m.get(p, q);
                let b_abs = b.norm();
                if b_abs < 1e-300 {
                    continue;
                }
                let phase = Complex::from_polar(1.0, -b.arg()); // e^{-iφ}
                let app = m.get(p, p).re;
                let aqq = m.get(q, q).re;
                let theta = 0.5 * (2.0 * b_abs).atan2(aqq - app);
                let (s, c) = theta.sin_cos();

                // M ← M J, V ← V J
                for k in 0..n {
                    let mkp = m.get(k, p);
                    let mkq = m.get(k, q);
                    m.set(k, p, mkp * c - mkq * phase * s);
                    m.set(k, q, mkp * s + mkq * phase * c);

                    let vkp = v.get(k, p);
                    let vkq = v.get(k, q);
                    v.set(k, p, vkp * c - vkq * phase * s);
                    v.set(k, q, vkp * s + vkq * phase * c);
                }
                // M ← Jᴴ M
                let phase_c = phase.conj();
                for k in 0..n {
                    let mpk = m.get(p, k);
                    let mqk = m.get(q, k);
                    m.set(p, k, mpk * c - mqk * phase_c * s);
                    m.set(q, k, mpk * s + mqk * phase_c * c);
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| m.get(i, i).re.total_cmp(&m.get(j, j).re));

    let values = order.iter().map(|&i| m.get(i, i).re).collect();
    let mut vectors = CMatrix::zeros(n, n);
    for (dst, &src) in order.iter().enumerate() {
        for k in 0..n {
            vectors.set(k, dst, v.get(k, src));
        }
    }
    (values, vectors)
}

/// LU factorisation of a dense real matrix with partial pivoting.
#[derive(Debug, Clone)]
pub struct RealLu {
    n: usize,
    lu: Vec<f64>,
    perm: Vec<usize>,
}

impl RealLu {
    /// Factor a row-major `n × n` matrix. Returns `None` if it is numerically singular.
    pub fn factor(n: usize, mut a: Vec<f64>) -> Option<Self> {
        assert_eq!(a.len(), n * n);
        let mut perm: Vec<usize> = (0..n).collect();
        let scale = a.iter().fold(0.0f64, |m, x| m.max(x.abs())).max(f64::MIN_POSITIVE);

        for k in 0..n {
            let mut p = k;
            let mut max_val = a[k * n + k].abs();
            for i in (k + 1)..n {
                let v = a[i * n + k].abs();
                if v > max_val {
                    max_val = v;
                    p = i;
                }
            }
            if max_val < PIVOT_EPS * scale {
                return None;
            }
            if p != k {
                for j in 0..n {
                    a.swap(k * n + j, p * n + j);
                }
                perm.swap(k, p);
            }
            let pivot = a[k * n + k];
            for i in (k + 1)..n {
                let factor = a[i * n + k] / pivot;
                a[i * n + k] = factor;
                if factor == 0.0 {
                    continue;
                }
                let (upper, lower) = a.split_at_mut(i * n);
                let row_k = &upper[k * n..k * n + n];
                let row_i = &mut lower[..n];
                for j in (k + 1)..n {
                    row_i[j] -= factor * row_k[j];
                }
            }
        }
        Some(Self { n, lu: a, perm })
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    /// Solve `A x = b` with the stored factors.
    pub fn solve(&self, b: &[f64]) -> Vec<f64> {
        assert_eq!(b.len(), self.n);
        let n = self.n;
        let mut x: Vec<f64> = self.perm.iter().map(|&p| b[p]).collect();
        for i in 0..n {
            let mut acc = x[i];
            for j in 0..i {
                acc -= self.lu[i * n + j] * x[j];
            }
            x[i] = acc;
        }
        for i in (0..n).rev() {
            let mut acc = x[i];
            for j in (i + 1)..n {
                acc -= self.lu[i * n + j] * x[j];
            }
            x[i] = acc / self.lu[i * n + i];
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn c(re: f64, im: f64) -> Complex {
        Complex::new(re, im)
    }

    fn hermitian_3x3() -> CMatrix {
        CMatrix::from_vec(
            3,
            3,
            vec![
                c(4.0, 0.0),
                c(1.0, 1.0),
                c(0.5, -0.2),
                c(1.0, -1.0),
                c(3.0, 0.0),
                c(0.0, 0.7),
                c(0.5, 0.2),
                c(0.0, -0.7),
                c(2.0, 0.0),
            ],
        )
    }

    #[test]
    fn test_inverse_roundtrip() {
        let a = hermitian_3x3();
        let inv = a.inverse().unwrap();
        let prod = a.mul(&inv);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(prod.get(i, j).re, expected, epsilon = 1e-10);
                assert_relative_eq!(prod.get(i, j).im, 0.0, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_singular_returns_none() {
        let a = CMatrix::from_vec(2, 2, vec![c(1.0, 0.0), c(2.0, 0.0), c(2.0, 0.0), c(4.0, 0.0)]);
        assert!(a.inverse().is_none());
    }

    #[test]
    fn test_hermitian_eigen_reconstructs() {
        let a = hermitian_3x3();
        let (vals, vecs) = hermitian_eigen(&a);
        assert!(vals.windows(2).all(|w| w[0] <= w[1]));
        // A v = λ v for every pair
        for k in 0..3 {
            let v = vecs.column(k);
            let av = a.mul_vec(&v);
            for i in 0..3 {
                assert_relative_eq!(av[i].re, vals[k] * v[i].re, epsilon = 1e-9);
                assert_relative_eq!(av[i].im, vals[k] * v[i].im, epsilon = 1e-9);
            }
        }
        // trace preserved
        let trace: f64 = vals.iter().sum();
        assert_relative_eq!(trace, 9.0, epsilon = 1e-10);
    }

    #[test]
    fn test_eigen_of_diagonal() {
        let mut a = CMatrix::zeros(3, 3);
        a.set(0, 0, c(3.0, 0.0));
        a.set(1, 1, c(1.0, 0.0));
        a.set(2, 2, c(2.0, 0.0));
        let (vals, _) = hermitian_eigen(&a);
        assert_eq!(vals, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_weighted_covariance_is_hermitian() {
        let x = vec![
            vec![c(1.0, 0.5), c(-0.3, 0.2), c(0.0, 1.0)],
            vec![c(0.2, -0.1), c(0.8, 0.0), c(-1.0, 0.3)],
        ];
        let cov = weighted_covariance(&x, Some(&[1.0, 2.0, 0.5]));
        assert_relative_eq!(cov.get(0, 1).re, cov.get(1, 0).re);
        assert_relative_eq!(cov.get(0, 1).im, -cov.get(1, 0).im);
        assert!(quadratic_form(&cov, &[c(1.0, 0.0), c(0.0, 1.0)]) > 0.0);
    }

    #[test]
    fn test_real_lu_solve() {
        let a = vec![4.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 2.0];
        let lu = RealLu::factor(3, a.clone()).unwrap();
        let x = lu.solve(&[1.0, 2.0, 3.0]);
        for i in 0..3 {
            let row: f64 = (0..3).map(|j| a[i * 3 + j] * x[j]).sum();
            assert_relative_eq!(row, [1.0, 2.0, 3.0][i], epsilon = 1e-12);
        }
        assert!(RealLu::factor(2, vec![1.0, 1.0, 1.0, 1.0]).is_none());
    }
}
