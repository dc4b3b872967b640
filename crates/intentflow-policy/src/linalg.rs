//! Dense square-matrix helpers for the posterior covariance.
//!
//! Row-major `Vec<f64>` storage. Only what the sampler needs: identity,
//! mat-vec, symmetric rank-1 subtraction, Cholesky factorization with jitter
//! and a rank-1 Cholesky downdate.

#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    n: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            data: vec![0.0; n * n],
        }
    }

    /// `scale * I`
    pub fn scaled_identity(n: usize, scale: f64) -> Self {
        let mut m = Self::zeros(n);
        for i in 0..n {
            m.data[i * n + i] = scale;
        }
        m
    }

    /// Wraps row-major data. Returns `None` when `data.len() != n * n`.
    pub fn from_row_major(n: usize, data: Vec<f64>) -> Option<Self> {
        (data.len() == n * n).then_some(Self { n, data })
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j]
    }

    #[inline]
    fn set(&mut self, i: usize, j: usize, value: f64) {
        self.data[i * self.n + j] = value;
    }

    fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.n..(i + 1) * self.n]
    }

    pub fn matvec(&self, x: &[f64]) -> Vec<f64> {
        (0..self.n).map(|i| dot(self.row(i), x)).collect()
    }

    /// `y = L x` for a lower-triangular `self`.
    pub fn lower_matvec(&self, x: &[f64]) -> Vec<f64> {
        (0..self.n)
            .map(|i| dot(&self.row(i)[..=i], &x[..=i]))
            .collect()
    }

    /// `self -= (v vᵀ) / denom`, keeping exact symmetry.
    pub fn sub_outer_scaled(&mut self, v: &[f64], denom: f64) {
        for i in 0..self.n {
            let vi = v[i] / denom;
            let row = &mut self.data[i * self.n..(i + 1) * self.n];
            for (cell, vj) in row.iter_mut().zip(v) {
                *cell -= vi * vj;
            }
        }
        // mirror the upper triangle so the result is exactly symmetric
        for i in 0..self.n {
            for j in 0..i {
                let upper = self.get(j, i);
                self.set(i, j, upper);
            }
        }
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    pub fn is_symmetric(&self, tol: f64) -> bool {
        (0..self.n).all(|i| (0..i).all(|j| (self.get(i, j) - self.get(j, i)).abs() <= tol))
    }

    pub fn trace(&self) -> f64 {
        (0..self.n).map(|i| self.get(i, i)).sum()
    }

    /// Lower Cholesky factor `L` with `L Lᵀ = self + jitter·I`, or `None`
    /// when the matrix is not positive definite.
    pub fn cholesky(&self, jitter: f64) -> Option<Matrix> {
        let n = self.n;
        let mut l = Matrix::zeros(n);
        for i in 0..n {
            for j in 0..=i {
                let s = dot(&l.row(i)[..j], &l.row(j)[..j]);
                if i == j {
                    let d = self.get(i, i) + jitter - s;
                    if d <= 0.0 || !d.is_finite() {
                        return None;
                    }
                    l.set(i, i, d.sqrt());
                } else {
                    l.set(i, j, (self.get(i, j) - s) / l.get(j, j));
                }
            }
        }
        Some(l)
    }

    /// In-place rank-1 downdate of a lower Cholesky factor: afterwards
    /// `L Lᵀ` equals the previous `L Lᵀ - w wᵀ`.
    ///
    /// Returns `false` (leaving `self` in an unspecified state) when the
    /// downdated matrix would not be positive definite.
    pub fn cholesky_downdate(&mut self, w: &[f64]) -> bool {
        let n = self.n;
        let mut w = w.to_vec();
        for k in 0..n {
            let lkk = self.get(k, k);
            let r2 = lkk * lkk - w[k] * w[k];
            if r2 <= 0.0 || !r2.is_finite() {
                return false;
            }
            let r = r2.sqrt();
            let c = r / lkk;
            let s = w[k] / lkk;
            self.set(k, k, r);
            for i in k + 1..n {
                let lik = (self.get(i, k) - s * w[i]) / c;
                self.set(i, k, lik);
                w[i] = c * w[i] - s * lik;
            }
        }
        true
    }
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn spd3() -> Matrix {
        Matrix::from_row_major(3, vec![4.0, 2.0, 0.6, 2.0, 5.0, 1.0, 0.6, 1.0, 3.0]).unwrap()
    }

    fn reconstruct(l: &Matrix) -> Matrix {
        let n = l.dim();
        let mut out = Matrix::zeros(n);
        for i in 0..n {
            for j in 0..n {
                let v: f64 = (0..n).map(|k| l.get(i, k) * l.get(j, k)).sum();
                out.set(i, j, v);
            }
        }
        out
    }

    #[test]
    fn cholesky_reconstructs() {
        let a = spd3();
        let l = a.cholesky(0.0).unwrap();
        let back = reconstruct(&l);
        for (x, y) in a.as_slice().iter().zip(back.as_slice()) {
            assert!(approx(*x, *y));
        }
        assert_eq!(l.get(0, 1), 0.0);
    }

    #[test]
    fn cholesky_rejects_indefinite() {
        let m = Matrix::from_row_major(2, vec![1.0, 2.0, 2.0, 1.0]).unwrap();
        assert!(m.cholesky(0.0).is_none());
    }

    #[test]
    fn downdate_matches_refactorization() {
        let a = spd3();
        let w = [0.5, 0.3, -0.2];
        let mut l = a.cholesky(0.0).unwrap();
        assert!(l.cholesky_downdate(&w));

        let mut expected = a.clone();
        expected.sub_outer_scaled(&w, 1.0);
        let back = reconstruct(&l);
        for (x, y) in expected.as_slice().iter().zip(back.as_slice()) {
            assert!(approx(*x, *y));
        }
    }

    #[test]
    fn downdate_fails_when_not_positive_definite() {
        let mut l = Matrix::scaled_identity(2, 1.0);
        assert!(!l.cholesky_downdate(&[1.5, 0.0]));
    }

    #[test]
    fn sub_outer_scaled_stays_symmetric() {
        let mut a = spd3();
        a.sub_outer_scaled(&[0.1, 0.7, 0.3], 3.0);
        assert!(a.is_symmetric(0.0));
    }

    #[test]
    fn lower_matvec_ignores_upper_triangle() {
        let mut l = Matrix::scaled_identity(2, 2.0);
        l.set(0, 1, 100.0);
        l.set(1, 0, 1.0);
        assert_eq!(l.lower_matvec(&[1.0, 1.0]), vec![2.0, 3.0]);
    }
}
