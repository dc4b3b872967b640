//! Linear Thompson sampling over candidate feature vectors.
//!
//! The posterior over reward weights is Gaussian with mean `A⁻¹ b` and
//! covariance `σ² A⁻¹`, where `A = λI + Σ φφᵀ`. Only `A⁻¹` is stored; each
//! observation updates it with a Sherman–Morrison rank-1 step, so the full
//! matrix is never re-inverted.

use intentflow_types::{IntentflowError, Result};
use rand::distributions::Distribution;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;

use crate::linalg::{dot, norm, Matrix};

/// Relative diagonal jitter tried, in order, when `A⁻¹` will not factor.
const JITTER_STEPS: [f64; 4] = [0.0, 1e-10, 1e-8, 1e-6];

/// Hyper-parameters of the policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolicyParams {
    /// Ridge prior strength λ; `A⁻¹` starts at `I / λ`.
    pub lambda: f64,
    /// Noise scale σ of the sampled weight draw.
    pub sigma: f64,
}

impl Default for PolicyParams {
    fn default() -> Self {
        Self {
            lambda: 1.0,
            sigma: 1.0,
        }
    }
}

/// The persistent part of the policy: `(A⁻¹, b)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyState {
    pub precision_inverse: Matrix,
    pub weights: Vec<f64>,
}

impl PolicyState {
    pub fn fresh(dim: usize, lambda: f64) -> Self {
        Self {
            precision_inverse: Matrix::scaled_identity(dim, 1.0 / lambda),
            weights: vec![0.0; dim],
        }
    }

    pub fn dim(&self) -> usize {
        self.weights.len()
    }
}

pub struct LinearThompsonSampler {
    state: PolicyState,
    sigma: f64,
    /// Lower Cholesky factor of `A⁻¹`, kept in step with rank-1 updates.
    factor: Option<Matrix>,
    rng: ChaCha8Rng,
    normal: Normal,
}

impl std::fmt::Debug for LinearThompsonSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinearThompsonSampler")
            .field("dim", &self.dim())
            .field("sigma", &self.sigma)
            .field("factored", &self.factor.is_some())
            .finish()
    }
}

impl LinearThompsonSampler {
    /// Fresh policy. `seed = None` draws the RNG seed from OS entropy.
    pub fn new(dim: usize, params: PolicyParams, seed: Option<u64>) -> Result<Self> {
        validate_params(dim, params)?;
        let state = PolicyState::fresh(dim, params.lambda);
        // I / λ factors to I / √λ
        let factor = Some(Matrix::scaled_identity(dim, 1.0 / params.lambda.sqrt()));
        Self::build(state, factor, params.sigma, seed)
    }

    /// Resumes from persisted state; the Cholesky factor is rebuilt lazily.
    pub fn from_state(state: PolicyState, params: PolicyParams, seed: Option<u64>) -> Result<Self> {
        validate_params(state.dim(), params)?;
        if state.precision_inverse.dim() != state.dim() {
            return Err(IntentflowError::DimensionMismatch {
                expected: state.dim(),
                actual: state.precision_inverse.dim(),
            });
        }
        Self::build(state, None, params.sigma, seed)
    }

    fn build(state: PolicyState, factor: Option<Matrix>, sigma: f64, seed: Option<u64>) -> Result<Self> {
        let normal = Normal::new(0.0, 1.0).map_err(|e| IntentflowError::Other(e.to_string()))?;
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Ok(Self {
            state,
            sigma,
            factor,
            rng,
            normal,
        })
    }

    pub fn dim(&self) -> usize {
        self.state.dim()
    }

    pub fn state(&self) -> &PolicyState {
        &self.state
    }

    pub fn into_state(self) -> PolicyState {
        self.state
    }

    /// `μ = A⁻¹ b`
    pub fn posterior_mean(&self) -> Vec<f64> {
        self.state.precision_inverse.matvec(&self.state.weights)
    }

    /// `‖A⁻¹ b‖`, logged per trial as a convergence signal.
    pub fn posterior_norm(&self) -> f64 {
        norm(&self.posterior_mean())
    }

    /// Picks one arm by Thompson sampling and returns its index in `pool`.
    ///
    /// Ties go to the earliest arm in `pool`, so the choice depends only on
    /// the seed and the pool order.
    pub fn select_index<F: AsRef<[f64]>>(&mut self, pool: &[F]) -> Result<usize> {
        if pool.is_empty() {
            return Err(IntentflowError::EmptyPool);
        }
        for features in pool {
            self.check_dim(features.as_ref())?;
        }

        let theta = self.sample_weights();
        let mut best: Option<(usize, f64)> = None;
        for (idx, features) in pool.iter().enumerate() {
            let score = dot(features.as_ref(), &theta);
            if score.is_nan() {
                continue;
            }
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((idx, score));
            }
        }
        let (idx, score) = best.unwrap_or((0, f64::NAN));
        tracing::trace!(arm = idx, score, "Arm selected");
        Ok(idx)
    }

    /// Same as [`select_index`](Self::select_index) but keyed by arm id.
    pub fn select<'p, F: AsRef<[f64]>>(&mut self, pool: &'p [(String, F)]) -> Result<&'p str> {
        let features: Vec<&[f64]> = pool.iter().map(|(_, f)| f.as_ref()).collect();
        let idx = self.select_index(&features)?;
        Ok(pool[idx].0.as_str())
    }

    /// Sherman–Morrison posterior update with one observation `(φ, r)`.
    pub fn update(&mut self, phi: &[f64], reward: f64) -> Result<()> {
        self.check_dim(phi)?;
        if !reward.is_finite() || phi.iter().any(|x| !x.is_finite()) {
            return Err(IntentflowError::Other(
                "policy update with non-finite input".into(),
            ));
        }

        let v = self.state.precision_inverse.matvec(phi);
        let denom = 1.0 + dot(phi, &v);
        if denom <= 0.0 || !denom.is_finite() {
            return Err(IntentflowError::Other(format!(
                "policy update denominator {denom} is not positive"
            )));
        }

        self.state.precision_inverse.sub_outer_scaled(&v, denom);
        for (b, x) in self.state.weights.iter_mut().zip(phi) {
            *b += reward * x;
        }

        if let Some(factor) = self.factor.as_mut() {
            let scale = denom.sqrt();
            let w: Vec<f64> = v.iter().map(|x| x / scale).collect();
            if !factor.cholesky_downdate(&w) {
                tracing::debug!("Cholesky downdate failed, factor will be recomputed");
                self.factor = None;
            }
        }
        Ok(())
    }

    fn check_dim(&self, features: &[f64]) -> Result<()> {
        if features.len() != self.dim() {
            return Err(IntentflowError::DimensionMismatch {
                expected: self.dim(),
                actual: features.len(),
            });
        }
        Ok(())
    }

    /// `θ = μ + σ L z` with `z ~ N(0, I)`. Falls back to `μ` when `A⁻¹`
    /// cannot be factored.
    fn sample_weights(&mut self) -> Vec<f64> {
        let mean = self.posterior_mean();
        if self.factor.is_none() {
            self.factor = self.refactor();
        }
        let Some(factor) = self.factor.as_ref() else {
            tracing::warn!("Posterior covariance is not positive definite, using the mean");
            return mean;
        };

        let z: Vec<f64> = (0..self.dim())
            .map(|_| self.normal.sample(&mut self.rng))
            .collect();
        let noise = factor.lower_matvec(&z);
        mean.iter()
            .zip(noise)
            .map(|(m, e)| m + self.sigma * e)
            .collect()
    }

    fn refactor(&self) -> Option<Matrix> {
        let a = &self.state.precision_inverse;
        let scale = (a.trace() / a.dim().max(1) as f64).abs().max(f64::MIN_POSITIVE);
        JITTER_STEPS.iter().find_map(|step| {
            let factor = a.cholesky(step * scale);
            if factor.is_some() && *step > 0.0 {
                tracing::debug!(jitter = step * scale, "Factored posterior covariance with jitter");
            }
            factor
        })
    }
}

fn validate_params(dim: usize, params: PolicyParams) -> Result<()> {
    if dim == 0 {
        return Err(IntentflowError::Other("policy dimension must be positive".into()));
    }
    if !(params.lambda.is_finite() && params.lambda > 0.0) {
        return Err(IntentflowError::Other(format!(
            "ridge prior lambda must be positive, got {}",
            params.lambda
        )));
    }
    if !(params.sigma.is_finite() && params.sigma >= 0.0) {
        return Err(IntentflowError::Other(format!(
            "noise scale sigma must be non-negative, got {}",
            params.sigma
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Gauss-Jordan inverse for small test matrices.
    fn invert(m: &Matrix) -> Matrix {
        let n = m.dim();
        let mut a: Vec<Vec<f64>> = (0..n)
            .map(|i| {
                let mut row: Vec<f64> = (0..n).map(|j| m.get(i, j)).collect();
                row.extend((0..n).map(|j| if i == j { 1.0 } else { 0.0 }));
                row
            })
            .collect();
        for col in 0..n {
            let pivot = (col..n)
                .max_by(|&x, &y| a[x][col].abs().partial_cmp(&a[y][col].abs()).unwrap())
                .unwrap();
            a.swap(col, pivot);
            let p = a[col][col];
            for v in a[col].iter_mut() {
                *v /= p;
            }
            for row in 0..n {
                if row != col {
                    let f = a[row][col];
                    let pivot_row = a[col].clone();
                    for (v, pv) in a[row].iter_mut().zip(pivot_row) {
                        *v -= f * pv;
                    }
                }
            }
        }
        let data = a.into_iter().flat_map(|row| row[n..].to_vec()).collect();
        Matrix::from_row_major(n, data).unwrap()
    }

    fn sampler(dim: usize, seed: u64) -> LinearThompsonSampler {
        LinearThompsonSampler::new(dim, PolicyParams::default(), Some(seed)).unwrap()
    }

    #[test]
    fn fresh_state_is_scaled_identity() {
        let s = LinearThompsonSampler::new(
            3,
            PolicyParams {
                lambda: 2.0,
                sigma: 1.0,
            },
            Some(0),
        )
        .unwrap();
        assert_eq!(s.state().precision_inverse.get(0, 0), 0.5);
        assert_eq!(s.state().precision_inverse.get(0, 1), 0.0);
        assert_eq!(s.posterior_norm(), 0.0);
    }

    #[test]
    fn update_is_exact_rank_one_posterior() {
        let mut s = sampler(3, 7);
        s.update(&[0.3, -0.2, 0.9], 1.0).unwrap();
        let before = s.state().precision_inverse.clone();

        let phi = [0.5, 1.0, -0.4];
        s.update(&phi, 0.5).unwrap();

        // direct: (before⁻¹ + φφᵀ)⁻¹
        let mut precision = invert(&before);
        let mut outer = Matrix::zeros(3);
        outer.sub_outer_scaled(&phi, -1.0);
        let data: Vec<f64> = precision
            .as_slice()
            .iter()
            .zip(outer.as_slice())
            .map(|(a, b)| a + b)
            .collect();
        precision = Matrix::from_row_major(3, data).unwrap();
        let direct = invert(&precision);

        for q in [[1.0, 0.0, 0.0], [0.2, -0.7, 1.3], [3.0, 1.0, 2.0]] {
            let got = dot(&q, &s.state().precision_inverse.matvec(&q));
            let want = dot(&q, &direct.matvec(&q));
            assert!((got - want).abs() < 1e-9, "q·A⁻¹q {got} vs {want}");
        }
        assert!(s.state().precision_inverse.is_symmetric(0.0));
    }

    #[test]
    fn weights_accumulate_reward_times_features() {
        let mut s = sampler(2, 1);
        s.update(&[1.0, 2.0], 0.5).unwrap();
        s.update(&[1.0, 0.0], 1.0).unwrap();
        assert_eq!(s.state().weights, vec![1.5, 1.0]);
        assert!(s.posterior_norm() > 0.0);
    }

    #[test]
    fn cached_factor_tracks_updates() {
        let mut s = sampler(3, 3);
        for (phi, r) in [([1.0, 0.0, 0.5], 1.0), ([0.2, 0.4, 0.1], 0.0), ([0.0, 1.0, 1.0], 0.5)] {
            s.update(&phi, r).unwrap();
        }
        let cached = s.factor.clone().unwrap();
        let fresh = s.state().precision_inverse.cholesky(0.0).unwrap();
        for (a, b) in cached.as_slice().iter().zip(fresh.as_slice()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn selection_is_deterministic_for_seed() {
        let pool: Vec<(String, Vec<f64>)> = (0..5)
            .map(|i| (format!("Candidate-{i}"), vec![i as f64 * 0.1, 1.0 - i as f64 * 0.2, 0.3]))
            .collect();
        let picks_a: Vec<String> = {
            let mut s = sampler(3, 42);
            (0..10).map(|_| s.select(&pool).unwrap().to_string()).collect()
        };
        let picks_b: Vec<String> = {
            let mut s = sampler(3, 42);
            (0..10).map(|_| s.select(&pool).unwrap().to_string()).collect()
        };
        assert_eq!(picks_a, picks_b);
    }

    #[test]
    fn reordering_pool_does_not_change_choice() {
        let pool: Vec<(String, Vec<f64>)> = vec![
            ("a".into(), vec![1.0, 0.0, 0.0]),
            ("b".into(), vec![0.0, 1.0, 0.0]),
            ("c".into(), vec![0.0, 0.0, 1.0]),
        ];
        let mut reversed = pool.clone();
        reversed.reverse();
        for seed in 0..20 {
            let a = sampler(3, seed).select(&pool).unwrap().to_string();
            let b = sampler(3, seed).select(&reversed).unwrap().to_string();
            assert_eq!(a, b, "seed {seed}");
        }
    }

    #[test]
    fn ties_go_to_first_arm() {
        let pool: Vec<(String, Vec<f64>)> = vec![
            ("first".into(), vec![0.5, 0.5]),
            ("second".into(), vec![0.5, 0.5]),
        ];
        for seed in 0..10 {
            assert_eq!(sampler(2, seed).select(&pool).unwrap(), "first");
        }
    }

    #[test]
    fn learned_arm_wins_with_zero_noise() {
        let params = PolicyParams {
            lambda: 1.0,
            sigma: 0.0,
        };
        let mut s = LinearThompsonSampler::new(2, params, Some(9)).unwrap();
        for _ in 0..5 {
            s.update(&[0.0, 1.0], 1.0).unwrap();
            s.update(&[1.0, 0.0], 0.0).unwrap();
        }
        let pool = vec![("bad".to_string(), vec![1.0, 0.0]), ("good".to_string(), vec![0.0, 1.0])];
        assert_eq!(s.select(&pool).unwrap(), "good");
    }

    #[test]
    fn rejects_empty_pool_and_dimension_mismatch() {
        let mut s = sampler(3, 0);
        let empty: Vec<(String, Vec<f64>)> = vec![];
        assert!(matches!(s.select(&empty), Err(IntentflowError::EmptyPool)));

        let pool = vec![("x".to_string(), vec![1.0, 2.0])];
        assert!(matches!(
            s.select(&pool),
            Err(IntentflowError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
        assert!(s.update(&[1.0], 1.0).is_err());
    }

    #[test]
    fn rejects_bad_params() {
        assert!(LinearThompsonSampler::new(0, PolicyParams::default(), None).is_err());
        let params = PolicyParams {
            lambda: 0.0,
            sigma: 1.0,
        };
        assert!(LinearThompsonSampler::new(2, params, None).is_err());
    }

    #[test]
    fn resumed_state_refactors_lazily() {
        let mut s = sampler(2, 5);
        s.update(&[1.0, 1.0], 1.0).unwrap();
        let state = s.into_state();
        let mut resumed = LinearThompsonSampler::from_state(state.clone(), PolicyParams::default(), Some(5)).unwrap();
        assert!(resumed.factor.is_none());
        let pool = vec![("x".to_string(), vec![1.0, 0.0])];
        resumed.select(&pool).unwrap();
        assert!(resumed.factor.is_some());
        assert_eq!(resumed.state(), &state);
    }
}
