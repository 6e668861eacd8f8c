//! Truncated Poisson weights for uniformization.
//!
//! Transient analysis of a continuous-time chain at time `t` sums the
//! iterates of the uniformized chain weighted by the Poisson probabilities
//! `e^{-λ} λ^i / i!` with `λ = q·t`. Only the window `left..=right` holding
//! all but `ε` of the mass is kept. Weights are computed relative to the
//! mode (which gets weight 1) and walked outwards, so nothing underflows
//! for large `λ`; callers divide by [`PoissonWeights::total_weight`].

use log::debug;

use crate::error::SolveError;

#[derive(Debug, Clone, PartialEq)]
pub struct PoissonWeights {
    pub left: usize,
    pub right: usize,
    /// Unnormalized weights of `left..=right`.
    pub weights: Vec<f64>,
    pub total_weight: f64,
}

impl PoissonWeights {
    /// Weights for rate `lambda`, dropping at most `epsilon` of the mass.
    pub fn compute(lambda: f64, epsilon: f64) -> Result<Self, SolveError> {
        if !(lambda.is_finite() && lambda >= 0.0) {
            return Err(SolveError::InvalidBound(format!("Poisson rate {} is not a finite non-negative number", lambda)));
        }
        if !(epsilon > 0.0 && epsilon < 1.0) {
            return Err(SolveError::InvalidBound(format!("accuracy {} is not in (0, 1)", epsilon)));
        }
        if lambda == 0.0 {
            return Ok(Self {
                left: 0,
                right: 0,
                weights: vec![1.0],
                total_weight: 1.0,
            });
        }

        // Each tail may drop a quarter of epsilon, measured against the
        // running total (which only grows).
        let delta = epsilon / 4.0;
        let mode = lambda.floor() as usize;
        let mut total = 1.0;

        // Going down, w[i-1] = w[i] * i / λ.
        let mut below = Vec::new();
        let mut w = 1.0;
        let mut i = mode;
        while i > 0 {
            let r = i as f64 / lambda;
            if r < 1.0 && w * r / (1.0 - r) <= delta * total {
                break;
            }
            w *= r;
            if w == 0.0 {
                break;
            }
            i -= 1;
            below.push(w);
            total += w;
        }
        let left = i;

        // Going up, w[i+1] = w[i] * λ / (i + 1).
        let mut above = Vec::new();
        let mut w = 1.0;
        let mut i = mode;
        loop {
            let r = lambda / (i + 1) as f64;
            if r < 1.0 && w * r / (1.0 - r) <= delta * total {
                break;
            }
            w *= r;
            if w == 0.0 {
                break;
            }
            i += 1;
            above.push(w);
            total += w;
        }
        let right = i;

        let mut weights = below;
        weights.reverse();
        weights.push(1.0);
        weights.extend(above);
        debug!(
            "PoissonWeights::compute(λ = {}, ε = {:e}): left = {}, right = {}",
            lambda, epsilon, left, right
        );
        Ok(Self {
            left,
            right,
            weights,
            total_weight: total,
        })
    }

    /// Normalized probability of `i` (zero outside the window).
    pub fn probability(&self, i: usize) -> f64 {
        if i < self.left || i > self.right {
            0.0
        } else {
            self.weights[i - self.left] / self.total_weight
        }
    }
}
