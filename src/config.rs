//! Solver configuration.

use crate::engine::{Criterion, Mode};
use crate::error::SolveError;
use crate::tracker::Stage;

/// Iterative method for unbounded linear equation systems.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum LinearMethod {
    Power,
    #[default]
    Jacobi,
    /// Jacobi over-relaxation with weight [`SolverConfig::omega`].
    Jor,
}

/// Options shared by all measures; read-only during a solve.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverConfig {
    /// Prefer the compact matrix and vector encodings when they save space.
    pub compact: bool,
    /// Iteration cap of convergence-seeking methods.
    pub max_iters: usize,
    /// Convergence threshold (also the Poisson truncation accuracy).
    pub epsilon: f64,
    pub criterion: Criterion,
    pub linear_method: LinearMethod,
    /// Relaxation weight of [`LinearMethod::Jor`], in `(0, 2)`.
    pub omega: f64,
    /// Uniformization rate relative to the largest exit rate (at least 1).
    pub uniformization_factor: f64,
    /// Fail every allocation at this stage.
    pub fault: Option<Stage>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            compact: true,
            max_iters: 10_000,
            epsilon: 1e-6,
            criterion: Criterion::Relative,
            linear_method: LinearMethod::Jacobi,
            omega: 0.9,
            uniformization_factor: 1.02,
            fault: None,
        }
    }
}

impl SolverConfig {
    /// Reject inconsistent parameters.
    pub fn validate(&self) -> Result<(), SolveError> {
        if !(self.epsilon > 0.0 && self.epsilon.is_finite()) {
            return Err(SolveError::InvalidBound(format!("epsilon must be positive, got {}", self.epsilon)));
        }
        if self.linear_method == LinearMethod::Jor && !(self.omega > 0.0 && self.omega < 2.0) {
            return Err(SolveError::InvalidBound(format!("omega must lie in (0, 2), got {}", self.omega)));
        }
        if !(self.uniformization_factor >= 1.0 && self.uniformization_factor.is_finite()) {
            return Err(SolveError::InvalidBound(format!(
                "uniformization factor must be at least 1, got {}",
                self.uniformization_factor
            )));
        }
        Ok(())
    }

    /// Convergence mode from the configured tolerance and cap.
    pub fn convergence(&self) -> Mode {
        Mode::Convergence {
            epsilon: self.epsilon,
            max_iters: self.max_iters,
            criterion: self.criterion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SolverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.convergence(),
            Mode::Convergence {
                epsilon: 1e-6,
                max_iters: 10_000,
                criterion: Criterion::Relative
            }
        );
    }

    #[test]
    fn test_invalid() {
        let bad_epsilon = SolverConfig {
            epsilon: 0.0,
            ..SolverConfig::default()
        };
        assert!(bad_epsilon.validate().is_err());

        let bad_omega = SolverConfig {
            linear_method: LinearMethod::Jor,
            omega: 2.0,
            ..SolverConfig::default()
        };
        assert!(bad_omega.validate().is_err());

        // omega is irrelevant unless JOR is selected
        let unused_omega = SolverConfig {
            omega: 5.0,
            ..SolverConfig::default()
        };
        assert!(unused_omega.validate().is_ok());
    }
}
