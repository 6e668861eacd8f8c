//! Error types.
//!
//! [`DdError`] is raised by the symbolic layer (unique table exhaustion,
//! variable-set mismatches). [`SolveError`] is what every solve returns to
//! the caller; symbolic failures surface as [`SolveError::BuildFailure`].

use num_bigint::BigUint;

use crate::tracker::Stage;
use crate::types::Var;

/// Failure inside the decision-diagram layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DdError {
    /// The unique table has no free slot left.
    #[error("decision diagram storage exhausted (capacity {capacity} nodes)")]
    Exhausted { capacity: usize },

    /// A diagram depends on a variable outside the declared row/column sets.
    #[error("diagram depends on variable {var} outside the declared variable sets")]
    UnsupportedVariable { var: Var },

    /// Row/column variable sets are inconsistent with each other or with the state index.
    #[error("variable set mismatch: {0}")]
    VariableMismatch(String),

    /// The reachable state space does not fit the 32-bit column index.
    #[error("state space of {states} states exceeds the supported index width")]
    StateSpaceTooLarge { states: BigUint },

    /// Too many non-zeros for the 32-bit row offsets.
    #[error("matrix has {nnz} non-zeros, exceeding the supported offset width")]
    TooManyNonZeros { nnz: usize },
}

/// Outcome of a failed solve.
#[derive(Debug, thiserror::Error)]
pub enum SolveError {
    /// The symbolic-to-explicit conversion failed.
    #[error("failed to build explicit structure: {0}")]
    BuildFailure(#[from] DdError),

    /// A buffer could not be allocated.
    #[error("cannot allocate {bytes} bytes for {stage}")]
    AllocationFailure { stage: Stage, bytes: usize },

    /// A convergence-seeking method hit its iteration cap.
    ///
    /// `last` holds the final (unconverged) iterate.
    #[error(
        "iterative method did not converge within {iterations} iterations (max diff {max_diff:.2e}, epsilon {epsilon:.2e})"
    )]
    NonConvergence {
        iterations: usize,
        max_diff: f64,
        epsilon: f64,
        last: Vec<f64>,
    },

    /// Rejected before any allocation: negative bound, bad parameter, or
    /// inconsistent row/column variable counts.
    #[error("invalid bound: {0}")]
    InvalidBound(String),

    /// The cancellation token was set between two iterations.
    #[error("cancelled after {iterations} iterations")]
    Cancelled { iterations: usize },
}

impl SolveError {
    /// The best-effort vector of a non-converged solve, if any.
    pub fn unconverged_result(&self) -> Option<&[f64]> {
        match self {
            SolveError::NonConvergence { last, .. } => Some(last),
            _ => None,
        }
    }
}
