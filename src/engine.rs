//! The matrix-vector iteration kernel shared by every measure.
//!
//! One iteration computes, for every row `i`,
//!
//! ```text
//! acc     = seed(i, current)
//! acc    += w * current[j]       for each (j, w) in row i, ascending j
//! next[i] = finish(i, acc, current)
//! ```
//!
//! and then swaps the two buffers. Measures differ only in the [`Combine`]
//! strategy and the termination [`Mode`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;

use crate::error::SolveError;
use crate::sparse::SparseMatrix;

/// Per-row combine strategy of the kernel.
pub trait Combine {
    /// Initial accumulator of row `row`.
    fn seed(&self, row: usize, current: &[f64]) -> f64;

    /// Final value of row `row`, given the accumulated sum.
    fn finish(&self, row: usize, acc: f64, current: &[f64]) -> f64 {
        let _ = (row, current);
        acc
    }
}

/// Convergence test between two successive iterates.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum Criterion {
    /// `max |x' - x|`
    Absolute,
    /// `max |x' - x| / |x'|`; entries with `x' = 0` are compared absolutely.
    #[default]
    Relative,
}

impl Criterion {
    /// Largest difference between `old` and `new` under this criterion.
    pub fn max_diff(self, old: &[f64], new: &[f64]) -> f64 {
        old.iter()
            .zip(new)
            .map(|(&x, &y)| {
                if x == y {
                    // Also covers two equal infinities.
                    return 0.0;
                }
                let d = (y - x).abs();
                match self {
                    Criterion::Relative if y != 0.0 => d / y.abs(),
                    _ => d,
                }
            })
            .fold(0.0, f64::max)
    }
}

/// When to stop iterating.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Mode {
    /// Exactly `k` iterations, regardless of any iteration cap.
    FixedHorizon(usize),
    /// Until two iterates differ by less than `epsilon`, at most `max_iters` times.
    Convergence {
        epsilon: f64,
        max_iters: usize,
        criterion: Criterion,
    },
}

/// Cooperative cancellation flag, polled between iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Two equal-length iteration buffers and the index of the current one.
#[derive(Debug, Clone, PartialEq)]
pub struct PingPong {
    buffers: [Vec<f64>; 2],
    active: usize,
}

impl PingPong {
    /// `initial` becomes the current iterate; `spare` only provides storage.
    ///
    /// # Panics
    ///
    /// Panics if the two buffers differ in length.
    pub fn new(initial: Vec<f64>, spare: Vec<f64>) -> Self {
        assert_eq!(initial.len(), spare.len(), "iteration buffers differ in length");
        Self {
            buffers: [initial, spare],
            active: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buffers[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current(&self) -> &[f64] {
        &self.buffers[self.active]
    }

    /// The previous iterate (or the spare storage before the first step).
    pub fn previous(&self) -> &[f64] {
        &self.buffers[1 - self.active]
    }

    pub fn mem_bytes(&self) -> usize {
        2 * self.len() * std::mem::size_of::<f64>()
    }

    /// Apply one kernel iteration and make the result current.
    ///
    /// # Panics
    ///
    /// Panics if the matrix dimension differs from the buffer length.
    pub fn step<C: Combine + ?Sized>(&mut self, matrix: &SparseMatrix, combine: &C) {
        assert_eq!(matrix.n(), self.len(), "matrix and iteration vectors differ in size");
        let [a, b] = &mut self.buffers;
        let (current, next) = if self.active == 0 { (&*a, b) } else { (&*b, a) };
        for (i, row) in matrix.rows().enumerate() {
            let acc = row.accumulate(combine.seed(i, current), current);
            next[i] = combine.finish(i, acc, current);
        }
        self.active = 1 - self.active;
    }

    /// Hand the current iterate over; the spare buffer is dropped.
    pub fn into_current(self) -> Vec<f64> {
        let [a, b] = self.buffers;
        if self.active == 0 {
            a
        } else {
            b
        }
    }
}

/// What happened during [`iterate`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Outcome {
    pub iterations: usize,
    /// Always `true` for [`Mode::FixedHorizon`].
    pub converged: bool,
    /// Difference between the last two iterates ([`f64::INFINITY`] if none was measured).
    pub max_diff: f64,
}

/// Run the kernel on `buffers` until `mode` says stop.
///
/// `on_iteration(k, x)` is called after the `k`-th iteration with the new
/// current iterate. A fixed horizon of `0` returns immediately without
/// touching the buffers.
pub fn iterate<C: Combine + ?Sized>(
    matrix: &SparseMatrix,
    combine: &C,
    mode: Mode,
    buffers: &mut PingPong,
    cancel: Option<&CancelToken>,
    on_iteration: &mut dyn FnMut(usize, &[f64]),
) -> Result<Outcome, SolveError> {
    let cancelled = |iterations| -> Result<(), SolveError> {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            debug!("iterate: cancelled after {} iterations", iterations);
            return Err(SolveError::Cancelled { iterations });
        }
        Ok(())
    };

    match mode {
        Mode::FixedHorizon(k) => {
            for iter in 1..=k {
                cancelled(iter - 1)?;
                buffers.step(matrix, combine);
                on_iteration(iter, buffers.current());
            }
            Ok(Outcome {
                iterations: k,
                converged: true,
                max_diff: f64::INFINITY,
            })
        }
        Mode::Convergence {
            epsilon,
            max_iters,
            criterion,
        } => {
            let mut max_diff = f64::INFINITY;
            for iter in 1..=max_iters {
                cancelled(iter - 1)?;
                buffers.step(matrix, combine);
                max_diff = criterion.max_diff(buffers.previous(), buffers.current());
                on_iteration(iter, buffers.current());
                if max_diff < epsilon {
                    debug!("iterate: converged after {} iterations (max diff {:e})", iter, max_diff);
                    return Ok(Outcome {
                        iterations: iter,
                        converged: true,
                        max_diff,
                    });
                }
            }
            Ok(Outcome {
                iterations: max_iters,
                converged: false,
                max_diff,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::sparse::{build, BuildOptions, Triplets};

    struct Seeded<'a>(&'a [f64]);

    impl Combine for Seeded<'_> {
        fn seed(&self, row: usize, _current: &[f64]) -> f64 {
            self.0[row]
        }
    }

    struct NoSeed;

    impl Combine for NoSeed {
        fn seed(&self, _row: usize, _current: &[f64]) -> f64 {
            0.0
        }
    }

    fn absorbing() -> SparseMatrix {
        let t = Triplets::new(3, [(0, 1, 1.0), (1, 2, 1.0), (2, 2, 1.0)]);
        build(&t, BuildOptions::default()).unwrap().matrix
    }

    fn buffers(initial: Vec<f64>) -> PingPong {
        let n = initial.len();
        PingPong::new(initial, vec![0.0; n])
    }

    #[test]
    fn test_fixed_horizon() {
        let m = absorbing();
        let mut b = buffers(vec![0.0; 3]);
        let out = iterate(&m, &Seeded(&[1.0, 1.0, 0.0]), Mode::FixedHorizon(2), &mut b, None, &mut |_, _| {})
            .unwrap();
        assert_eq!(out.iterations, 2);
        assert_eq!(b.into_current(), vec![2.0, 1.0, 0.0]);
    }

    #[test]
    fn test_zero_horizon_is_identity() {
        let m = absorbing();
        let mut b = PingPong::new(vec![3.0, 2.0, 1.0], vec![f64::NAN; 3]);
        let mut calls = 0;
        let out = iterate(&m, &NoSeed, Mode::FixedHorizon(0), &mut b, None, &mut |_, _| calls += 1).unwrap();
        assert_eq!(out.iterations, 0);
        assert_eq!(calls, 0);
        assert_eq!(b.current(), &[3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_convergence() {
        // Pᵀ of [[0.8, 0.2], [0.3, 0.7]]
        let t = Triplets::new(2, [(0, 0, 0.8), (1, 0, 0.2), (0, 1, 0.3), (1, 1, 0.7)]);
        let m = build(&t, BuildOptions::default()).unwrap().matrix;
        let mut b = buffers(vec![0.5, 0.5]);
        let mode = Mode::Convergence {
            epsilon: 1e-12,
            max_iters: 1000,
            criterion: Criterion::Absolute,
        };
        let out = iterate(&m, &NoSeed, mode, &mut b, None, &mut |_, _| {}).unwrap();
        assert!(out.converged);
        assert!(out.iterations < 100);
        assert!((b.current()[0] - 0.6).abs() < 1e-10);
        assert!((b.current()[1] - 0.4).abs() < 1e-10);
    }

    #[test]
    fn test_cap_reached() {
        let t = Triplets::new(2, [(0, 1, 1.0), (1, 0, 1.0)]);
        let m = build(&t, BuildOptions::default()).unwrap().matrix;
        let mut b = buffers(vec![1.0, 0.0]);
        let mode = Mode::Convergence {
            epsilon: 1e-6,
            max_iters: 7,
            criterion: Criterion::Relative,
        };
        let out = iterate(&m, &NoSeed, mode, &mut b, None, &mut |_, _| {}).unwrap();
        assert!(!out.converged);
        assert_eq!(out.iterations, 7);
        assert_eq!(out.max_diff, 1.0);
        assert_eq!(b.current(), &[0.0, 1.0]);
    }

    #[test]
    fn test_cancel() {
        let m = absorbing();
        let token = CancelToken::new();
        let mut b = buffers(vec![0.0; 3]);
        let mut on_iteration = |k: usize, _: &[f64]| {
            if k == 3 {
                token.cancel();
            }
        };
        let res = iterate(&m, &NoSeed, Mode::FixedHorizon(10), &mut b, Some(&token), &mut on_iteration);
        assert!(matches!(res, Err(SolveError::Cancelled { iterations: 3 })));
    }

    #[test]
    fn test_relative_criterion() {
        assert_eq!(Criterion::Relative.max_diff(&[1.0, 0.0], &[2.0, 0.5]), 0.5);
        assert_eq!(Criterion::Absolute.max_diff(&[1.0, 0.0], &[2.0, 0.5]), 1.0);
        assert_eq!(Criterion::Relative.max_diff(&[], &[]), 0.0);
        assert_eq!(Criterion::Absolute.max_diff(&[f64::INFINITY], &[f64::INFINITY]), 0.0);
    }
}
