//! Per-solve memory and timing report.
//!
//! The numbers are both logged (at `info` level, one line per setup step)
//! and returned to the caller as a [`SolveReport`].

use std::fmt;
use std::time::{Duration, Instant};

use log::info;

use crate::dist::RewardVector;
use crate::sparse::{BuiltMatrix, MatrixKind};
use crate::utils::kb;

/// Encoding and footprint of one explicit vector or helper structure.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorReport {
    pub label: &'static str,
    /// Distinct values of the compact form, [`None`] when dense.
    pub num_dist: Option<usize>,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolveReport {
    pub n: usize,
    pub nnz: usize,
    pub matrix_kind: MatrixKind,
    pub matrix_bytes: usize,
    pub vectors: Vec<VectorReport>,
    /// Structures only needed while setting up, such as predecessor lists.
    pub auxiliary: Vec<VectorReport>,
    pub iteration_vectors: usize,
    pub iteration_bytes: usize,
    pub iterations: usize,
    pub setup_time: Duration,
    pub iteration_time: Duration,
}

impl SolveReport {
    pub fn total_bytes(&self) -> usize {
        let held = |list: &[VectorReport]| list.iter().map(|v| v.bytes).sum::<usize>();
        self.matrix_bytes + held(&self.vectors) + held(&self.auxiliary) + self.iteration_bytes
    }

    pub fn total_time(&self) -> Duration {
        self.setup_time + self.iteration_time
    }
}

impl fmt::Display for SolveReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n={}, nnz={}, {} matrix, {} iterations, {:.1} KB, {:.3}s",
            self.n,
            self.nnz,
            self.matrix_kind,
            self.iterations,
            kb(self.total_bytes()),
            self.total_time().as_secs_f64()
        )
    }
}

/// Collects a [`SolveReport`] while a solve runs.
#[derive(Debug)]
pub(crate) struct Diagnostics {
    report: SolveReport,
    start: Instant,
    iterations_start: Option<Instant>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self {
            report: SolveReport {
                n: 0,
                nnz: 0,
                matrix_kind: MatrixKind::RowMajor,
                matrix_bytes: 0,
                vectors: Vec::new(),
                auxiliary: Vec::new(),
                iteration_vectors: 0,
                iteration_bytes: 0,
                iterations: 0,
                setup_time: Duration::ZERO,
                iteration_time: Duration::ZERO,
            },
            start: Instant::now(),
            iterations_start: None,
        }
    }

    pub fn matrix(&mut self, built: &BuiltMatrix) {
        let m = &built.matrix;
        self.report.n = m.n();
        self.report.nnz = m.nnz();
        self.report.matrix_kind = m.kind();
        self.report.matrix_bytes = built.mem_bytes();
        info!(
            "Building sparse matrix... [n={}, nnz={}{}] [{:.1} KB]",
            m.n(),
            m.nnz(),
            if m.is_compact() { ", compact" } else { "" },
            kb(self.report.matrix_bytes)
        );
    }

    pub fn vector(&mut self, label: &'static str, v: &RewardVector) {
        let entry = VectorReport {
            label,
            num_dist: v.num_dist(),
            bytes: v.mem_bytes(),
        };
        match entry.num_dist {
            Some(d) => info!("Creating vector for {}... [dist={}, compact] [{:.1} KB]", label, d, kb(entry.bytes)),
            None => info!("Creating vector for {}... [{:.1} KB]", label, kb(entry.bytes)),
        }
        self.report.vectors.push(entry);
    }

    pub fn auxiliary(&mut self, label: &'static str, bytes: usize) {
        info!("Building {}... [{:.1} KB]", label, kb(bytes));
        self.report.auxiliary.push(VectorReport {
            label,
            num_dist: None,
            bytes,
        });
    }

    pub fn iteration_vectors(&mut self, count: usize, n: usize) {
        let each = n * std::mem::size_of::<f64>();
        self.report.iteration_vectors = count;
        self.report.iteration_bytes = count * each;
        info!("Allocating iteration vectors... [{} x {:.1} KB]", count, kb(each));
    }

    /// Setup is over; log the memory total.
    pub fn start_iterations(&mut self) {
        let now = Instant::now();
        self.report.setup_time = now - self.start;
        self.iterations_start = Some(now);
        info!("TOTAL: [{:.1} KB]", kb(self.report.total_bytes()));
        info!("Starting iterations...");
    }

    pub fn finish(mut self, iterations: usize) -> SolveReport {
        let now = Instant::now();
        if let Some(start) = self.iterations_start {
            self.report.iteration_time = now - start;
        }
        self.report.iterations = iterations;
        let r = &self.report;
        let average = if iterations > 0 {
            r.iteration_time.as_secs_f64() / iterations as f64
        } else {
            0.0
        };
        info!(
            "Iterative method: {} iterations in {:.2} seconds (average {:.6}, setup {:.2})",
            iterations,
            r.total_time().as_secs_f64(),
            average,
            r.setup_time.as_secs_f64()
        );
        self.report
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::sparse::{build, BuildOptions, Triplets};

    #[test]
    fn test_report_totals() {
        let t = Triplets::new(4, [(0, 1, 1.0), (1, 2, 1.0), (2, 3, 1.0), (3, 3, 1.0)]);
        let built = build(&t, BuildOptions::default()).unwrap();

        let mut d = Diagnostics::new();
        d.matrix(&built);
        d.vector("rewards", &RewardVector::Dense(vec![1.0; 4]));
        d.iteration_vectors(2, 4);
        d.auxiliary("predecessors", 20);
        d.start_iterations();
        let report = d.finish(7);

        assert_eq!(report.n, 4);
        assert_eq!(report.nnz, 4);
        assert_eq!(report.matrix_kind, MatrixKind::RowMajor);
        assert_eq!(report.matrix_bytes, 4 * 12 + 4);
        assert_eq!(report.vectors[0].bytes, 32);
        assert_eq!(report.iteration_bytes, 64);
        assert_eq!(report.auxiliary[0].label, "predecessors");
        assert_eq!(report.total_bytes(), 52 + 32 + 20 + 64);
        assert_eq!(report.iterations, 7);
    }
}
