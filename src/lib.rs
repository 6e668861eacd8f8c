//! # sparse-mc: sparse numerics for symbolic Markov models
//!
//! **`sparse-mc`** computes quantitative measures (expected cumulative and
//! instantaneous rewards, reachability probabilities, steady-state and
//! transient distributions) of discrete- and continuous-time Markov chains
//! whose transition structure is held symbolically, as a multi-terminal
//! decision diagram (MTBDD).
//!
//! Symbolic representations are compact but slow to iterate over. Each solve
//! therefore flattens the slice of the model it needs into an explicit sparse
//! matrix, runs a matrix-vector fixed-point iteration over it, and hands the
//! result vector back. Everything built along the way is released before the
//! solve returns.
//!
//! ## Key Features
//!
//! - **Two matrix encodings**: plain row-major, and a compact one that stores each distinct non-zero value once and packs `(column, value index)` into a single `u32`. The compact form is chosen only when it is smaller.
//! - **Compact vectors**: reward vectors with few distinct values are stored as a dictionary plus 16-bit pointers.
//! - **One kernel**: every measure is the same row loop ([`engine::iterate`]) with a different [`Combine`][engine::Combine] strategy and termination [`Mode`][engine::Mode].
//! - **Accounted resources**: every explicit structure goes through a [`Tracker`][tracker::Tracker], which can also inject allocation failures.
//! - **Reference symbolic layer**: a small MTBDD manager ([`mtbdd`]) and state index ([`odd`]) implement the [`Symbolic`][symbolic::Symbolic] boundary.
//!
//! ## Basic Usage
//!
//! ```rust
//! use sparse_mc::config::SolverConfig;
//! use sparse_mc::measures::{Model, Solver};
//! use sparse_mc::mtbdd::Mtbdd;
//! use sparse_mc::odd::Odd;
//! use sparse_mc::types::VarSet;
//!
//! let dd = Mtbdd::default();
//! // Two states, one boolean variable: rows are x1, columns are x2.
//! let (rows, cols) = VarSet::interleaved(1, 1);
//! let odd = Odd::build(&dd, dd.one, &rows).unwrap();
//!
//! // 0 -> 1 -> 1, reward 1 in state 0
//! let trans = dd.encode_matrix(&[(0, 1, 1.0), (1, 1, 1.0)], &rows, &cols).unwrap();
//! let rewards = dd.encode_vector(&[1.0, 0.0], &rows).unwrap();
//!
//! let config = SolverConfig::default();
//! let solver = Solver::new(&dd, &config);
//! let model = Model { trans, rows: &rows, cols: &cols, index: &odd };
//! let sol = solver.cumulative_reward(&model, rewards, dd.zero, 5).unwrap();
//! assert_eq!(sol.values, vec![1.0, 0.0]);
//! ```
//!
//! ## Core Components
//!
//! - **[`sparse`]**: explicit sparse matrices and their two-pass builder.
//! - **[`dist`]**: dense and distinct-value vectors.
//! - **[`engine`]**: the iteration kernel.
//! - **[`measures`]**: the measures, built on the kernel.
//! - **[`tracker`]** and **[`diagnostics`]**: memory accounting and per-solve reports.

pub mod cache;
pub mod config;
pub mod diagnostics;
pub mod dist;
pub mod engine;
pub mod error;
pub mod fox_glynn;
pub mod measures;
pub mod mtbdd;
pub mod odd;
pub mod reference;
pub mod sparse;
pub mod symbolic;
pub mod table;
pub mod tracker;
pub mod types;
pub mod utils;
