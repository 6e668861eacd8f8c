//! Measures over symbolic Markov chains.
//!
//! Every measure follows the same shape: validate, build the explicit matrix,
//! build the vectors it needs, allocate the iteration buffers, run
//! [`iterate`] with a measure-specific [`Combine`], and hand the current
//! buffer to the caller. All intermediate structures are acquired through the
//! solver's [`Tracker`] and released when the measure returns, whichever way
//! it returns.
//!
//! | measure | matrix | iterate |
//! |---|---|---|
//! | [`Solver::cumulative_reward`] | `P` | `x' = r + P x`, `k` times from `0` |
//! | [`Solver::instantaneous_reward`] | `P` | `x' = P x`, `k` times from `r` |
//! | [`Solver::bounded_until`] | `P` on maybe rows | `x' = yes + P x`, `k` times from `yes` |
//! | [`Solver::until`] | `P` on maybe rows | power, Jacobi or JOR until converged |
//! | [`Solver::reach_reward`] | `P` | like `until`, with rewards; infinite where the target is missed |
//! | [`Solver::steady_state`] | uniformized `Pᵀ` or `Rᵀ` | power method until converged, normalized |
//! | [`Solver::transient_dtmc`] | `Pᵀ` | `x' = Pᵀ x`, `k` times from `π₀` |
//! | [`Solver::transient_ctmc`] | uniformized `Rᵀ` | Poisson-weighted sum of iterates |
//! | [`Solver::ctmc_cumulative_reward`] | uniformized `R` | Poisson tail-weighted sum of iterates |

use log::{info, warn};

use crate::config::{LinearMethod, SolverConfig};
use crate::diagnostics::{Diagnostics, SolveReport};
use crate::dist::RewardVector;
use crate::engine::{iterate, CancelToken, Combine, Mode, Outcome, PingPong};
use crate::error::SolveError;
use crate::fox_glynn::PoissonWeights;
use crate::sparse::{build, BuildOptions, BuiltMatrix, SparseMatrix, SymbolicEntries};
use crate::symbolic::{Op, StateIndex, Symbolic};
use crate::tracker::{try_alloc, Stage, Tracked, Tracker};
use crate::types::VarSet;

/// A symbolic chain: transition function over interleaved row and column
/// variables, plus the index of its reachable states.
pub struct Model<'a, D: Symbolic> {
    /// Probabilities (discrete time) or rates (continuous time).
    pub trans: D::Node,
    pub rows: &'a VarSet,
    pub cols: &'a VarSet,
    pub index: &'a D::Index,
}

impl<D: Symbolic> Clone for Model<'_, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: Symbolic> Copy for Model<'_, D> {}

impl<D: Symbolic> Model<'_, D> {
    pub fn num_states(&self) -> usize {
        self.index.num_states()
    }
}

/// Result vector (indexed like the model's state index) and its report.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub values: Vec<f64>,
    pub report: SolveReport,
}

/// Runs measures against one symbolic engine under one configuration.
pub struct Solver<'a, D: Symbolic> {
    dd: &'a D,
    config: &'a SolverConfig,
    tracker: Tracker,
    cancel: Option<CancelToken>,
}

impl<'a, D: Symbolic> Solver<'a, D> {
    pub fn new(dd: &'a D, config: &'a SolverConfig) -> Self {
        Self {
            dd,
            config,
            tracker: Tracker::new(config.fault),
            cancel: None,
        }
    }

    /// Poll `token` between iterations.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn config(&self) -> &SolverConfig {
        self.config
    }

    /// Expected reward accumulated within `bound` steps (`R≤k [C]`).
    ///
    /// The reward of a step from `i` is `state_rewards(i) + Σ_j P(i,j)·trans_rewards(i,j)`.
    pub fn cumulative_reward(
        &self,
        model: &Model<'_, D>,
        state_rewards: D::Node,
        trans_rewards: D::Node,
        bound: i64,
    ) -> Result<Solution, SolveError> {
        self.check(model)?;
        let k = steps(bound)?;
        info!("Computing cumulative reward for {} steps", k);

        let mut diag = Diagnostics::new();
        let matrix = self.matrix(model, model.trans, BuildOptions::default(), &mut diag)?;
        let r = self.step_rewards(model, state_rewards, trans_rewards)?;
        let rewards = self.vector(model, r, "rewards", &mut diag)?;
        let mut buffers = self.buffers(model.num_states(), 2, |_| 0.0, &mut diag)?;

        diag.start_iterations();
        let outcome = self.run(&matrix.matrix, &Seeded(&rewards), Mode::FixedHorizon(k), &mut buffers)?;
        Ok(Solution {
            values: buffers.into_inner().into_current(),
            report: diag.finish(outcome.iterations),
        })
    }

    /// Expected state reward at step `bound` (`R=k [I]`).
    pub fn instantaneous_reward(
        &self,
        model: &Model<'_, D>,
        state_rewards: D::Node,
        bound: i64,
    ) -> Result<Solution, SolveError> {
        self.check(model)?;
        let k = steps(bound)?;
        info!("Computing instantaneous reward at step {}", k);

        let mut diag = Diagnostics::new();
        let matrix = self.matrix(model, model.trans, BuildOptions::default(), &mut diag)?;
        let rewards = self.dense(model, state_rewards)?;
        let mut buffers = self.buffers(model.num_states(), 2, |i| rewards[i], &mut diag)?;
        drop(rewards);

        diag.start_iterations();
        let outcome = self.run(&matrix.matrix, &Zero, Mode::FixedHorizon(k), &mut buffers)?;
        Ok(Solution {
            values: buffers.into_inner().into_current(),
            report: diag.finish(outcome.iterations),
        })
    }

    /// Probability of reaching `psi` within `bound` steps through `phi` (`P[φ U≤k ψ]`).
    ///
    /// `phi` and `psi` are 0/1 indicators over the row variables.
    pub fn bounded_until(
        &self,
        model: &Model<'_, D>,
        phi: D::Node,
        psi: D::Node,
        bound: i64,
    ) -> Result<Solution, SolveError> {
        self.check(model)?;
        let k = steps(bound)?;
        info!("Computing bounded until probabilities for {} steps", k);

        let mut diag = Diagnostics::new();
        let restricted = self.restrict_to_maybe(model, phi, psi)?;
        let matrix = self.matrix(model, restricted, BuildOptions::default(), &mut diag)?;
        let yes = self.vector(model, psi, "yes", &mut diag)?;
        let mut buffers = self.buffers(model.num_states(), 2, |i| yes.get(i), &mut diag)?;

        diag.start_iterations();
        let outcome = self.run(&matrix.matrix, &Seeded(&yes), Mode::FixedHorizon(k), &mut buffers)?;
        Ok(Solution {
            values: buffers.into_inner().into_current(),
            report: diag.finish(outcome.iterations),
        })
    }

    /// Probability of eventually reaching `psi` through `phi` (`P[φ U ψ]`).
    ///
    /// Solved with the configured [`LinearMethod`] until convergence.
    pub fn until(&self, model: &Model<'_, D>, phi: D::Node, psi: D::Node) -> Result<Solution, SolveError> {
        self.check(model)?;
        info!("Computing until probabilities ({:?})", self.config.linear_method);

        let mut diag = Diagnostics::new();
        let restricted = self.restrict_to_maybe(model, phi, psi)?;
        let matrix = self.matrix(model, restricted, self.linear_options(), &mut diag)?;
        let yes = self.vector(model, psi, "yes", &mut diag)?;
        let mut buffers = self.buffers(model.num_states(), 2, |i| yes.get(i), &mut diag)?;

        diag.start_iterations();
        let combine = self.linear(&yes, &matrix);
        let outcome = self.run(&matrix.matrix, &combine, self.config.convergence(), &mut buffers)?;
        let report = diag.finish(outcome.iterations);
        let values = self.converged(outcome, buffers)?;
        Ok(Solution { values, report })
    }

    /// Expected reward accumulated until reaching `target` (`R[F ψ]`).
    ///
    /// States that miss `target` with positive probability get `+∞`;
    /// `target` states get `0`.
    pub fn reach_reward(
        &self,
        model: &Model<'_, D>,
        state_rewards: D::Node,
        trans_rewards: D::Node,
        target: D::Node,
    ) -> Result<Solution, SolveError> {
        self.check(model)?;
        info!("Computing reachability rewards ({:?})", self.config.linear_method);

        let mut diag = Diagnostics::new();
        let matrix = self.matrix(model, model.trans, self.linear_options(), &mut diag)?;
        let classes = self.classes(model, target, &mut diag)?;
        let r = self.step_rewards(model, state_rewards, trans_rewards)?;
        let rewards = self.vector(model, r, "rewards", &mut diag)?;
        let initial = |i: usize| match classes[i] {
            Class::Infinite => f64::INFINITY,
            Class::Target | Class::Maybe => 0.0,
        };
        let mut buffers = self.buffers(model.num_states(), 2, initial, &mut diag)?;

        diag.start_iterations();
        let combine = Classified {
            inner: self.linear(&rewards, &matrix),
            classes: classes.as_slice(),
        };
        let outcome = self.run(&matrix.matrix, &combine, self.config.convergence(), &mut buffers)?;
        let report = diag.finish(outcome.iterations);
        let values = self.converged(outcome, buffers)?;
        Ok(Solution { values, report })
    }

    /// Long-run distribution starting from `initial`.
    ///
    /// For a continuous-time chain (`ctmc`), `model.trans` holds rates. Both
    /// kinds of chain are uniformized with the row sums as exit rates, which
    /// for a discrete-time chain iterates `I + (P - I)/q` and so also
    /// converges on periodic chains. The result is normalized to sum to one.
    pub fn steady_state(&self, model: &Model<'_, D>, initial: D::Node, ctmc: bool) -> Result<Solution, SolveError> {
        self.check(model)?;
        info!("Computing steady-state probabilities ({})", if ctmc { "CTMC" } else { "DTMC" });

        let mut diag = Diagnostics::new();
        let transposed = BuildOptions {
            transpose: true,
            ..BuildOptions::default()
        };
        let mut matrix = self.matrix(model, model.trans, transposed, &mut diag)?;
        let (exit, q) = self.uniformize(model, &mut matrix, &mut diag)?;
        let start = self.dense(model, initial)?;
        let mut buffers = self.buffers(model.num_states(), 2, |i| start[i], &mut diag)?;
        drop(start);

        diag.start_iterations();
        let combine = Uniformized { exit: &exit, q };
        let outcome = self.run(&matrix.matrix, &combine, self.config.convergence(), &mut buffers)?;
        let report = diag.finish(outcome.iterations);
        let mut values = self.converged(outcome, buffers)?;
        normalize(&mut values);
        Ok(Solution { values, report })
    }

    /// Distribution after `bound` steps of a discrete-time chain, starting from `initial`.
    pub fn transient_dtmc(&self, model: &Model<'_, D>, initial: D::Node, bound: i64) -> Result<Solution, SolveError> {
        self.check(model)?;
        let k = steps(bound)?;
        info!("Computing transient probabilities for {} steps", k);

        let mut diag = Diagnostics::new();
        let transposed = BuildOptions {
            transpose: true,
            ..BuildOptions::default()
        };
        let matrix = self.matrix(model, model.trans, transposed, &mut diag)?;
        let start = self.dense(model, initial)?;
        let mut buffers = self.buffers(model.num_states(), 2, |i| start[i], &mut diag)?;
        drop(start);

        diag.start_iterations();
        let outcome = self.run(&matrix.matrix, &Zero, Mode::FixedHorizon(k), &mut buffers)?;
        Ok(Solution {
            values: buffers.into_inner().into_current(),
            report: diag.finish(outcome.iterations),
        })
    }

    /// Distribution at time `time` of a continuous-time chain, starting from `initial`.
    pub fn transient_ctmc(&self, model: &Model<'_, D>, initial: D::Node, time: f64) -> Result<Solution, SolveError> {
        self.check(model)?;
        let time = checked_time(time)?;
        info!("Computing transient probabilities for time {}", time);

        let mut diag = Diagnostics::new();
        let transposed = BuildOptions {
            transpose: true,
            ..BuildOptions::default()
        };
        let mut matrix = self.matrix(model, model.trans, transposed, &mut diag)?;
        let (exit, q) = self.uniformize(model, &mut matrix, &mut diag)?;
        let weights = PoissonWeights::compute(q * time, self.config.epsilon)?;
        info!(
            "Uniformisation: q.t = {} x {} = {}; Fox-Glynn: left = {}, right = {}",
            q,
            time,
            q * time,
            weights.left,
            weights.right
        );

        let n = model.num_states();
        let start = self.dense(model, initial)?;
        let mut buffers = self.buffers(n, 3, |i| start[i], &mut diag)?;
        drop(start);
        let mut sum = self.tracker.alloc_vec(Stage::IterationVectors, n, 0.0)?;
        if weights.left == 0 {
            add_scaled(&mut sum, weights.weights[0], buffers.current());
        }

        diag.start_iterations();
        let mut accumulate = |k: usize, x: &[f64]| {
            if k >= weights.left {
                add_scaled(&mut sum, weights.weights[k - weights.left], x);
            }
        };
        let outcome = iterate(
            &matrix.matrix,
            &Uniformized { exit: &exit, q },
            Mode::FixedHorizon(weights.right),
            &mut buffers,
            self.cancel.as_ref(),
            &mut accumulate,
        )?;
        drop(buffers);

        let mut values = sum.into_inner();
        for x in values.iter_mut() {
            *x /= weights.total_weight;
        }
        Ok(Solution {
            values,
            report: diag.finish(outcome.iterations),
        })
    }

    /// Expected reward accumulated up to time `time` in a continuous-time chain (`R≤t [C]`).
    ///
    /// State rewards are rates; transition rewards are earned per transition.
    pub fn ctmc_cumulative_reward(
        &self,
        model: &Model<'_, D>,
        state_rewards: D::Node,
        trans_rewards: D::Node,
        time: f64,
    ) -> Result<Solution, SolveError> {
        self.check(model)?;
        let time = checked_time(time)?;
        info!("Computing cumulative reward for time {}", time);

        let mut diag = Diagnostics::new();
        let mut matrix = self.matrix(model, model.trans, BuildOptions::default(), &mut diag)?;
        let (exit, q) = self.uniformize(model, &mut matrix, &mut diag)?;
        let mut weights = PoissonWeights::compute(q * time, self.config.epsilon)?;
        // Weight of iterate k: P(N > k) / q, with N ~ Poisson(q·t).
        let mut cumulative = 0.0;
        for w in weights.weights.iter_mut() {
            cumulative += *w;
            *w = (1.0 - cumulative / weights.total_weight) / q;
        }
        let weight = |k: usize| if k < weights.left { 1.0 / q } else { weights.weights[k - weights.left] };

        let n = model.num_states();
        let r = self.step_rewards(model, state_rewards, trans_rewards)?;
        let rewards = self.dense(model, r)?;
        let mut buffers = self.buffers(n, 3, |i| rewards[i], &mut diag)?;
        drop(rewards);
        let mut sum = self.tracker.alloc_vec(Stage::IterationVectors, n, 0.0)?;
        add_scaled(&mut sum, weight(0), buffers.current());

        diag.start_iterations();
        let mut accumulate = |k: usize, x: &[f64]| add_scaled(&mut sum, weight(k), x);
        let outcome = iterate(
            &matrix.matrix,
            &Uniformized { exit: &exit, q },
            Mode::FixedHorizon(weights.right),
            &mut buffers,
            self.cancel.as_ref(),
            &mut accumulate,
        )?;
        drop(buffers);

        Ok(Solution {
            values: sum.into_inner(),
            report: diag.finish(outcome.iterations),
        })
    }

    fn check(&self, model: &Model<'_, D>) -> Result<(), SolveError> {
        self.config.validate()?;
        if model.rows.len() != model.cols.len() {
            return Err(SolveError::InvalidBound(format!(
                "{} row variables but {} column variables",
                model.rows.len(),
                model.cols.len()
            )));
        }
        Ok(())
    }

    fn run<C: Combine>(
        &self,
        matrix: &SparseMatrix,
        combine: &C,
        mode: Mode,
        buffers: &mut PingPong,
    ) -> Result<Outcome, SolveError> {
        iterate(matrix, combine, mode, buffers, self.cancel.as_ref(), &mut |_, _| {})
    }

    fn converged(&self, outcome: Outcome, buffers: Tracked<PingPong>) -> Result<Vec<f64>, SolveError> {
        let last = buffers.into_inner().into_current();
        if outcome.converged {
            return Ok(last);
        }
        warn!(
            "Iterative method did not converge within {} iterations (max diff {:e})",
            outcome.iterations, outcome.max_diff
        );
        Err(SolveError::NonConvergence {
            iterations: outcome.iterations,
            max_diff: outcome.max_diff,
            epsilon: self.config.epsilon,
            last,
        })
    }

    fn matrix(
        &self,
        model: &Model<'_, D>,
        f: D::Node,
        options: BuildOptions,
        diag: &mut Diagnostics,
    ) -> Result<Tracked<BuiltMatrix>, SolveError> {
        let built = self.build_matrix(model, f, options)?;
        diag.matrix(&built);
        Ok(built)
    }

    fn build_matrix(
        &self,
        model: &Model<'_, D>,
        f: D::Node,
        options: BuildOptions,
    ) -> Result<Tracked<BuiltMatrix>, SolveError> {
        let options = BuildOptions {
            compact: self.config.compact,
            ..options
        };
        let source = SymbolicEntries {
            dd: self.dd,
            f,
            rows: model.rows,
            cols: model.cols,
            index: model.index,
        };
        self.tracker.acquire(Stage::Matrix, || {
            let built = build(&source, options)?;
            let bytes = built.mem_bytes();
            Ok((built, bytes))
        })
    }

    fn dense(&self, model: &Model<'_, D>, f: D::Node) -> Result<Tracked<Vec<f64>>, SolveError> {
        let n = model.num_states();
        self.tracker.acquire(Stage::Vector, || {
            let mut values = try_alloc(Stage::Vector, n, 0.0)?;
            self.dd.materialize_vector(f, model.rows, model.index, &mut values)?;
            Ok((values, n * std::mem::size_of::<f64>()))
        })
    }

    /// Materialize `f` and compact it if configured and worthwhile.
    fn vector(
        &self,
        model: &Model<'_, D>,
        f: D::Node,
        label: &'static str,
        diag: &mut Diagnostics,
    ) -> Result<Tracked<RewardVector>, SolveError> {
        let dense = self.dense(model, f)?;
        let vector = if self.config.compact {
            RewardVector::compact_tracked(&self.tracker, dense)?
        } else {
            let bytes = dense.bytes();
            dense.map(RewardVector::Dense, bytes)
        };
        diag.vector(label, &vector);
        Ok(vector)
    }

    /// Classify states against `target`, using the predecessor lists of `model.trans`.
    fn classes(
        &self,
        model: &Model<'_, D>,
        target: D::Node,
        diag: &mut Diagnostics,
    ) -> Result<Tracked<Vec<Class>>, SolveError> {
        let transposed = BuildOptions {
            transpose: true,
            ..BuildOptions::default()
        };
        let preds = self.build_matrix(model, model.trans, transposed)?;
        diag.auxiliary("predecessors", preds.bytes());
        let targets = self.dense(model, target)?;
        let classes = self.tracker.acquire(Stage::Vector, || {
            let classes = classify(&preds.matrix, &targets)?;
            Ok((classes, classify_bytes(preds.matrix.n())))
        })?;
        diag.auxiliary("state classes", classes.bytes());
        Ok(classes)
    }

    fn buffers(
        &self,
        n: usize,
        count: usize,
        initial: impl Fn(usize) -> f64,
        diag: &mut Diagnostics,
    ) -> Result<Tracked<PingPong>, SolveError> {
        let buffers = self.tracker.acquire(Stage::IterationVectors, || {
            let mut current = try_alloc(Stage::IterationVectors, n, 0.0)?;
            for (i, x) in current.iter_mut().enumerate() {
                *x = initial(i);
            }
            let spare = try_alloc(Stage::IterationVectors, n, 0.0)?;
            let buffers = PingPong::new(current, spare);
            let bytes = buffers.mem_bytes();
            Ok((buffers, bytes))
        })?;
        diag.iteration_vectors(count, n);
        Ok(buffers)
    }

    /// `state + Σ_cols trans × trans_rewards`, the expected reward of one step.
    fn step_rewards(
        &self,
        model: &Model<'_, D>,
        state_rewards: D::Node,
        trans_rewards: D::Node,
    ) -> Result<D::Node, SolveError> {
        let weighted = self.dd.apply(Op::Times, trans_rewards, model.trans)?;
        let per_state = self.dd.sum_abstract(weighted, model.cols)?;
        Ok(self.dd.apply(Op::Plus, state_rewards, per_state)?)
    }

    /// Transitions out of `phi ∧ ¬psi` states only.
    fn restrict_to_maybe(&self, model: &Model<'_, D>, phi: D::Node, psi: D::Node) -> Result<D::Node, SolveError> {
        let both = self.dd.apply(Op::Times, phi, psi)?;
        let maybe = self.dd.apply(Op::Minus, phi, both)?;
        Ok(self.dd.apply(Op::Times, model.trans, maybe)?)
    }

    /// Exit rates and uniformization rate `q`; scales `matrix` by `1/q`.
    fn uniformize(
        &self,
        model: &Model<'_, D>,
        matrix: &mut Tracked<BuiltMatrix>,
        diag: &mut Diagnostics,
    ) -> Result<(Tracked<RewardVector>, f64), SolveError> {
        let rates = self.dd.sum_abstract(model.trans, model.cols)?;
        let exit = self.vector(model, rates, "exit rates", diag)?;
        let max_rate = (0..exit.len()).map(|i| exit.get(i)).fold(0.0, f64::max);
        let q = if max_rate > 0.0 {
            self.config.uniformization_factor * max_rate
        } else {
            1.0
        };
        matrix.matrix.scale(1.0 / q);
        Ok((exit, q))
    }

    fn linear_options(&self) -> BuildOptions {
        BuildOptions {
            split_diagonal: self.config.linear_method != LinearMethod::Power,
            ..BuildOptions::default()
        }
    }

    fn linear<'b>(&self, b: &'b RewardVector, matrix: &'b BuiltMatrix) -> Linear<'b> {
        Linear {
            b,
            diagonal: matrix.diagonal.as_deref(),
            omega: match self.config.linear_method {
                LinearMethod::Jor => self.config.omega,
                LinearMethod::Power | LinearMethod::Jacobi => 1.0,
            },
        }
    }
}

fn steps(bound: i64) -> Result<usize, SolveError> {
    usize::try_from(bound).map_err(|_| SolveError::InvalidBound(format!("step bound {} is negative", bound)))
}

fn checked_time(time: f64) -> Result<f64, SolveError> {
    if time >= 0.0 && time.is_finite() {
        Ok(time)
    } else {
        Err(SolveError::InvalidBound(format!("time bound {} is not a finite non-negative number", time)))
    }
}

fn add_scaled(sum: &mut [f64], weight: f64, x: &[f64]) {
    for (s, &v) in sum.iter_mut().zip(x) {
        *s += weight * v;
    }
}

fn normalize(values: &mut [f64]) {
    let total: f64 = values.iter().sum();
    if total > 0.0 {
        for x in values.iter_mut() {
            *x /= total;
        }
    }
}

/// `acc = x(i)`.
struct Seeded<'a>(&'a RewardVector);

impl Combine for Seeded<'_> {
    fn seed(&self, row: usize, _current: &[f64]) -> f64 {
        self.0.get(row)
    }
}

struct Zero;

impl Combine for Zero {
    fn seed(&self, _row: usize, _current: &[f64]) -> f64 {
        0.0
    }
}

/// `x = b + A x`: power iteration, or (relaxed) Jacobi when the diagonal was split off.
struct Linear<'a> {
    b: &'a RewardVector,
    diagonal: Option<&'a [f64]>,
    omega: f64,
}

impl Combine for Linear<'_> {
    fn seed(&self, row: usize, _current: &[f64]) -> f64 {
        self.b.get(row)
    }

    fn finish(&self, row: usize, acc: f64, current: &[f64]) -> f64 {
        let Some(diagonal) = self.diagonal else {
            return acc;
        };
        let d = 1.0 - diagonal[row];
        // A pure self-loop contributes nothing.
        let x = if d == 0.0 { acc } else { acc / d };
        if self.omega == 1.0 {
            x
        } else {
            self.omega * x + (1.0 - self.omega) * current[row]
        }
    }
}

/// One step of the uniformized chain `I + (R - diag(E)) / q`, with `R` pre-scaled by `1/q`.
struct Uniformized<'a> {
    exit: &'a RewardVector,
    q: f64,
}

impl Combine for Uniformized<'_> {
    fn seed(&self, row: usize, current: &[f64]) -> f64 {
        (1.0 - self.exit.get(row) / self.q) * current[row]
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Class {
    Target,
    /// Misses the target with positive probability.
    Infinite,
    Maybe,
}

struct Classified<'a, C> {
    inner: C,
    classes: &'a [Class],
}

impl<C: Combine> Combine for Classified<'_, C> {
    fn seed(&self, row: usize, current: &[f64]) -> f64 {
        self.inner.seed(row, current)
    }

    fn finish(&self, row: usize, acc: f64, current: &[f64]) -> f64 {
        match self.classes[row] {
            Class::Target => 0.0,
            Class::Infinite => f64::INFINITY,
            Class::Maybe => self.inner.finish(row, acc, current),
        }
    }
}

/// Split states by how they relate to the non-zero entries of `targets`.
///
/// Row `j` of `preds` lists the predecessors of state `j`. A state is
/// [`Class::Infinite`] when it cannot reach a target, or can reach such a
/// state without passing through a target.
fn classify(preds: &SparseMatrix, targets: &[f64]) -> Result<Vec<Class>, SolveError> {
    let n = preds.n();
    let preds = preds.indexed()?;
    let mut classes = try_alloc(Stage::Vector, n, Class::Infinite)?;
    // Every state is pushed at most once per pass.
    let mut stack = try_alloc(Stage::Vector, n, 0u32)?;
    stack.clear();

    for (i, &t) in targets.iter().enumerate() {
        if t != 0.0 {
            classes[i] = Class::Target;
            stack.push(i as u32);
        }
    }
    while let Some(j) = stack.pop() {
        for (i, _) in preds.row(j as usize).iter() {
            if classes[i] == Class::Infinite {
                classes[i] = Class::Maybe;
                stack.push(i as u32);
            }
        }
    }

    // Anything still `Infinite` misses the target; spread that back through non-targets.
    stack.extend((0..n).filter(|&i| classes[i] == Class::Infinite).map(|i| i as u32));
    while let Some(j) = stack.pop() {
        for (i, _) in preds.row(j as usize).iter() {
            if classes[i] == Class::Maybe {
                classes[i] = Class::Infinite;
                stack.push(i as u32);
            }
        }
    }
    Ok(classes)
}

/// Bytes [`classify`] holds at its peak: classes, stack and row offsets.
fn classify_bytes(n: usize) -> usize {
    n * std::mem::size_of::<Class>() + n * 4 + (n + 1) * 4
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::mtbdd::Mtbdd;
    use crate::odd::Odd;
    use crate::reference::Ref;

    struct Fixture {
        dd: Mtbdd,
        rows: VarSet,
        cols: VarSet,
        odd: Odd,
    }

    impl Fixture {
        fn full(num_vars: usize) -> Self {
            let dd = Mtbdd::default();
            let (rows, cols) = VarSet::interleaved(1, num_vars);
            let odd = Odd::build(&dd, dd.one, &rows).unwrap();
            Self { dd, rows, cols, odd }
        }

        fn matrix(&self, entries: &[(u64, u64, f64)]) -> Ref {
            self.dd.encode_matrix(entries, &self.rows, &self.cols).unwrap()
        }

        fn vector(&self, values: &[f64]) -> Ref {
            self.dd.encode_vector(values, &self.rows).unwrap()
        }

        fn model(&self, trans: Ref) -> Model<'_, Mtbdd> {
            Model {
                trans,
                rows: &self.rows,
                cols: &self.cols,
                index: &self.odd,
            }
        }
    }

    #[test]
    fn test_cumulative_with_transition_rewards() {
        let fx = Fixture::full(1);
        let trans = fx.matrix(&[(0, 0, 0.5), (0, 1, 0.5), (1, 1, 1.0)]);
        let trans_rewards = fx.matrix(&[(0, 1, 2.0)]);
        let config = SolverConfig::default();
        let solver = Solver::new(&fx.dd, &config);
        let sol = solver
            .cumulative_reward(&fx.model(trans), fx.dd.zero, trans_rewards, 3)
            .unwrap();
        // Step reward of state 0 is 0.5·2 = 1; it stays in 0 with prob 1/2 per step.
        assert_eq!(sol.values, vec![1.0 + 0.5 + 0.25, 0.0]);
        assert!(solver.tracker().ledger().is_balanced());
    }

    #[test]
    fn test_instantaneous() {
        let fx = Fixture::full(1);
        let trans = fx.matrix(&[(0, 1, 1.0), (1, 1, 1.0)]);
        let config = SolverConfig::default();
        let solver = Solver::new(&fx.dd, &config);
        let model = fx.model(trans);
        let r = fx.vector(&[3.0, 7.0]);
        assert_eq!(solver.instantaneous_reward(&model, r, 0).unwrap().values, vec![3.0, 7.0]);
        assert_eq!(solver.instantaneous_reward(&model, r, 1).unwrap().values, vec![7.0, 7.0]);
    }

    #[test]
    fn test_bounded_until() {
        // 0 -> 1 -> 2 (target), all steps certain
        let fx = Fixture::full(2);
        let trans = fx.matrix(&[(0, 1, 1.0), (1, 2, 1.0), (2, 2, 1.0), (3, 3, 1.0)]);
        let phi = fx.vector(&[1.0, 1.0, 1.0, 0.0]);
        let psi = fx.vector(&[0.0, 0.0, 1.0, 0.0]);
        let config = SolverConfig::default();
        let solver = Solver::new(&fx.dd, &config);
        let model = fx.model(trans);
        let one = solver.bounded_until(&model, phi, psi, 1).unwrap();
        assert_eq!(one.values, vec![0.0, 1.0, 1.0, 0.0]);
        let two = solver.bounded_until(&model, phi, psi, 2).unwrap();
        assert_eq!(two.values, vec![1.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_reach_reward() {
        // 0 -> {1: 1/2, 0: 1/2}; 1 target; 2 -> 3 -> 3 never reaches it.
        let fx = Fixture::full(2);
        let trans = fx.matrix(&[(0, 0, 0.5), (0, 1, 0.5), (1, 1, 1.0), (2, 3, 1.0), (3, 3, 1.0)]);
        let rewards = fx.vector(&[1.0, 1.0, 1.0, 1.0]);
        let target = fx.vector(&[0.0, 1.0, 0.0, 0.0]);
        for method in [LinearMethod::Power, LinearMethod::Jacobi, LinearMethod::Jor] {
            let config = SolverConfig {
                linear_method: method,
                epsilon: 1e-10,
                ..SolverConfig::default()
            };
            let solver = Solver::new(&fx.dd, &config);
            let sol = solver.reach_reward(&fx.model(trans), rewards, fx.dd.zero, target).unwrap();
            assert!((sol.values[0] - 2.0).abs() < 1e-8, "{:?}: {:?}", method, sol.values);
            assert_eq!(sol.values[1], 0.0);
            assert_eq!(sol.values[2], f64::INFINITY);
            assert_eq!(sol.values[3], f64::INFINITY);
        }
    }

    #[test]
    fn test_non_convergence_returns_last_iterate() {
        let fx = Fixture::full(1);
        let trans = fx.matrix(&[(0, 0, 0.8), (0, 1, 0.2), (1, 0, 0.3), (1, 1, 0.7)]);
        let config = SolverConfig {
            max_iters: 3,
            epsilon: 1e-12,
            ..SolverConfig::default()
        };
        let solver = Solver::new(&fx.dd, &config);
        let init = fx.vector(&[1.0, 0.0]);
        let err = solver.steady_state(&fx.model(trans), init, false).unwrap_err();
        assert!(matches!(err, SolveError::NonConvergence { iterations: 3, .. }), "{:?}", err);
        let last = err.unconverged_result().unwrap();
        assert_eq!(last.len(), 2);
        // Still on its way from [1, 0] to [0.6, 0.4].
        assert!(last[0] > 0.6 && last[0] < 1.0, "{:?}", last);
        assert!(solver.tracker().ledger().is_balanced());
    }

    #[test]
    fn test_steady_state_periodic_dtmc() {
        let fx = Fixture::full(1);
        let trans = fx.matrix(&[(0, 1, 1.0), (1, 0, 1.0)]);
        let config = SolverConfig::default();
        let solver = Solver::new(&fx.dd, &config);
        let init = fx.vector(&[1.0, 0.0]);
        let sol = solver.steady_state(&fx.model(trans), init, false).unwrap();
        assert!((sol.values[0] - 0.5).abs() < 1e-5, "{:?}", sol.values);
        assert!((sol.values[1] - 0.5).abs() < 1e-5, "{:?}", sol.values);
        assert!(sol.report.iterations < config.max_iters);
        assert!(solver.tracker().ledger().is_balanced());
    }

    #[test]
    fn test_ctmc_cumulative_single_state() {
        let fx = Fixture::full(1);
        let reach = fx.vector(&[1.0, 0.0]);
        let odd = Odd::build(&fx.dd, reach, &fx.rows).unwrap();
        let model = Model {
            trans: fx.dd.zero,
            rows: &fx.rows,
            cols: &fx.cols,
            index: &odd,
        };
        let config = SolverConfig::default();
        let solver = Solver::new(&fx.dd, &config);
        let r = fx.vector(&[5.0, 0.0]);
        let sol = solver.ctmc_cumulative_reward(&model, r, fx.dd.zero, 2.0).unwrap();
        assert_eq!(sol.values.len(), 1);
        assert!((sol.values[0] - 10.0).abs() < 1e-4, "{:?}", sol.values);
    }

    #[test]
    fn test_classify() {
        let t = crate::sparse::Triplets::new(4, [(0, 1, 0.5), (0, 2, 0.5), (1, 1, 1.0), (2, 2, 1.0), (3, 0, 1.0)]);
        let transposed = BuildOptions {
            transpose: true,
            ..BuildOptions::default()
        };
        let preds = build(&t, transposed).unwrap().matrix;
        let classes = classify(&preds, &[0.0, 1.0, 0.0, 0.0]).unwrap();
        assert_eq!(classes, vec![Class::Infinite, Class::Target, Class::Infinite, Class::Infinite]);
        let classes = classify(&preds, &[0.0, 1.0, 1.0, 0.0]).unwrap();
        assert_eq!(classes, vec![Class::Maybe, Class::Target, Class::Target, Class::Maybe]);
    }

    #[test]
    fn test_reach_reward_allocation_failures() {
        let fx = Fixture::full(2);
        let trans = fx.matrix(&[(0, 0, 0.5), (0, 1, 0.5), (1, 1, 1.0), (2, 3, 1.0), (3, 3, 1.0)]);
        let rewards = fx.vector(&[1.0, 1.0, 1.0, 1.0]);
        let target = fx.vector(&[0.0, 1.0, 0.0, 0.0]);

        let config = SolverConfig::default();
        let solver = Solver::new(&fx.dd, &config);
        let sol = solver.reach_reward(&fx.model(trans), rewards, fx.dd.zero, target).unwrap();
        // Matrix, predecessors, targets, classes, rewards (dense and compact), buffers.
        assert_eq!(solver.tracker().ledger().acquired(), 7);
        assert!(solver.tracker().ledger().is_balanced());
        let aux = &sol.report.auxiliary;
        assert_eq!(aux.len(), 2);
        assert!(aux[0].bytes > 0);
        assert_eq!(aux[1].bytes, classify_bytes(4));
        assert!(sol.report.total_bytes() > sol.report.matrix_bytes + aux[0].bytes + aux[1].bytes);

        for stage in Stage::ALL {
            let config = SolverConfig {
                fault: Some(stage),
                ..SolverConfig::default()
            };
            let solver = Solver::new(&fx.dd, &config);
            let err = solver
                .reach_reward(&fx.model(trans), rewards, fx.dd.zero, target)
                .unwrap_err();
            assert!(
                matches!(err, SolveError::AllocationFailure { stage: s, .. } if s == stage),
                "{}: {:?}",
                stage,
                err
            );
            assert!(solver.tracker().ledger().is_balanced(), "{}", stage);
        }
    }

    #[test]
    fn test_rejects_before_allocating() {
        let fx = Fixture::full(1);
        let trans = fx.matrix(&[(0, 0, 1.0), (1, 1, 1.0)]);
        let config = SolverConfig::default();
        let solver = Solver::new(&fx.dd, &config);
        let model = fx.model(trans);

        let err = solver.cumulative_reward(&model, fx.dd.one, fx.dd.zero, -1).unwrap_err();
        assert!(matches!(err, SolveError::InvalidBound(_)));
        let err = solver.transient_ctmc(&model, fx.dd.one, -0.5).unwrap_err();
        assert!(matches!(err, SolveError::InvalidBound(_)));

        let (_, wide) = VarSet::interleaved(1, 2);
        let lopsided = Model { cols: &wide, ..model };
        let err = solver.transient_dtmc(&lopsided, fx.dd.one, 1).unwrap_err();
        assert!(matches!(err, SolveError::InvalidBound(_)));

        assert_eq!(solver.tracker().ledger().acquired(), 0);
    }
}
