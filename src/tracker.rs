//! Accounting of the explicit structures a solve allocates.
//!
//! Every structure built for a solve (sparse matrix, reward vector, its
//! compact form, iteration vectors) is acquired through a [`Tracker`] and
//! held in a [`Tracked`] guard. The guard records its release in the shared
//! [`Ledger`] when dropped, or when ownership is handed to the caller with
//! [`Tracked::into_inner`]. A balanced ledger after a solve (successful or
//! not) means nothing leaked and nothing was released twice.

use std::cell::Cell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use log::debug;

use crate::error::SolveError;

/// Allocation stage of a solve.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Stage {
    /// Sparse transition matrix (and its split-off diagonal).
    Matrix,
    /// Dense reward/value vectors materialized from the symbolic model.
    Vector,
    /// Distinct-value (compact) form of a vector.
    CompactVector,
    /// Iteration buffers and accumulators.
    IterationVectors,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Matrix,
        Stage::Vector,
        Stage::CompactVector,
        Stage::IterationVectors,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Matrix => "sparse matrix",
            Stage::Vector => "vector",
            Stage::CompactVector => "compact vector",
            Stage::IterationVectors => "iteration vectors",
        };
        write!(f, "{}", name)
    }
}

/// Running acquisition/release counts.
#[derive(Debug, Default)]
pub struct Ledger {
    acquired: Cell<usize>,
    released: Cell<usize>,
    live_bytes: Cell<usize>,
    peak_bytes: Cell<usize>,
}

impl Ledger {
    pub fn acquired(&self) -> usize {
        self.acquired.get()
    }
    pub fn released(&self) -> usize {
        self.released.get()
    }
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.get()
    }
    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes.get()
    }

    /// Every acquisition has been released exactly once.
    pub fn is_balanced(&self) -> bool {
        self.acquired() == self.released() && self.live_bytes() == 0
    }

    fn acquire(&self, bytes: usize) {
        self.acquired.set(self.acquired.get() + 1);
        let live = self.live_bytes.get() + bytes;
        self.live_bytes.set(live);
        self.peak_bytes.set(self.peak_bytes.get().max(live));
    }

    fn resize(&self, old: usize, new: usize) {
        let live = self.live_bytes.get() - old + new;
        self.live_bytes.set(live);
        self.peak_bytes.set(self.peak_bytes.get().max(live));
    }

    fn release(&self, bytes: usize) {
        self.released.set(self.released.get() + 1);
        self.live_bytes.set(self.live_bytes.get() - bytes);
    }
}

/// Hands out [`Tracked`] structures and optionally injects a failure.
#[derive(Debug, Clone, Default)]
pub struct Tracker {
    ledger: Rc<Ledger>,
    fault: Option<Stage>,
}

impl Tracker {
    /// A tracker that fails every acquisition at `fault` (if any).
    pub fn new(fault: Option<Stage>) -> Self {
        Self {
            ledger: Rc::new(Ledger::default()),
            fault,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Build a structure at `stage` and start tracking it.
    ///
    /// `build` reports the footprint along with the value. An injected fault
    /// fires before `build` runs.
    pub fn acquire<T>(
        &self,
        stage: Stage,
        build: impl FnOnce() -> Result<(T, usize), SolveError>,
    ) -> Result<Tracked<T>, SolveError> {
        if self.fault == Some(stage) {
            debug!("injected allocation failure at {}", stage);
            return Err(SolveError::AllocationFailure { stage, bytes: 0 });
        }
        let (value, bytes) = build()?;
        self.ledger.acquire(bytes);
        debug!("acquired {} ({} bytes)", stage, bytes);
        Ok(Tracked {
            value: Some(value),
            stage,
            bytes,
            ledger: Rc::clone(&self.ledger),
        })
    }

    /// Allocate and track a vector of `len` copies of `fill`.
    pub fn alloc_vec<T: Clone>(
        &self,
        stage: Stage,
        len: usize,
        fill: T,
    ) -> Result<Tracked<Vec<T>>, SolveError> {
        self.acquire(stage, || {
            let v = try_alloc(stage, len, fill)?;
            let bytes = len * std::mem::size_of::<T>();
            Ok((v, bytes))
        })
    }
}

/// Allocate a vector without aborting on out-of-memory.
pub fn try_alloc<T: Clone>(stage: Stage, len: usize, fill: T) -> Result<Vec<T>, SolveError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| SolveError::AllocationFailure {
            stage,
            bytes: len.saturating_mul(std::mem::size_of::<T>()),
        })?;
    v.resize(len, fill);
    Ok(v)
}

/// A tracked structure; releases its ledger entry exactly once.
#[derive(Debug)]
pub struct Tracked<T> {
    value: Option<T>,
    stage: Stage,
    bytes: usize,
    ledger: Rc<Ledger>,
}

impl<T> Tracked<T> {
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Hand the structure over to the caller; the ledger counts it as released.
    pub fn into_inner(mut self) -> T {
        let value = self.take();
        self.ledger.release(self.bytes);
        debug!("handed over {} ({} bytes)", self.stage, self.bytes);
        value
    }

    /// Transform the structure in place, keeping the same ledger entry.
    pub fn map<U>(mut self, f: impl FnOnce(T) -> U, bytes: usize) -> Tracked<U> {
        let value = self.take();
        self.ledger.resize(self.bytes, bytes);
        Tracked {
            value: Some(f(value)),
            stage: self.stage,
            bytes,
            ledger: Rc::clone(&self.ledger),
        }
    }

    fn take(&mut self) -> T {
        // Only `into_inner`, `map` and `drop` take the value, each consuming the guard.
        self.value
            .take()
            .unwrap_or_else(|| unreachable!("tracked value taken twice"))
    }
}

impl<T> Tracked<Option<T>> {
    /// Split off the empty case; an empty guard is released right away.
    pub fn transpose(mut self) -> Option<Tracked<T>> {
        match self.take() {
            Some(value) => Some(Tracked {
                value: Some(value),
                stage: self.stage,
                bytes: self.bytes,
                ledger: Rc::clone(&self.ledger),
            }),
            None => {
                self.ledger.release(self.bytes);
                None
            }
        }
    }
}

impl<T> Deref for Tracked<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().unwrap_or_else(|| unreachable!("tracked value taken"))
    }
}

impl<T> DerefMut for Tracked<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().unwrap_or_else(|| unreachable!("tracked value taken"))
    }
}

impl<T> Drop for Tracked<T> {
    fn drop(&mut self) {
        if self.value.take().is_some() {
            self.ledger.release(self.bytes);
            debug!("released {} ({} bytes)", self.stage, self.bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_acquire_release() {
        let tracker = Tracker::default();
        {
            let a = tracker.alloc_vec(Stage::Vector, 4, 0.0f64).unwrap();
            assert_eq!(a.len(), 4);
            assert_eq!(a.bytes(), 32);
            assert_eq!(tracker.ledger().live_bytes(), 32);
            assert!(!tracker.ledger().is_balanced());
        }
        assert!(tracker.ledger().is_balanced());
        assert_eq!(tracker.ledger().acquired(), 1);
        assert_eq!(tracker.ledger().peak_bytes(), 32);
    }

    #[test]
    fn test_into_inner_counts_as_release() {
        let tracker = Tracker::default();
        let a = tracker.alloc_vec(Stage::IterationVectors, 2, 1.0f64).unwrap();
        let v = a.into_inner();
        assert_eq!(v, vec![1.0, 1.0]);
        assert!(tracker.ledger().is_balanced());
        assert_eq!(tracker.ledger().released(), 1);
    }

    #[test]
    fn test_map_keeps_balance() {
        let tracker = Tracker::default();
        let a = tracker.alloc_vec(Stage::Vector, 3, 2u8).unwrap();
        let b = a.map(|v| v.len(), 8);
        assert_eq!(*b, 3);
        assert_eq!(tracker.ledger().live_bytes(), 8);
        drop(b);
        assert!(tracker.ledger().is_balanced());
    }

    #[test]
    fn test_transpose() {
        let tracker = Tracker::default();
        let some = tracker.acquire(Stage::CompactVector, || Ok((Some(7u32), 4))).unwrap();
        let inner = some.transpose().unwrap();
        assert_eq!(*inner, 7);
        assert_eq!(tracker.ledger().live_bytes(), 4);
        drop(inner);

        let none = tracker.acquire(Stage::CompactVector, || Ok((None::<u32>, 0))).unwrap();
        assert!(none.transpose().is_none());
        assert!(tracker.ledger().is_balanced());
        assert_eq!(tracker.ledger().acquired(), 2);
    }

    #[test]
    fn test_injected_fault() {
        let tracker = Tracker::new(Some(Stage::Matrix));
        let ok = tracker.alloc_vec(Stage::Vector, 1, 0u8);
        assert!(ok.is_ok());
        let err = tracker.alloc_vec(Stage::Matrix, 1, 0u8);
        assert!(matches!(
            err,
            Err(SolveError::AllocationFailure {
                stage: Stage::Matrix,
                ..
            })
        ));
        drop(ok);
        assert!(tracker.ledger().is_balanced());
        assert_eq!(tracker.ledger().acquired(), 1);
    }

    #[test]
    fn test_try_alloc_too_large() {
        let res = try_alloc(Stage::IterationVectors, usize::MAX / 4, 0.0f64);
        assert!(matches!(res, Err(SolveError::AllocationFailure { .. })));
    }
}
