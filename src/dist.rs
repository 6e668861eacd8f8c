//! Dense and distinct-value vector encodings.
//!
//! Reward and probability vectors of large models typically take only a
//! handful of distinct values. A [`DistVector`] stores each distinct value
//! once and a 16-bit pointer per state, which is four times smaller than
//! the dense array when the dictionary is small.

use std::collections::HashMap;

use log::debug;

use crate::error::SolveError;
use crate::tracker::{try_alloc, Stage, Tracked, Tracker};

/// Maximum dictionary size addressable by the `u16` pointers.
pub const MAX_DISTINCT: usize = 1 << 16;

/// Dictionary of distinct values plus a per-state pointer into it.
#[derive(Debug, Clone, PartialEq)]
pub struct DistVector {
    dist: Vec<f64>,
    ptrs: Vec<u16>,
}

impl DistVector {
    /// Try to compact `values`.
    ///
    /// Returns `Ok(None)` when there are more than [`MAX_DISTINCT`] distinct
    /// values or the compact form would not be smaller than the dense one.
    /// Values are compared bitwise, so reads are bit-identical to `values`.
    pub fn build(values: &[f64]) -> Result<Option<Self>, SolveError> {
        let n = values.len();
        let mut index: HashMap<u64, u16> = HashMap::new();
        let mut dist = Vec::new();
        let mut ptrs = try_alloc(Stage::CompactVector, n, 0u16)?;

        for (i, &x) in values.iter().enumerate() {
            let next = dist.len();
            let p = match index.get(&x.to_bits()) {
                Some(&p) => p,
                None if next < MAX_DISTINCT => {
                    index.insert(x.to_bits(), next as u16);
                    dist.push(x);
                    next as u16
                }
                None => {
                    debug!("DistVector::build: more than {} distinct values", MAX_DISTINCT);
                    return Ok(None);
                }
            };
            ptrs[i] = p;
        }

        if Self::mem_bytes_for(dist.len(), n) >= n * 8 {
            debug!(
                "DistVector::build: {} distinct values do not pay off for {} entries",
                dist.len(),
                n
            );
            return Ok(None);
        }
        Ok(Some(Self { dist, ptrs }))
    }

    fn mem_bytes_for(num_dist: usize, n: usize) -> usize {
        num_dist * 8 + n * 2
    }

    pub fn len(&self) -> usize {
        self.ptrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ptrs.is_empty()
    }

    pub fn num_dist(&self) -> usize {
        self.dist.len()
    }

    pub fn dist(&self) -> &[f64] {
        &self.dist
    }

    #[inline]
    pub fn get(&self, i: usize) -> f64 {
        self.dist[self.ptrs[i] as usize]
    }

    pub fn mem_bytes(&self) -> usize {
        Self::mem_bytes_for(self.num_dist(), self.len())
    }
}

/// A per-state value vector in either encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RewardVector {
    Dense(Vec<f64>),
    Compact(DistVector),
}

impl RewardVector {
    /// Compact `values` if that saves space; otherwise keep them dense.
    pub fn compact(values: Vec<f64>) -> Result<Self, SolveError> {
        let tracker = Tracker::default();
        let bytes = values.len() * 8;
        let dense = tracker.acquire(Stage::Vector, || Ok((values, bytes)))?;
        Ok(Self::compact_tracked(&tracker, dense)?.into_inner())
    }

    /// Like [`RewardVector::compact`], acquiring the compact form from `tracker`.
    ///
    /// Consumes the dense array: on success it is released before returning,
    /// otherwise its guard becomes the result's. At most one encoding is
    /// alive after the call.
    pub fn compact_tracked(tracker: &Tracker, dense: Tracked<Vec<f64>>) -> Result<Tracked<Self>, SolveError> {
        let compact = tracker
            .acquire(Stage::CompactVector, || {
                let dist = DistVector::build(&dense)?;
                let bytes = dist.as_ref().map_or(0, DistVector::mem_bytes);
                Ok((dist, bytes))
            })?
            .transpose();

        Ok(match compact {
            Some(dist) => {
                drop(dense);
                let bytes = dist.bytes();
                dist.map(RewardVector::Compact, bytes)
            }
            None => {
                let bytes = dense.bytes();
                dense.map(RewardVector::Dense, bytes)
            }
        })
    }

    #[inline]
    pub fn get(&self, i: usize) -> f64 {
        match self {
            RewardVector::Dense(v) => v[i],
            RewardVector::Compact(d) => d.get(i),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RewardVector::Dense(v) => v.len(),
            RewardVector::Compact(d) => d.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_compact(&self) -> bool {
        matches!(self, RewardVector::Compact(_))
    }

    /// Number of distinct values of the compact form.
    pub fn num_dist(&self) -> Option<usize> {
        match self {
            RewardVector::Dense(_) => None,
            RewardVector::Compact(d) => Some(d.num_dist()),
        }
    }

    pub fn mem_bytes(&self) -> usize {
        match self {
            RewardVector::Dense(v) => v.len() * 8,
            RewardVector::Compact(d) => d.mem_bytes(),
        }
    }

    /// Expand into a dense array.
    pub fn to_dense(&self) -> Vec<f64> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }
}
