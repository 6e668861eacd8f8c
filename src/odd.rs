//! Offset-labelled decision diagrams (ODDs).
//!
//! An ODD enumerates the reachable states of a model as `0..n`. It mirrors
//! the reachable-set diagram level by level: every node records how many
//! reachable states lie below its else-branch (`eoff`) and its then-branch
//! (`toff`). Walking from the root along the bits of a state and adding
//! `eoff` whenever the then-branch is taken yields that state's index.

use std::collections::HashMap;

use log::debug;
use num_bigint::BigUint;

use crate::error::DdError;
use crate::mtbdd::Mtbdd;
use crate::reference::Ref;
use crate::symbolic::StateIndex;
use crate::types::VarSet;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OddNode {
    pub else_: usize,
    pub then: usize,
    pub eoff: u64,
    pub toff: u64,
}

impl OddNode {
    pub fn total(&self) -> u64 {
        self.eoff + self.toff
    }
}

/// State index over a fixed set of row variables.
#[derive(Debug, Clone)]
pub struct Odd {
    nodes: Vec<OddNode>,
    root: usize,
    num_vars: usize,
}

/// Largest state count addressable by 32-bit column indices.
const MAX_STATES: u64 = 1 << 32;

impl Odd {
    /// Build the index of the non-zero states of `reach` over `rows`.
    pub fn build(dd: &Mtbdd, reach: Ref, rows: &VarSet) -> Result<Self, DdError> {
        let count = dd.sat_count(reach, rows.len());
        if count > BigUint::from(MAX_STATES) {
            return Err(DdError::StateSpaceTooLarge { states: count });
        }

        let mut odd = Odd {
            nodes: Vec::new(),
            root: 0,
            num_vars: rows.len(),
        };
        let mut cache = HashMap::new();
        odd.root = odd.build_(dd, reach, 0, rows, &mut cache)?;

        debug!(
            "Odd::build: {} states, {} nodes over {} variables",
            odd.num_states(),
            odd.nodes.len(),
            odd.num_vars
        );
        Ok(odd)
    }

    fn build_(
        &mut self,
        dd: &Mtbdd,
        f: Ref,
        level: usize,
        rows: &VarSet,
        cache: &mut HashMap<(Ref, usize), usize>,
    ) -> Result<usize, DdError> {
        if let Some(&i) = cache.get(&(f, level)) {
            return Ok(i);
        }

        let node = if level == rows.len() {
            if let Some(var) = dd.variable(f) {
                return Err(DdError::UnsupportedVariable { var });
            }
            let reachable = dd.value(f).is_some_and(|c| c != 0.0);
            OddNode {
                else_: 0,
                then: 0,
                eoff: reachable as u64,
                toff: 0,
            }
        } else {
            let v = rows.vars()[level];
            if let Some(top) = dd.variable(f) {
                if top < v {
                    return Err(DdError::UnsupportedVariable { var: top });
                }
            }
            let (f0, f1) = dd.cofactors(f, v);
            let else_ = self.build_(dd, f0, level + 1, rows, cache)?;
            let then = self.build_(dd, f1, level + 1, rows, cache)?;
            OddNode {
                else_,
                then,
                eoff: self.nodes[else_].total(),
                toff: self.nodes[then].total(),
            }
        };

        self.nodes.push(node);
        let i = self.nodes.len() - 1;
        cache.insert((f, level), i);
        Ok(i)
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn node(&self, i: usize) -> &OddNode {
        &self.nodes[i]
    }

    pub fn num_vars(&self) -> usize {
        self.num_vars
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Index of the state with the given row-variable bits (top-most first),
    /// or [`None`] if the state is unreachable.
    pub fn index_of(&self, bits: &[bool]) -> Option<usize> {
        assert_eq!(bits.len(), self.num_vars, "wrong number of bits");
        let mut node = self.root;
        let mut index = 0u64;
        for &bit in bits {
            let n = &self.nodes[node];
            if bit {
                index += n.eoff;
                node = n.then;
            } else {
                node = n.else_;
            }
        }
        (self.nodes[node].eoff == 1).then_some(index as usize)
    }
}

impl StateIndex for Odd {
    fn num_states(&self) -> usize {
        self.nodes[self.root].total() as usize
    }
}
