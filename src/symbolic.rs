//! Boundary between the numerical core and a symbolic model representation.
//!
//! The core never looks inside a decision diagram. It needs exactly four
//! things from the symbolic engine: pointwise arithmetic ([`Symbolic::apply`]),
//! summation over a variable set ([`Symbolic::sum_abstract`]), and the two
//! materialization walks that flatten a function over row (and column)
//! variables into explicit per-state data, using a [`StateIndex`].

use log::debug;

use crate::error::DdError;
use crate::mtbdd::Mtbdd;
use crate::odd::Odd;
use crate::reference::Ref;
use crate::types::VarSet;

/// Binary numeric operators on symbolic functions.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Op {
    Plus,
    Minus,
    Times,
    Divide,
    Min,
    Max,
}

impl Op {
    pub fn eval(self, a: f64, b: f64) -> f64 {
        match self {
            Op::Plus => a + b,
            Op::Minus => a - b,
            Op::Times => a * b,
            Op::Divide => a / b,
            Op::Min => a.min(b),
            Op::Max => a.max(b),
        }
    }

    pub fn is_commutative(self) -> bool {
        matches!(self, Op::Plus | Op::Times | Op::Min | Op::Max)
    }
}

/// Enumeration of the reachable states as `0..n`.
pub trait StateIndex {
    fn num_states(&self) -> usize;
}

/// Operations the numerical core consumes from a symbolic engine.
pub trait Symbolic {
    type Node: Copy + std::fmt::Display;
    type Index: StateIndex;

    fn apply(&self, op: Op, f: Self::Node, g: Self::Node) -> Result<Self::Node, DdError>;

    fn sum_abstract(&self, f: Self::Node, vars: &VarSet) -> Result<Self::Node, DdError>;

    /// Write the value of every indexed state into `out` (length `n`).
    ///
    /// Entries of unreachable states are not visited; `out` must be zeroed by the caller.
    fn materialize_vector(
        &self,
        f: Self::Node,
        rows: &VarSet,
        index: &Self::Index,
        out: &mut [f64],
    ) -> Result<(), DdError>;

    /// Call `visit(row, col, value)` for every non-zero entry between indexed states.
    ///
    /// The visiting order is unspecified.
    fn materialize_matrix(
        &self,
        f: Self::Node,
        rows: &VarSet,
        cols: &VarSet,
        index: &Self::Index,
        visit: &mut dyn FnMut(usize, usize, f64),
    ) -> Result<(), DdError>;
}

impl Symbolic for Mtbdd {
    type Node = Ref;
    type Index = Odd;

    fn apply(&self, op: Op, f: Ref, g: Ref) -> Result<Ref, DdError> {
        Mtbdd::apply(self, op, f, g)
    }

    fn sum_abstract(&self, f: Ref, vars: &VarSet) -> Result<Ref, DdError> {
        Mtbdd::sum_abstract(self, f, vars)
    }

    fn materialize_vector(
        &self,
        f: Ref,
        rows: &VarSet,
        odd: &Odd,
        out: &mut [f64],
    ) -> Result<(), DdError> {
        debug!("materialize_vector(f = {}, rows = {})", f, rows);
        check_rows(rows, odd)?;
        if out.len() != odd.num_states() {
            return Err(DdError::VariableMismatch(format!(
                "output has length {} but the index has {} states",
                out.len(),
                odd.num_states()
            )));
        }
        let walk = Walk { dd: self, rows, odd };
        walk.vector(f, 0, odd.root(), 0, out)
    }

    fn materialize_matrix(
        &self,
        f: Ref,
        rows: &VarSet,
        cols: &VarSet,
        odd: &Odd,
        visit: &mut dyn FnMut(usize, usize, f64),
    ) -> Result<(), DdError> {
        debug!("materialize_matrix(f = {}, rows = {}, cols = {})", f, rows, cols);
        check_rows(rows, odd)?;
        if !rows.is_interleaved_with(cols) {
            return Err(DdError::VariableMismatch(format!(
                "row variables {} and column variables {} are not interleaved",
                rows, cols
            )));
        }
        let walk = Walk { dd: self, rows, odd };
        walk.matrix(f, cols, 0, (odd.root(), odd.root()), (0, 0), visit)
    }
}

fn check_rows(rows: &VarSet, odd: &Odd) -> Result<(), DdError> {
    if rows.len() != odd.num_vars() {
        return Err(DdError::VariableMismatch(format!(
            "{} row variables but the state index is over {}",
            rows.len(),
            odd.num_vars()
        )));
    }
    Ok(())
}

struct Walk<'a> {
    dd: &'a Mtbdd,
    rows: &'a VarSet,
    odd: &'a Odd,
}

impl Walk<'_> {
    /// Terminal value at the bottom level; any remaining variable is foreign.
    fn leaf(&self, f: Ref) -> Result<f64, DdError> {
        match self.dd.variable(f) {
            Some(var) => Err(DdError::UnsupportedVariable { var }),
            None => Ok(self.dd.value(f).unwrap_or(0.0)),
        }
    }

    /// Cofactors of `f` for the next variable `v`, rejecting foreign variables above it.
    fn split(&self, f: Ref, v: crate::types::Var) -> Result<(Ref, Ref), DdError> {
        if let Some(top) = self.dd.variable(f) {
            if top < v {
                return Err(DdError::UnsupportedVariable { var: top });
            }
        }
        Ok(self.dd.cofactors(f, v))
    }

    fn vector(&self, f: Ref, level: usize, o: usize, offset: u64, out: &mut [f64]) -> Result<(), DdError> {
        if self.dd.is_zero(f) {
            return Ok(());
        }
        if level == self.rows.len() {
            out[offset as usize] = self.leaf(f)?;
            return Ok(());
        }
        let node = *self.odd.node(o);
        let (e, t) = self.split(f, self.rows.vars()[level])?;
        if node.eoff > 0 {
            self.vector(e, level + 1, node.else_, offset, out)?;
        }
        if node.toff > 0 {
            self.vector(t, level + 1, node.then, offset + node.eoff, out)?;
        }
        Ok(())
    }

    fn matrix(
        &self,
        f: Ref,
        cols: &VarSet,
        level: usize,
        (ro, co): (usize, usize),
        (r, c): (u64, u64),
        visit: &mut dyn FnMut(usize, usize, f64),
    ) -> Result<(), DdError> {
        if self.dd.is_zero(f) {
            return Ok(());
        }
        if level == self.rows.len() {
            visit(r as usize, c as usize, self.leaf(f)?);
            return Ok(());
        }

        let rn = *self.odd.node(ro);
        let cn = *self.odd.node(co);
        let (e, t) = self.split(f, self.rows.vars()[level])?;
        for (g, rchild, roff, rsize) in [(e, rn.else_, 0, rn.eoff), (t, rn.then, rn.eoff, rn.toff)] {
            if rsize == 0 || self.dd.is_zero(g) {
                continue;
            }
            let (ge, gt) = self.split(g, cols.vars()[level])?;
            for (h, cchild, coff, csize) in [(ge, cn.else_, 0, cn.eoff), (gt, cn.then, cn.eoff, cn.toff)] {
                if csize == 0 {
                    continue;
                }
                self.matrix(h, cols, level + 1, (rchild, cchild), (r + roff, c + coff), visit)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_op_eval() {
        assert_eq!(Op::Plus.eval(1.0, 2.0), 3.0);
        assert_eq!(Op::Minus.eval(1.0, 2.0), -1.0);
        assert_eq!(Op::Times.eval(3.0, 2.0), 6.0);
        assert_eq!(Op::Divide.eval(3.0, 2.0), 1.5);
        assert_eq!(Op::Min.eval(3.0, 2.0), 2.0);
        assert_eq!(Op::Max.eval(3.0, 2.0), 3.0);
        assert!(Op::Plus.is_commutative());
        assert!(!Op::Divide.is_commutative());
    }

    #[test]
    fn test_materialize_vector_skips_unreachable() {
        let dd = Mtbdd::default();
        let rows = VarSet::new([1, 3]);
        // Reachable: 0, 2, 3.
        let reach = dd.encode_vector(&[1., 0., 1., 1.], &rows).unwrap();
        let odd = Odd::build(&dd, reach, &rows).unwrap();
        let f = dd.encode_vector(&[5., 6., 7., 8.], &rows).unwrap();

        let mut out = vec![0.0; odd.num_states()];
        dd.materialize_vector(f, &rows, &odd, &mut out).unwrap();
        assert_eq!(out, vec![5., 7., 8.]);
    }

    #[test]
    fn test_materialize_matrix() {
        let dd = Mtbdd::default();
        let (rows, cols) = VarSet::interleaved(1, 2);
        let odd = Odd::build(&dd, dd.one, &rows).unwrap();
        let entries = [(0, 1, 0.5), (0, 3, 0.5), (2, 2, 1.0), (3, 0, 0.25)];
        let f = dd.encode_matrix(&entries, &rows, &cols).unwrap();

        let mut seen = Vec::new();
        dd.materialize_matrix(f, &rows, &cols, &odd, &mut |r, c, x| seen.push((r, c, x)))
            .unwrap();
        seen.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        assert_eq!(seen, vec![(0, 1, 0.5), (0, 3, 0.5), (2, 2, 1.0), (3, 0, 0.25)]);
    }

    #[test]
    fn test_materialize_rejects_mismatch() {
        let dd = Mtbdd::default();
        let (rows, cols) = VarSet::interleaved(1, 2);
        let odd = Odd::build(&dd, dd.one, &rows).unwrap();
        let f = dd.encode_matrix(&[(0, 0, 1.0)], &rows, &cols).unwrap();

        let mut ignore = |_: usize, _: usize, _: f64| {};
        let res = dd.materialize_matrix(f, &cols, &rows, &odd, &mut ignore);
        assert!(matches!(res, Err(DdError::VariableMismatch(_))));

        let short = VarSet::new([1]);
        let mut out = vec![0.0; 4];
        let res = dd.materialize_vector(f, &short, &odd, &mut out);
        assert!(matches!(res, Err(DdError::VariableMismatch(_))));

        // A function over rows and cols materialized as a vector: column variables are foreign.
        let res = dd.materialize_vector(f, &rows, &odd, &mut out);
        assert!(matches!(res, Err(DdError::UnsupportedVariable { .. })));
    }
}
