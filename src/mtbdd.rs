//! Multi-terminal binary decision diagrams (MTBDDs).
//!
//! An MTBDD represents a function from boolean variables to `f64`. Inner
//! nodes test a variable; terminals carry a value. Nodes are hash-consed in a
//! [`Table`], so for the fixed variable ordering (smaller [`Var`] id = closer
//! to the root) every function has exactly one representation and equality
//! of functions is equality of [`Ref`]s.
//!
//! The manager offers the operations the explicit builders consume
//! ([`apply`][Mtbdd::apply], [`sum_abstract`][Mtbdd::sum_abstract]) and the
//! constructors needed to encode explicit models
//! ([`encode_vector`][Mtbdd::encode_vector], [`encode_matrix`][Mtbdd::encode_matrix]).

use std::cell::RefCell;
use std::cmp::min;
use std::collections::HashMap;
use std::fmt::Debug;

use log::debug;
use num_bigint::BigUint;

use crate::cache::{Cache, OpKey};
use crate::error::DdError;
use crate::reference::Ref;
use crate::symbolic::Op;
use crate::table::Table;
use crate::types::{Var, VarSet};
use crate::utils::{pairing3, value_bits, MyHash};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Node {
    variable: Var,
    low: Ref,
    high: Ref,
    /// Terminal value bits (see [`value_bits`]); 0 for inner nodes.
    value: u64,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            variable: Var::TERMINAL,
            low: Ref::INVALID,
            high: Ref::INVALID,
            value: 0,
        }
    }
}

impl MyHash for Node {
    fn hash(&self) -> u64 {
        if self.variable.is_terminal() {
            self.value ^ (self.value >> 29)
        } else {
            pairing3(
                self.variable.id() as u64,
                self.low.get() as u64,
                self.high.get() as u64,
            )
        }
    }
}

pub struct Mtbdd {
    storage: RefCell<Table<Node>>,
    cache: RefCell<Cache<OpKey, Ref>>,
    pub zero: Ref,
    pub one: Ref,
}

impl Mtbdd {
    /// Create a manager able to hold up to `2^storage_bits` nodes.
    pub fn new(storage_bits: usize) -> Self {
        assert!(
            storage_bits <= 31,
            "Storage bits should be in the range 0..=31"
        );
        assert!(storage_bits >= 2, "Storage must hold at least the two constant terminals");

        let cache_bits = min(storage_bits, 16);
        let mut storage = Table::new(storage_bits);

        let mut terminal = |value: f64| {
            storage
                .put(Node {
                    value: value_bits(value),
                    ..Node::default()
                })
                .map(|i| Ref::new(i as u32))
        };
        // Capacity is at least 4 (sentry + 2 terminals fit), so these cannot fail.
        let zero = terminal(0.0).unwrap_or(Ref::INVALID);
        let one = terminal(1.0).unwrap_or(Ref::INVALID);
        debug_assert!(zero.is_valid() && one.is_valid());

        Self {
            storage: RefCell::new(storage),
            cache: RefCell::new(Cache::new(cache_bits)),
            zero,
            one,
        }
    }
}

impl Default for Mtbdd {
    fn default() -> Self {
        Mtbdd::new(20)
    }
}

impl Debug for Mtbdd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let storage = self.storage.borrow();
        let cache = self.cache.borrow();
        f.debug_struct("Mtbdd")
            .field("capacity", &storage.capacity())
            .field("size", &storage.size())
            .field("cache_hits", &cache.hits())
            .field("cache_misses", &cache.misses())
            .finish()
    }
}

impl Mtbdd {
    fn node(&self, f: Ref) -> Node {
        self.storage.borrow()[f.index()]
    }

    /// Number of nodes in the unique table.
    pub fn num_nodes(&self) -> usize {
        self.storage.borrow().size()
    }

    /// Top variable of `f`, or [`None`] for a terminal.
    pub fn variable(&self, f: Ref) -> Option<Var> {
        let v = self.node(f).variable;
        (!v.is_terminal()).then_some(v)
    }

    /// Ordering key of `f`'s top variable; terminals sort below everything.
    pub(crate) fn level(&self, f: Ref) -> Var {
        self.node(f).variable
    }

    pub fn low(&self, f: Ref) -> Ref {
        self.node(f).low
    }
    pub fn high(&self, f: Ref) -> Ref {
        self.node(f).high
    }

    pub fn is_terminal(&self, f: Ref) -> bool {
        self.node(f).variable.is_terminal()
    }

    /// Terminal value of `f`, or [`None`] for an inner node.
    pub fn value(&self, f: Ref) -> Option<f64> {
        let node = self.node(f);
        node.variable
            .is_terminal()
            .then(|| f64::from_bits(node.value))
    }

    pub fn is_zero(&self, f: Ref) -> bool {
        f == self.zero
    }

    /// Make (or find) the terminal for `value`.
    pub fn constant(&self, value: f64) -> Result<Ref, DdError> {
        let i = self.storage.borrow_mut().put(Node {
            value: value_bits(value),
            ..Node::default()
        })?;
        Ok(Ref::new(i as u32))
    }

    pub fn mk_node(&self, v: Var, low: Ref, high: Ref) -> Result<Ref, DdError> {
        if low == high {
            return Ok(low);
        }
        debug_assert!(v < self.level(low) && v < self.level(high), "ordering violated at {}", v);

        let i = self.storage.borrow_mut().put(Node {
            variable: v,
            low,
            high,
            value: 0,
        })?;
        Ok(Ref::new(i as u32))
    }

    /// The 0/1 indicator function of variable `v`.
    pub fn var(&self, v: u32) -> Result<Ref, DdError> {
        self.mk_node(Var::new(v), self.zero, self.one)
    }

    /// Cofactors of `f` with respect to `v`: `(f|v=0, f|v=1)`.
    ///
    /// `v` must not be below the top variable of `f` in the ordering, unless
    /// `f` does not depend on it.
    pub fn cofactors(&self, f: Ref, v: Var) -> (Ref, Ref) {
        let node = self.node(f);
        if node.variable == v {
            (node.low, node.high)
        } else {
            (f, f)
        }
    }

    fn top(&self, fs: &[Ref]) -> Var {
        fs.iter().map(|&f| self.level(f)).min().unwrap_or(Var::TERMINAL)
    }

    /// Apply a binary numeric operator pointwise.
    pub fn apply(&self, op: Op, f: Ref, g: Ref) -> Result<Ref, DdError> {
        if let Some(res) = self.apply_terminal(op, f, g)? {
            return Ok(res);
        }

        let (f, g) = if op.is_commutative() && g < f { (g, f) } else { (f, g) };
        let key = OpKey::Apply(op, f, g);
        if let Some(res) = self.cache.borrow().get(&key) {
            debug!("cache: apply({:?}, {}, {}) -> {}", op, f, g, res);
            return Ok(res);
        }

        let v = self.top(&[f, g]);
        let (f0, f1) = self.cofactors(f, v);
        let (g0, g1) = self.cofactors(g, v);
        let low = self.apply(op, f0, g0)?;
        let high = self.apply(op, f1, g1)?;
        let res = self.mk_node(v, low, high)?;

        debug!("computed: apply({:?}, {}, {}) -> {}", op, f, g, res);
        self.cache.borrow_mut().insert(key, res);
        Ok(res)
    }

    fn apply_terminal(&self, op: Op, f: Ref, g: Ref) -> Result<Option<Ref>, DdError> {
        if let (Some(a), Some(b)) = (self.value(f), self.value(g)) {
            return self.constant(op.eval(a, b)).map(Some);
        }
        let res = match op {
            Op::Plus if f == self.zero => Some(g),
            Op::Plus | Op::Minus if g == self.zero => Some(f),
            Op::Times if f == self.zero || g == self.zero => Some(self.zero),
            Op::Times if f == self.one => Some(g),
            Op::Times | Op::Divide if g == self.one => Some(f),
            Op::Min | Op::Max if f == g => Some(f),
            _ => None,
        };
        Ok(res)
    }

    /// If-then-else: `g` where `f` is non-zero, `h` elsewhere.
    pub fn ite(&self, f: Ref, g: Ref, h: Ref) -> Result<Ref, DdError> {
        if let Some(c) = self.value(f) {
            return Ok(if c != 0.0 { g } else { h });
        }
        if g == h {
            return Ok(g);
        }

        let key = OpKey::Ite(f, g, h);
        if let Some(res) = self.cache.borrow().get(&key) {
            return Ok(res);
        }

        let v = self.top(&[f, g, h]);
        let (f0, f1) = self.cofactors(f, v);
        let (g0, g1) = self.cofactors(g, v);
        let (h0, h1) = self.cofactors(h, v);
        let low = self.ite(f0, g0, h0)?;
        let high = self.ite(f1, g1, h1)?;
        let res = self.mk_node(v, low, high)?;

        self.cache.borrow_mut().insert(key, res);
        Ok(res)
    }

    /// Sum `f` over all assignments of `vars`.
    ///
    /// Variables of `vars` that `f` does not depend on double the result.
    pub fn sum_abstract(&self, f: Ref, vars: &VarSet) -> Result<Ref, DdError> {
        debug!("sum_abstract(f = {}, vars = {})", f, vars);
        let mut cache = HashMap::new();
        self.sum_abstract_(f, vars.vars(), &mut cache)
    }

    fn sum_abstract_(
        &self,
        f: Ref,
        vars: &[Var],
        cache: &mut HashMap<(Ref, usize), Ref>,
    ) -> Result<Ref, DdError> {
        let Some((&v, rest)) = vars.split_first() else {
            return Ok(f);
        };
        if let Some(c) = self.value(f) {
            return self.constant(c * 2f64.powi(vars.len() as i32));
        }

        let key = (f, vars.len());
        if let Some(&res) = cache.get(&key) {
            return Ok(res);
        }

        let top = self.level(f);
        let res = if top < v {
            let low = self.sum_abstract_(self.low(f), vars, cache)?;
            let high = self.sum_abstract_(self.high(f), vars, cache)?;
            self.mk_node(top, low, high)?
        } else if top == v {
            let low = self.sum_abstract_(self.low(f), rest, cache)?;
            let high = self.sum_abstract_(self.high(f), rest, cache)?;
            self.apply(Op::Plus, low, high)?
        } else {
            let half = self.sum_abstract_(f, rest, cache)?;
            self.apply(Op::Plus, half, half)?
        };

        cache.insert(key, res);
        Ok(res)
    }

    /// Number of assignments to `num_vars` variables on which `f` is non-zero.
    ///
    /// `f` must not depend on more than `num_vars` variables.
    pub fn sat_count(&self, f: Ref, num_vars: usize) -> BigUint {
        let max = BigUint::from(1u8) << num_vars;
        let mut cache = HashMap::new();
        self.sat_count_(f, &max, &mut cache)
    }

    fn sat_count_(&self, f: Ref, max: &BigUint, cache: &mut HashMap<Ref, BigUint>) -> BigUint {
        if let Some(c) = self.value(f) {
            return if c != 0.0 { max.clone() } else { BigUint::ZERO };
        }
        if let Some(count) = cache.get(&f) {
            return count.clone();
        }

        let count_low = self.sat_count_(self.low(f), max, cache);
        let count_high = self.sat_count_(self.high(f), max, cache);
        let count: BigUint = (count_low + count_high) >> 1;

        cache.insert(f, count.clone());
        count
    }

    /// The 0/1 minterm of `index` over `vars` (first variable = most significant bit).
    pub fn minterm(&self, vars: &VarSet, index: u64) -> Result<Ref, DdError> {
        let len = vars.len();
        let mut current = self.one;
        for (k, &v) in vars.vars().iter().enumerate().rev() {
            let bit = (index >> (len - 1 - k)) & 1 == 1;
            current = if bit {
                self.mk_node(v, self.zero, current)?
            } else {
                self.mk_node(v, current, self.zero)?
            };
        }
        Ok(current)
    }

    /// Encode a vector indexed by the binary encoding of states over `rows`.
    pub fn encode_vector(&self, values: &[f64], rows: &VarSet) -> Result<Ref, DdError> {
        let mut res = self.zero;
        for (i, &x) in values.iter().enumerate() {
            if x != 0.0 {
                let m = self.minterm(rows, i as u64)?;
                let c = self.constant(x)?;
                res = self.ite(m, c, res)?;
            }
        }
        Ok(res)
    }

    /// Encode a matrix given as `(row, col, value)` entries; duplicate entries add up.
    pub fn encode_matrix(
        &self,
        entries: &[(u64, u64, f64)],
        rows: &VarSet,
        cols: &VarSet,
    ) -> Result<Ref, DdError> {
        let mut res = self.zero;
        for &(r, c, x) in entries {
            let mr = self.minterm(rows, r)?;
            let mc = self.minterm(cols, c)?;
            let cell = self.apply(Op::Times, mr, mc)?;
            let cell = self.apply(Op::Times, cell, self.constant(x)?)?;
            res = self.apply(Op::Plus, res, cell)?;
        }
        Ok(res)
    }

    /// Value of `f` under the assignment `true_vars` (all other variables false).
    pub fn eval(&self, f: Ref, true_vars: &VarSet) -> f64 {
        let mut current = f;
        loop {
            match self.value(current) {
                Some(c) => return c,
                None => {
                    let v = self.level(current);
                    current = if true_vars.contains(v) {
                        self.high(current)
                    } else {
                        self.low(current)
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_terminals() {
        let dd = Mtbdd::default();
        assert_eq!(dd.value(dd.zero), Some(0.0));
        assert_eq!(dd.value(dd.one), Some(1.0));
        assert_eq!(dd.constant(1.0).unwrap(), dd.one);
        assert_eq!(dd.constant(-0.0).unwrap(), dd.zero);
        assert!(dd.is_terminal(dd.constant(2.5).unwrap()));
    }

    #[test]
    fn test_var() {
        let dd = Mtbdd::default();
        let x = dd.var(3).unwrap();
        assert_eq!(dd.variable(x), Some(Var::new(3)));
        assert_eq!(dd.low(x), dd.zero);
        assert_eq!(dd.high(x), dd.one);
        assert_eq!(dd.var(3).unwrap(), x);
    }

    #[test]
    fn test_apply_plus_times() {
        let dd = Mtbdd::default();
        let x = dd.var(1).unwrap();
        let y = dd.var(2).unwrap();
        let two = dd.constant(2.0).unwrap();

        // f = 2x + y
        let f = dd.apply(Op::Plus, dd.apply(Op::Times, two, x).unwrap(), y).unwrap();
        assert_eq!(dd.eval(f, &VarSet::new([])), 0.0);
        assert_eq!(dd.eval(f, &VarSet::new([1])), 2.0);
        assert_eq!(dd.eval(f, &VarSet::new([2])), 1.0);
        assert_eq!(dd.eval(f, &VarSet::new([1, 2])), 3.0);

        // Commutativity yields the same canonical node.
        let g = dd.apply(Op::Plus, y, dd.apply(Op::Times, x, two).unwrap()).unwrap();
        assert_eq!(f, g);
    }

    #[test]
    fn test_apply_minus_self_is_zero() {
        let dd = Mtbdd::default();
        let x = dd.var(1).unwrap();
        let f = dd.apply(Op::Plus, x, dd.constant(0.25).unwrap()).unwrap();
        assert_eq!(dd.apply(Op::Minus, f, f).unwrap(), dd.zero);
    }

    #[test]
    fn test_apply_min_max_divide() {
        let dd = Mtbdd::default();
        let x = dd.var(1).unwrap();
        let three = dd.constant(3.0).unwrap();
        let f = dd.apply(Op::Plus, x, dd.one).unwrap(); // 1 or 2
        let max = dd.apply(Op::Max, f, dd.apply(Op::Times, x, three).unwrap()).unwrap();
        assert_eq!(dd.eval(max, &VarSet::new([])), 1.0);
        assert_eq!(dd.eval(max, &VarSet::new([1])), 3.0);
        let min = dd.apply(Op::Min, f, dd.constant(1.5).unwrap()).unwrap();
        assert_eq!(dd.eval(min, &VarSet::new([1])), 1.5);
        let div = dd.apply(Op::Divide, f, dd.constant(2.0).unwrap()).unwrap();
        assert_eq!(dd.eval(div, &VarSet::new([1])), 1.0);
    }

    #[test]
    fn test_ite() {
        let dd = Mtbdd::default();
        let x = dd.var(1).unwrap();
        let a = dd.constant(4.0).unwrap();
        let b = dd.constant(7.0).unwrap();
        let f = dd.ite(x, a, b).unwrap();
        assert_eq!(dd.eval(f, &VarSet::new([1])), 4.0);
        assert_eq!(dd.eval(f, &VarSet::new([])), 7.0);
    }

    #[test]
    fn test_sum_abstract() {
        let dd = Mtbdd::default();
        let (rows, cols) = VarSet::interleaved(1, 1);
        // [[0.5, 0.5], [0.0, 1.0]]
        let m = dd
            .encode_matrix(&[(0, 0, 0.5), (0, 1, 0.5), (1, 1, 1.0)], &rows, &cols)
            .unwrap();
        let sums = dd.sum_abstract(m, &cols).unwrap();
        assert_eq!(dd.eval(sums, &VarSet::new([])), 1.0);
        assert_eq!(dd.eval(sums, &VarSet::new([1])), 1.0);

        // Abstracting a variable outside the support doubles.
        let c = dd.constant(3.0).unwrap();
        let s = dd.sum_abstract(c, &VarSet::new([5, 6])).unwrap();
        assert_eq!(dd.value(s), Some(12.0));
        let x = dd.var(1).unwrap();
        let s = dd.sum_abstract(x, &VarSet::new([2])).unwrap();
        assert_eq!(dd.eval(s, &VarSet::new([1])), 2.0);
        assert_eq!(dd.eval(s, &VarSet::new([])), 0.0);
    }

    #[test]
    fn test_sat_count() {
        let dd = Mtbdd::default();
        let rows = VarSet::new([1, 2]);
        let f = dd.encode_vector(&[0.1, 0.7, 0.0, 0.9], &rows).unwrap();
        assert_eq!(dd.sat_count(f, 2), BigUint::from(3u8));
        // A variable outside the support doubles the count.
        assert_eq!(dd.sat_count(f, 3), BigUint::from(6u8));
        assert_eq!(dd.sat_count(dd.zero, 2), BigUint::ZERO);
    }

    #[test]
    fn test_minterm_and_encode() {
        let dd = Mtbdd::default();
        let rows = VarSet::new([1, 3, 5]);
        let m = dd.minterm(&rows, 0b101).unwrap();
        assert_eq!(dd.eval(m, &VarSet::new([1, 5])), 1.0);
        assert_eq!(dd.eval(m, &VarSet::new([1, 3, 5])), 0.0);
        assert_eq!(dd.sat_count(m, 3), BigUint::from(1u8));

        let v = dd.encode_vector(&[1.0, 0.0, 2.0], &rows).unwrap();
        assert_eq!(dd.eval(v, &VarSet::new([3])), 2.0);
    }

    #[test]
    fn test_storage_exhausted() {
        let dd = Mtbdd::new(3);
        let rows = VarSet::new([1, 2, 3, 4]);
        let res = dd.encode_vector(&[1.0, 2.0, 3.0, 4.0, 5.0], &rows);
        assert!(matches!(res, Err(DdError::Exhausted { capacity: 8 })));
    }
}
