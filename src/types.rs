//! Type-safe wrappers for decision-diagram variables and variable sets.
//!
//! Row variables encode the "current state" and column variables the "next
//! state" of a transition relation. The explicit builders walk both sets in
//! lockstep, so the sets must be interleaved in the diagram ordering
//! (`r1 < c1 < r2 < c2 < ...`).
use std::fmt;

/// A variable identifier (1-indexed).
///
/// The identifier doubles as the position in the (fixed) variable ordering:
/// smaller identifiers are closer to the root.
///
/// # Invariants
///
/// - Variable IDs must be >= 1 (0 is reserved, as in DIMACS)
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Var(u32);

impl Var {
    /// Creates a new variable with the given ID.
    ///
    /// # Panics
    ///
    /// Panics if `id == 0`. Variables must be 1-indexed.
    pub fn new(id: u32) -> Self {
        assert_ne!(id, 0, "Variable IDs must be >= 1");
        Var(id)
    }

    /// Returns the raw variable ID as a `u32`.
    pub fn id(self) -> u32 {
        self.0
    }

    /// The pseudo-variable of terminal nodes, ordered below every real variable.
    pub(crate) const TERMINAL: Var = Var(u32::MAX);

    pub(crate) fn is_terminal(self) -> bool {
        self == Self::TERMINAL
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_terminal() {
            write!(f, "T")
        } else {
            write!(f, "x{}", self.0)
        }
    }
}

impl From<Var> for u32 {
    fn from(var: Var) -> Self {
        var.0
    }
}

/// An ordered set of variables, top-most first.
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash)]
pub struct VarSet {
    vars: Vec<Var>,
}

impl VarSet {
    /// Creates a variable set from raw IDs.
    ///
    /// # Panics
    ///
    /// Panics if any ID is zero.
    pub fn new(ids: impl IntoIterator<Item = u32>) -> Self {
        let mut vars: Vec<Var> = ids.into_iter().map(Var::new).collect();
        vars.sort();
        vars.dedup();
        Self { vars }
    }

    /// Creates the interleaved pair `(rows, cols)` of `num_vars` variables each,
    /// starting at `first`: rows get `first, first+2, ...`, cols `first+1, ...`.
    pub fn interleaved(first: u32, num_vars: usize) -> (Self, Self) {
        let rows = (0..num_vars as u32).map(|i| first + 2 * i);
        let cols = (0..num_vars as u32).map(|i| first + 2 * i + 1);
        (Self::new(rows), Self::new(cols))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    pub fn contains(&self, var: Var) -> bool {
        self.vars.binary_search(&var).is_ok()
    }

    /// Checks that `self` (rows) and `cols` alternate in the variable ordering.
    pub fn is_interleaved_with(&self, cols: &VarSet) -> bool {
        self.len() == cols.len()
            && self
                .vars
                .iter()
                .zip(&cols.vars)
                .enumerate()
                .all(|(i, (r, c))| r < c && self.vars.get(i + 1).map_or(true, |next| c < next))
    }
}

impl fmt::Display for VarSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, v) in self.vars.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, "}}")
    }
}
