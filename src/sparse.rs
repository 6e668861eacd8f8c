//! Explicit sparse matrices built from symbolic transition structures.
//!
//! Two encodings are available:
//!
//! - [`RmSparseMatrix`]: row-major; one `f64` and one `u32` column per non-zero.
//! - [`CmsrSparseMatrix`]: "compact modified sparse row"; the distinct
//!   non-zero values are stored once in a dictionary and every entry is a
//!   single `u32` packing `(column << dist_shift) | dist_index`.
//!
//! Rows are delimited either by `u32` start offsets or, when every row has
//! fewer than 256 entries, by `u8` counts that are summed on the fly while
//! iterating. Both encodings expose rows through [`SparseMatrix::rows`], which
//! yields entries in ascending column order; consumers never need to know
//! which encoding is active.
//!
//! # Building
//!
//! [`build`] makes two passes over an [`EntrySource`]: the first counts
//! entries per row and collects distinct values, the second fills the arrays.
//! The compact encoding is chosen only when requested, representable
//! (dictionary index bits + column bits ≤ 32) and smaller than row-major.

use std::collections::HashMap;
use std::fmt;

use log::debug;

use crate::error::{DdError, SolveError};
use crate::symbolic::{StateIndex, Symbolic};
use crate::tracker::{try_alloc, Stage};
use crate::types::VarSet;
use crate::utils::index_bits;

/// How row boundaries are stored.
#[derive(Debug, Clone, PartialEq)]
pub enum RowLayout {
    /// Entries per row; row `i` starts where row `i-1` ended.
    Counts(Vec<u8>),
    /// Start offset of each row, plus one trailing end offset.
    Starts(Vec<u32>),
}

impl RowLayout {
    fn from_counts(counts: &[u32]) -> Result<Self, SolveError> {
        let n = counts.len();
        if counts.iter().all(|&c| c <= u8::MAX as u32) {
            let mut out = try_alloc(Stage::Matrix, n, 0u8)?;
            for (o, &c) in out.iter_mut().zip(counts) {
                *o = c as u8;
            }
            Ok(RowLayout::Counts(out))
        } else {
            let mut out = try_alloc(Stage::Matrix, n + 1, 0u32)?;
            let mut total = 0u32;
            for (i, &c) in counts.iter().enumerate() {
                out[i] = total;
                total += c;
            }
            out[n] = total;
            Ok(RowLayout::Starts(out))
        }
    }

    pub fn uses_counts(&self) -> bool {
        matches!(self, RowLayout::Counts(_))
    }

    pub fn mem_bytes(&self) -> usize {
        match self {
            RowLayout::Counts(c) => c.len(),
            RowLayout::Starts(s) => s.len() * 4,
        }
    }
}

/// Row-major sparse matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct RmSparseMatrix {
    n: usize,
    non_zeros: Vec<f64>,
    cols: Vec<u32>,
    layout: RowLayout,
}

/// Compact modified sparse row matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct CmsrSparseMatrix {
    n: usize,
    cols: Vec<u32>,
    dist: Vec<f64>,
    dist_shift: u32,
    dist_mask: u32,
    layout: RowLayout,
}

impl CmsrSparseMatrix {
    pub fn num_dist(&self) -> usize {
        self.dist.len()
    }
    pub fn dist_shift(&self) -> u32 {
        self.dist_shift
    }
    pub fn dist_mask(&self) -> u32 {
        self.dist_mask
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MatrixKind {
    RowMajor,
    Compact,
}

impl fmt::Display for MatrixKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatrixKind::RowMajor => write!(f, "row-major"),
            MatrixKind::Compact => write!(f, "compact"),
        }
    }
}

/// A sparse matrix in either encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum SparseMatrix {
    RowMajor(RmSparseMatrix),
    Compact(CmsrSparseMatrix),
}

impl SparseMatrix {
    /// Number of rows (and columns).
    pub fn n(&self) -> usize {
        match self {
            SparseMatrix::RowMajor(m) => m.n,
            SparseMatrix::Compact(m) => m.n,
        }
    }

    pub fn nnz(&self) -> usize {
        match self {
            SparseMatrix::RowMajor(m) => m.cols.len(),
            SparseMatrix::Compact(m) => m.cols.len(),
        }
    }

    pub fn kind(&self) -> MatrixKind {
        match self {
            SparseMatrix::RowMajor(_) => MatrixKind::RowMajor,
            SparseMatrix::Compact(_) => MatrixKind::Compact,
        }
    }

    pub fn is_compact(&self) -> bool {
        self.kind() == MatrixKind::Compact
    }

    pub fn layout(&self) -> &RowLayout {
        match self {
            SparseMatrix::RowMajor(m) => &m.layout,
            SparseMatrix::Compact(m) => &m.layout,
        }
    }

    pub fn mem_bytes(&self) -> usize {
        match self {
            SparseMatrix::RowMajor(m) => m.non_zeros.len() * 8 + m.cols.len() * 4 + m.layout.mem_bytes(),
            SparseMatrix::Compact(m) => m.cols.len() * 4 + m.dist.len() * 8 + m.layout.mem_bytes(),
        }
    }

    /// Multiply every entry by `factor`.
    ///
    /// The compact encoding only rescales its dictionary; either way each
    /// stored value becomes `value * factor`, so the encodings stay equivalent.
    pub fn scale(&mut self, factor: f64) {
        let values = match self {
            SparseMatrix::RowMajor(m) => &mut m.non_zeros,
            SparseMatrix::Compact(m) => &mut m.dist,
        };
        for v in values.iter_mut() {
            *v *= factor;
        }
    }

    /// Iterate over the rows in order.
    pub fn rows(&self) -> Rows<'_> {
        Rows {
            matrix: self,
            row: 0,
            offset: 0,
        }
    }

    /// Random access to the rows; resolves running counts into offsets.
    pub fn indexed(&self) -> Result<IndexedRows<'_>, SolveError> {
        let n = self.n();
        let starts = match self.layout() {
            RowLayout::Starts(s) => {
                let mut starts = try_alloc(Stage::Matrix, n + 1, 0u32)?;
                starts.copy_from_slice(s);
                starts
            }
            RowLayout::Counts(c) => {
                let mut starts = try_alloc(Stage::Matrix, n + 1, 0u32)?;
                let mut total = 0u32;
                for (i, &k) in c.iter().enumerate() {
                    starts[i] = total;
                    total += k as u32;
                }
                starts[n] = total;
                starts
            }
        };
        Ok(IndexedRows { matrix: self, starts })
    }

    fn slice(&self, lo: usize, hi: usize) -> Row<'_> {
        match self {
            SparseMatrix::RowMajor(m) => Row::Plain {
                values: &m.non_zeros[lo..hi],
                cols: &m.cols[lo..hi],
            },
            SparseMatrix::Compact(m) => Row::Packed {
                cols: &m.cols[lo..hi],
                dist: &m.dist,
                shift: m.dist_shift,
                mask: m.dist_mask,
            },
        }
    }

    /// All entries as `(row, col, value)`, row by row.
    pub fn to_triplets(&self) -> Vec<(usize, usize, f64)> {
        self.rows()
            .enumerate()
            .flat_map(|(i, row)| row.iter().map(move |(j, x)| (i, j, x)))
            .collect()
    }
}

/// Entries of one row.
#[derive(Debug, Copy, Clone)]
pub enum Row<'a> {
    Plain {
        values: &'a [f64],
        cols: &'a [u32],
    },
    Packed {
        cols: &'a [u32],
        dist: &'a [f64],
        shift: u32,
        mask: u32,
    },
}

impl<'a> Row<'a> {
    pub fn len(&self) -> usize {
        match self {
            Row::Plain { cols, .. } | Row::Packed { cols, .. } => cols.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `acc + Σ w·x[col]` over the row, summed in ascending column order.
    #[inline]
    pub fn accumulate(&self, mut acc: f64, x: &[f64]) -> f64 {
        match *self {
            Row::Plain { values, cols } => {
                for (w, &c) in values.iter().zip(cols) {
                    acc += w * x[c as usize];
                }
            }
            Row::Packed {
                cols,
                dist,
                shift,
                mask,
            } => {
                for &p in cols {
                    acc += dist[(p & mask) as usize] * x[(p >> shift) as usize];
                }
            }
        }
        acc
    }

    /// `(col, value)` pairs in ascending column order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + 'a {
        let row = *self;
        (0..row.len()).map(move |k| match row {
            Row::Plain { values, cols } => (cols[k] as usize, values[k]),
            Row::Packed {
                cols,
                dist,
                shift,
                mask,
            } => ((cols[k] >> shift) as usize, dist[(cols[k] & mask) as usize]),
        })
    }
}

/// Iterator over the rows of a [`SparseMatrix`].
pub struct Rows<'a> {
    matrix: &'a SparseMatrix,
    row: usize,
    offset: usize,
}

impl<'a> Iterator for Rows<'a> {
    type Item = Row<'a>;

    #[inline]
    fn next(&mut self) -> Option<Row<'a>> {
        let matrix = self.matrix;
        if self.row >= matrix.n() {
            return None;
        }
        let (lo, hi) = match matrix.layout() {
            RowLayout::Counts(c) => (self.offset, self.offset + c[self.row] as usize),
            RowLayout::Starts(s) => (s[self.row] as usize, s[self.row + 1] as usize),
        };
        self.row += 1;
        self.offset = hi;
        Some(matrix.slice(lo, hi))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.matrix.n() - self.row;
        (rest, Some(rest))
    }
}

impl ExactSizeIterator for Rows<'_> {}

/// Rows of a [`SparseMatrix`] addressable by index.
pub struct IndexedRows<'a> {
    matrix: &'a SparseMatrix,
    starts: Vec<u32>,
}

impl<'a> IndexedRows<'a> {
    pub fn row(&self, i: usize) -> Row<'a> {
        self.matrix.slice(self.starts[i] as usize, self.starts[i + 1] as usize)
    }

    pub fn mem_bytes(&self) -> usize {
        self.starts.len() * 4
    }
}

/// Something that can enumerate the non-zero entries of an `n × n` matrix.
///
/// Entries may come in any order but must be visited identically by
/// repeated calls.
pub trait EntrySource {
    fn num_states(&self) -> usize;

    fn visit(&self, visit: &mut dyn FnMut(usize, usize, f64)) -> Result<(), DdError>;
}

/// Entries of a symbolic function over row and column variables.
pub struct SymbolicEntries<'a, D: Symbolic> {
    pub dd: &'a D,
    pub f: D::Node,
    pub rows: &'a VarSet,
    pub cols: &'a VarSet,
    pub index: &'a D::Index,
}

impl<D: Symbolic> EntrySource for SymbolicEntries<'_, D> {
    fn num_states(&self) -> usize {
        self.index.num_states()
    }

    fn visit(&self, visit: &mut dyn FnMut(usize, usize, f64)) -> Result<(), DdError> {
        self.dd
            .materialize_matrix(self.f, self.rows, self.cols, self.index, visit)
    }
}

/// Explicit `(row, col, value)` entries; duplicates are summed, zeros dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Triplets {
    n: usize,
    entries: Vec<(usize, usize, f64)>,
}

impl Triplets {
    /// # Panics
    ///
    /// Panics if an index is out of range.
    pub fn new(n: usize, entries: impl IntoIterator<Item = (usize, usize, f64)>) -> Self {
        let mut entries: Vec<_> = entries.into_iter().collect();
        for &(r, c, _) in &entries {
            assert!(r < n && c < n, "entry ({}, {}) out of range for n = {}", r, c, n);
        }
        entries.sort_by_key(|&(r, c, _)| (r, c));
        let mut merged: Vec<(usize, usize, f64)> = Vec::with_capacity(entries.len());
        for (r, c, x) in entries {
            match merged.last_mut() {
                Some(last) if (last.0, last.1) == (r, c) => last.2 += x,
                _ => merged.push((r, c, x)),
            }
        }
        merged.retain(|e| e.2 != 0.0);
        Self { n, entries: merged }
    }
}

impl EntrySource for Triplets {
    fn num_states(&self) -> usize {
        self.n
    }

    fn visit(&self, visit: &mut dyn FnMut(usize, usize, f64)) -> Result<(), DdError> {
        for &(r, c, x) in &self.entries {
            visit(r, c, x);
        }
        Ok(())
    }
}

/// Knobs of [`build`].
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct BuildOptions {
    /// Try the compact encoding first.
    pub compact: bool,
    /// Store the transpose (entry `(i, j)` lands in row `j`).
    pub transpose: bool,
    /// Keep diagonal entries out of the matrix and return them separately.
    pub split_diagonal: bool,
}

/// Result of [`build`].
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltMatrix {
    pub matrix: SparseMatrix,
    /// Diagonal entries, when [`BuildOptions::split_diagonal`] was set.
    pub diagonal: Option<Vec<f64>>,
}

impl BuiltMatrix {
    pub fn mem_bytes(&self) -> usize {
        self.matrix.mem_bytes() + self.diagonal.as_ref().map_or(0, |d| d.len() * 8)
    }
}

/// Build an explicit sparse matrix from `source`.
pub fn build(source: &impl EntrySource, options: BuildOptions) -> Result<BuiltMatrix, SolveError> {
    let n = source.num_states();
    let col_bits = index_bits(n);
    let max_dist = 1usize << (32 - col_bits);

    let place = |r: usize, c: usize| if options.transpose { (c, r) } else { (r, c) };

    // Pass 1: row counts, diagonal, distinct values.
    let mut counts = try_alloc(Stage::Matrix, n, 0u32)?;
    let mut diagonal = if options.split_diagonal {
        Some(try_alloc(Stage::Matrix, n, 0.0f64)?)
    } else {
        None
    };
    let mut distinct: HashMap<u64, u32> = HashMap::new();
    let mut dist: Vec<f64> = Vec::new();
    let mut representable = options.compact;

    source.visit(&mut |r, c, x| {
        let (r, c) = place(r, c);
        if let Some(d) = diagonal.as_mut() {
            if r == c {
                d[r] += x;
                return;
            }
        }
        counts[r] += 1;
        if representable && !distinct.contains_key(&x.to_bits()) {
            if dist.len() < max_dist {
                distinct.insert(x.to_bits(), dist.len() as u32);
                dist.push(x);
            } else {
                representable = false;
            }
        }
    })?;

    let nnz: usize = counts.iter().map(|&c| c as usize).sum();
    if nnz > u32::MAX as usize {
        return Err(DdError::TooManyNonZeros { nnz }.into());
    }
    let layout = RowLayout::from_counts(&counts)?;

    let dist_shift = index_bits(dist.len());
    let rm_mem = nnz * 12 + layout.mem_bytes();
    let cmsr_mem = nnz * 4 + dist.len() * 8 + layout.mem_bytes();
    let compact = representable && col_bits + dist_shift <= 32 && cmsr_mem < rm_mem;
    debug!(
        "build: n = {}, nnz = {}, distinct = {}, counts = {}, compact = {} (requested {})",
        n,
        nnz,
        dist.len(),
        layout.uses_counts(),
        compact,
        options.compact
    );

    // Pass 2: fill each row from its start offset.
    let mut next = try_alloc(Stage::Matrix, n, 0usize)?;
    let mut total = 0usize;
    for (slot, &c) in next.iter_mut().zip(&counts) {
        *slot = total;
        total += c as usize;
    }
    let mut cols = try_alloc(Stage::Matrix, nnz, 0u32)?;
    let mut non_zeros = if compact {
        Vec::new()
    } else {
        try_alloc(Stage::Matrix, nnz, 0.0f64)?
    };
    let dist_mask = ((1u64 << dist_shift) - 1) as u32;

    source.visit(&mut |r, c, x| {
        let (r, c) = place(r, c);
        if options.split_diagonal && r == c {
            return;
        }
        let p = next[r];
        next[r] += 1;
        if compact {
            cols[p] = ((c as u32) << dist_shift) | distinct[&x.to_bits()];
        } else {
            cols[p] = c as u32;
            non_zeros[p] = x;
        }
    })?;

    // Ascending column order within each row.
    let mut start = 0usize;
    let mut scratch: Vec<(u32, f64)> = Vec::new();
    for &count in &counts {
        let end = start + count as usize;
        if compact {
            // Columns sit in the high bits and are unique per row.
            cols[start..end].sort_unstable();
        } else {
            scratch.clear();
            scratch.extend(cols[start..end].iter().copied().zip(non_zeros[start..end].iter().copied()));
            scratch.sort_unstable_by_key(|e| e.0);
            for (k, (c, x)) in scratch.iter().copied().enumerate() {
                cols[start + k] = c;
                non_zeros[start + k] = x;
            }
        }
        start = end;
    }

    let matrix = if compact {
        SparseMatrix::Compact(CmsrSparseMatrix {
            n,
            cols,
            dist,
            dist_shift,
            dist_mask,
            layout,
        })
    } else {
        SparseMatrix::RowMajor(RmSparseMatrix {
            n,
            non_zeros,
            cols,
            layout,
        })
    };
    Ok(BuiltMatrix { matrix, diagonal })
}
