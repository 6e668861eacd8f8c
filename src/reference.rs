use std::fmt::{Display, Formatter};

/// Handle to a node in the [`Mtbdd`][crate::mtbdd::Mtbdd] unique table.
///
/// Multi-terminal diagrams carry no complement edges, so a reference is just an
/// index. Index 0 is the table sentry and never names a live node.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Ref(u32);

impl Ref {
    pub(crate) const INVALID: Ref = Ref(0);

    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Return the index of the referenced node.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Return the internal representation of the reference.
    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl Display for Ref {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref() {
        let r = Ref::new(42);
        assert_eq!(r.index(), 42);
        assert_eq!(r.get(), 42);
        assert!(r.is_valid());
        assert!(!Ref::INVALID.is_valid());
        assert_eq!(r.to_string(), "@42");
    }
}
