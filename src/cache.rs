use std::cell::Cell;

use crate::reference::Ref;
use crate::symbolic::Op;
use crate::utils::{pairing2, pairing3, MyHash};

/// Key of a memoized diagram operation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpKey {
    Apply(Op, Ref, Ref),
    Ite(Ref, Ref, Ref),
}

impl MyHash for OpKey {
    fn hash(&self) -> u64 {
        match *self {
            OpKey::Apply(op, f, g) => pairing3(op as u64, f.get() as u64, g.get() as u64),
            OpKey::Ite(f, g, h) => pairing2(pairing3(f.get() as u64, g.get() as u64, h.get() as u64), 1 << 8),
        }
    }
}

struct Entry<K, V> {
    key: K,
    value: V,
}

/// Direct-mapped computed table.
///
/// A slot holds at most one entry; a colliding insert simply overwrites it.
/// The full key is stored, so a lookup never returns a foreign result.
pub struct Cache<K, V> {
    data: Vec<Option<Entry<K, V>>>,
    bitmask: u64,
    hits: Cell<usize>,
    misses: Cell<usize>,
}

impl<K, V> Cache<K, V> {
    /// Create a new cache of size `2^bits`.
    pub fn new(bits: usize) -> Self {
        assert!(bits <= 31, "Bits should be in the range 0..=31");

        let size = 1 << bits;
        let bitmask = (size - 1) as u64;

        Self {
            data: std::iter::repeat_with(|| None).take(size).collect(),
            bitmask,
            hits: Cell::new(0),
            misses: Cell::new(0),
        }
    }

    /// Get the number of cache hits.
    pub fn hits(&self) -> usize {
        self.hits.get()
    }
    /// Get the number of cache misses.
    pub fn misses(&self) -> usize {
        self.misses.get()
    }

    fn index(&self, hash: u64) -> usize {
        (hash & self.bitmask) as usize
    }
}

impl<K, V> Cache<K, V>
where
    K: MyHash + Eq,
    V: Copy,
{
    /// Get the cached result.
    pub fn get(&self, key: &K) -> Option<V> {
        match &self.data[self.index(key.hash())] {
            Some(entry) if &entry.key == key => {
                self.hits.set(self.hits.get() + 1);
                Some(entry.value)
            }
            _ => {
                self.misses.set(self.misses.get() + 1);
                None
            }
        }
    }

    /// Insert a result into the cache.
    pub fn insert(&mut self, key: K, value: V) {
        let index = self.index(key.hash());
        self.data[index] = Some(Entry { key, value });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache() {
        let mut cache = Cache::<(u64, u64), i32>::new(3);

        cache.insert((1, 2), 3);
        cache.insert((2, 3), 1);

        assert_eq!(cache.get(&(1, 2)), Some(3));
        assert_eq!(cache.get(&(2, 3)), Some(1));
        assert_eq!(cache.get(&(2, 1)), None);
        assert_eq!(cache.hits(), 2);
        assert_eq!(cache.misses(), 1);

        cache.insert((9, 9), 4);
        assert_eq!(cache.get(&(9, 9)), Some(4));
    }

    #[test]
    fn test_cache_collision_overwrites() {
        // With 0 bits every key maps to the single slot.
        let mut cache = Cache::<(u64, u64), i32>::new(0);
        cache.insert((1, 2), 10);
        cache.insert((5, 6), 20);
        assert_eq!(cache.get(&(1, 2)), None);
        assert_eq!(cache.get(&(5, 6)), Some(20));
    }

    #[test]
    fn test_op_keys_distinct() {
        let mut cache = Cache::<OpKey, Ref>::new(8);
        let (a, b) = (Ref::new(3), Ref::new(4));
        cache.insert(OpKey::Apply(Op::Plus, a, b), Ref::new(7));
        assert_eq!(cache.get(&OpKey::Apply(Op::Plus, a, b)), Some(Ref::new(7)));
        assert_eq!(cache.get(&OpKey::Apply(Op::Times, a, b)), None);
    }
}
