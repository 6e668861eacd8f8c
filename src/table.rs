use std::cmp::min;
use std::ops::Index;

use crate::error::DdError;
use crate::utils::MyHash;

#[derive(Clone)]
struct Entry<T> {
    value: T,
    next: usize,
}

impl<T> Default for Entry<T>
where
    T: Default,
{
    fn default() -> Self {
        Self {
            value: T::default(),
            next: 0,
        }
    }
}

/// Hash-consing table: every distinct value is stored exactly once.
///
/// Buckets are singly-linked chains threaded through the `next` field of the
/// entries. Cell 0 is a sentry, so index 0 doubles as the chain terminator.
/// There is no garbage collection: a table lives as long as its manager.
pub struct Table<T> {
    data: Vec<Entry<T>>,
    capacity: usize,

    buckets: Vec<usize>,
    bitmask: u64,
}

impl<T> Table<T>
where
    T: Default,
{
    /// Create a new table holding at most `2^bits` cells.
    ///
    /// Cells are allocated on demand, so a large capacity costs nothing
    /// until it is used.
    pub fn new(bits: usize) -> Self {
        assert!(bits <= 31, "Storage bits should be in the range 0..=31");

        let capacity = 1 << bits;
        let mut data = Vec::with_capacity(min(capacity, 1 << 10));
        data.push(Entry::default()); // sentry

        let buckets_bits = min(bits, 16);
        let buckets_size = 1 << buckets_bits;
        let buckets = vec![0; buckets_size];
        let bitmask = (buckets_size - 1) as u64;

        Self {
            data,
            capacity,
            buckets,
            bitmask,
        }
    }
}

impl<T> Table<T> {
    /// Maximum number of cells (including the sentry).
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    /// Number of stored values.
    pub fn size(&self) -> usize {
        self.data.len() - 1
    }

    /// Get the reference to the value at the given index.
    pub fn value(&self, index: usize) -> &T {
        assert_ne!(index, 0, "Index is 0");
        &self.data[index].value
    }

    fn next(&self, index: usize) -> usize {
        self.data[index].next
    }

    fn add(&mut self, value: T) -> Result<usize, DdError> {
        if self.data.len() >= self.capacity {
            return Err(DdError::Exhausted {
                capacity: self.capacity,
            });
        }
        self.data.push(Entry { value, next: 0 });
        Ok(self.data.len() - 1)
    }
}

impl<T> Table<T>
where
    T: MyHash + Eq,
{
    fn bucket_index(&self, value: &T) -> usize {
        (value.hash() & self.bitmask) as usize
    }

    /// Put a value into the table and return its index.
    ///
    /// Returns the existing index if an equal value is already stored.
    pub fn put(&mut self, value: T) -> Result<usize, DdError> {
        let bucket_index = self.bucket_index(&value);
        let mut index = self.buckets[bucket_index];

        if index == 0 {
            let i = self.add(value)?;
            self.buckets[bucket_index] = i;
            return Ok(i);
        }

        loop {
            if &value == self.value(index) {
                return Ok(index);
            }

            let next = self.next(index);
            if next == 0 {
                let i = self.add(value)?;
                self.data[index].next = i;
                return Ok(i);
            }
            index = next;
        }
    }
}

impl<T> Index<usize> for Table<T> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        self.value(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
    struct Item(i32);

    impl MyHash for Item {
        fn hash(&self) -> u64 {
            self.0.unsigned_abs() as u64
        }
    }

    #[test]
    fn test_put_dedup() {
        let mut table = Table::new(4);
        let a = table.put(Item(5)).unwrap();
        let b = table.put(Item(7)).unwrap();
        let c = table.put(Item(5)).unwrap();
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(table.size(), 2);
        assert_eq!(table[a], Item(5));
    }

    #[test]
    fn test_put_collision() {
        // Same hash, different values: chained in one bucket.
        let mut table = Table::new(4);
        let a = table.put(Item(5)).unwrap();
        let b = table.put(Item(-5)).unwrap();
        assert_ne!(a, b);
        assert_eq!(table[a], Item(5));
        assert_eq!(table[b], Item(-5));
        assert_eq!(table.next(a), b);
        assert_eq!(table.put(Item(-5)).unwrap(), b);
    }

    #[test]
    fn test_exhausted() {
        let mut table = Table::new(2);
        assert_eq!(table.put(Item(1)), Ok(1));
        assert_eq!(table.put(Item(2)), Ok(2));
        assert_eq!(table.put(Item(3)), Ok(3));
        assert_eq!(table.put(Item(4)), Err(DdError::Exhausted { capacity: 4 }));
        // Existing values are still found.
        assert_eq!(table.put(Item(2)), Ok(2));
    }
}
