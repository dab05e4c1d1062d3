//! Fixed-size bitset indexed by property position.

/// A set of property positions.
///
/// Beans use one for "loaded" and one for "dirty" tracking; both are indexed by
/// the property's position in its descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldSet {
    bits: Vec<u64>,
    len: usize,
}

impl FieldSet {
    /// An empty set able to hold `len` positions.
    pub fn empty(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// A set with every position in `0..len` present.
    pub fn all(len: usize) -> Self {
        let mut set = Self::empty(len);
        for idx in 0..len {
            set.set(idx);
        }
        set
    }

    /// Capacity in positions.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no position is set.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|word| *word == 0)
    }

    /// Add a position. Out of range positions are ignored.
    pub fn set(&mut self, idx: usize) {
        if idx < self.len {
            self.bits[idx / 64] |= 1 << (idx % 64);
        }
    }

    /// Remove a position.
    pub fn clear(&mut self, idx: usize) {
        if idx < self.len {
            self.bits[idx / 64] &= !(1 << (idx % 64));
        }
    }

    /// Remove every position.
    pub fn clear_all(&mut self) {
        self.bits.iter_mut().for_each(|word| *word = 0);
    }

    /// Whether a position is present.
    pub fn is_set(&self, idx: usize) -> bool {
        idx < self.len && self.bits[idx / 64] & (1 << (idx % 64)) != 0
    }

    /// Positions present, ascending.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|idx| self.is_set(*idx))
    }

    /// Number of positions present.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|word| word.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_iter() {
        let mut set = FieldSet::empty(70);
        set.set(0);
        set.set(65);
        set.set(200);
        assert!(set.is_set(65));
        assert!(!set.is_set(200));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 65]);
        set.clear(0);
        assert_eq!(set.count(), 1);
        set.clear_all();
        assert!(set.is_empty());
    }

    #[test]
    fn test_all() {
        let set = FieldSet::all(3);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    }
}
