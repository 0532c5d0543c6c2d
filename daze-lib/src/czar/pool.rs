/// Lowest-free stream id allocator over a 256-bit bitset. Bit i set
/// means id i is in use. The dialing side allocates with `get`; the
/// accepting side marks peer-chosen ids with `set`.
pub struct IdPool {
    bits: [u64; 4],
}

impl IdPool {
    pub fn new() -> Self {
        Self { bits: [0; 4] }
    }

    /// The numerically smallest free id, marked in use. `None` when all
    /// 256 ids are taken.
    pub fn get(&mut self) -> Option<u8> {
        for (word, bits) in self.bits.iter_mut().enumerate() {
            let free = !*bits;
            if free != 0 {
                let bit = free.trailing_zeros();
                *bits |= 1 << bit;
                return Some((word as u32 * 64 + bit) as u8);
            }
        }
        None
    }

    /// Release an id. The id must currently be in use.
    pub fn put(&mut self, id: u8) {
        let (word, bit) = (id as usize / 64, id as usize % 64);
        debug_assert!(self.bits[word] & (1 << bit) != 0, "put of free id {id}");
        self.bits[word] &= !(1 << bit);
    }

    /// Force-mark an id in use, whatever its current state.
    pub fn set(&mut self, id: u8) {
        let (word, bit) = (id as usize / 64, id as usize % 64);
        self.bits[word] |= 1 << bit;
    }

    pub fn is_set(&self, id: u8) -> bool {
        let (word, bit) = (id as usize / 64, id as usize % 64);
        self.bits[word] & (1 << bit) != 0
    }
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_the_lowest_free_id() {
        let mut pool = IdPool::new();
        assert_eq!(pool.get(), Some(0));
        assert_eq!(pool.get(), Some(1));
        assert_eq!(pool.get(), Some(2));
        pool.put(1);
        assert_eq!(pool.get(), Some(1));
        assert_eq!(pool.get(), Some(3));
    }

    #[test]
    fn exhaustion_and_release() {
        let mut pool = IdPool::new();
        for expect in 0..=255u8 {
            assert_eq!(pool.get(), Some(expect));
        }
        assert_eq!(pool.get(), None);
        pool.put(77);
        assert_eq!(pool.get(), Some(77));
        assert_eq!(pool.get(), None);
    }

    #[test]
    fn set_marks_arbitrary_ids() {
        let mut pool = IdPool::new();
        pool.set(0);
        pool.set(200);
        assert!(pool.is_set(0));
        assert!(pool.is_set(200));
        assert!(!pool.is_set(1));
        assert_eq!(pool.get(), Some(1));
        pool.put(200);
        assert!(!pool.is_set(200));
    }

    #[test]
    fn in_use_iff_bit_is_set() {
        let mut pool = IdPool::new();
        let mut taken = Vec::new();
        for _ in 0..100 {
            if let Some(id) = pool.get() {
                taken.push(id);
            }
        }
        for id in 0..=255u8 {
            assert_eq!(pool.is_set(id), taken.contains(&id));
        }
    }
}
