//! Object pool with recyclable, generation-tagged slots.

/// Raw slot index into a pool. Reused after release.
pub type PoolIndex = u32;

/// A slab of objects with O(1) create/get/release and slot reuse.
///
/// Every slot carries a generation counter, bumped on release, so an id
/// that outlives its object can never observe the slot's next occupant.
pub struct Pool<T> {
    slots: Vec<Option<T>>,
    gens: Vec<u32>,
    free: Vec<PoolIndex>,
    len: usize,
}

impl<T> Pool<T> {
    pub fn new() -> Self {
        Self { slots: Vec::new(), gens: Vec::new(), free: Vec::new(), len: 0 }
    }

    /// Insert an object, reusing a freed slot when one exists.
    /// Returns `(index, generation)`.
    pub fn create(&mut self, obj: T) -> (PoolIndex, u32) {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let i = index as usize;
            self.slots[i] = Some(obj);
            (index, self.gens[i])
        } else {
            let index = self.slots.len() as PoolIndex;
            self.slots.push(Some(obj));
            self.gens.push(0);
            (index, 0)
        }
    }

    pub fn get(&self, index: PoolIndex, generation: u32) -> Option<&T> {
        let i = index as usize;
        if i < self.slots.len() && self.gens[i] == generation {
            self.slots[i].as_ref()
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, index: PoolIndex, generation: u32) -> Option<&mut T> {
        let i = index as usize;
        if i < self.slots.len() && self.gens[i] == generation {
            self.slots[i].as_mut()
        } else {
            None
        }
    }

    /// Release a slot for reuse. The slot's generation is bumped so any
    /// surviving id with the old generation reads as dead.
    pub fn release(&mut self, index: PoolIndex, generation: u32) -> Option<T> {
        let i = index as usize;
        if i >= self.slots.len() || self.gens[i] != generation {
            return None;
        }
        let obj = self.slots[i].take()?;
        self.gens[i] = self.gens[i].wrapping_add(1);
        self.free.push(index);
        self.len -= 1;
        Some(obj)
    }

    /// Drop everything and start indices over from zero.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.gens.clear();
        self.free.clear();
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Live `(index, generation)` pairs in slot order.
    pub fn iter_ids(&self) -> impl Iterator<Item = (PoolIndex, u32)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.as_ref().map(|_| (i as PoolIndex, self.gens[i]))
        })
    }

    /// Number of slots ever allocated (live + freed). Upper bound on any
    /// live index, used to size dense stores.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_get_release() {
        let mut pool: Pool<&str> = Pool::new();
        let (i, g) = pool.create("a");
        assert_eq!(pool.get(i, g), Some(&"a"));
        assert_eq!(pool.release(i, g), Some("a"));
        assert_eq!(pool.get(i, g), None);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let mut pool: Pool<u8> = Pool::new();
        let (i0, g0) = pool.create(1);
        pool.release(i0, g0);
        let (i1, g1) = pool.create(2);
        assert_eq!(i0, i1);
        assert_ne!(g0, g1);
        assert_eq!(pool.get(i0, g0), None);
        assert_eq!(pool.get(i1, g1), Some(&2));
    }

    #[test]
    fn test_double_release_is_noop() {
        let mut pool: Pool<u8> = Pool::new();
        let (i, g) = pool.create(1);
        assert!(pool.release(i, g).is_some());
        assert!(pool.release(i, g).is_none());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_iter_ids_skips_freed() {
        let mut pool: Pool<u8> = Pool::new();
        let a = pool.create(1);
        let b = pool.create(2);
        pool.create(3);
        pool.release(b.0, b.1);
        let ids: Vec<_> = pool.iter_ids().collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], a);
    }
}
