//! Swap-compacted slot stack backing each size class.
//!
//! Slots `[0, pos)` hold busy items (handed out to callers) and slots `[pos, top)` hold idle
//! items ready for reuse. Releasing a busy item swaps it with the last busy slot, so both
//! regions stay contiguous and [Stack::pop] never has to search for an idle item.
//!
//! ```text
//!   0                  pos                 top          max
//!   [busy][busy][busy] [idle][idle][idle]  [unused ...]
//! ```

use crate::{Config, Error};

/// An item that records which slot it currently occupies.
pub(crate) trait Locate {
    /// Record that the item now lives at `slot`.
    fn locate(&self, slot: usize);
}

/// Growth policy of a slot array.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Growth {
    initial: usize,
    threshold: usize,
    increment: usize,
    limit: usize,
}

impl From<&Config> for Growth {
    fn from(cfg: &Config) -> Self {
        Self {
            initial: cfg.initial_slots,
            threshold: cfg.growth_threshold,
            increment: cfg.growth_increment,
            limit: cfg.max_slots,
        }
    }
}

impl Growth {
    /// Returns the next array size after `max`, or `None` if `limit` has been reached.
    fn next(&self, max: usize) -> Option<usize> {
        if max >= self.limit {
            return None;
        }
        let next = if max < self.threshold {
            max.saturating_mul(2)
        } else {
            max.saturating_add(self.increment)
        };
        Some(next.clamp(max + 1, self.limit))
    }
}

/// A growable array of slots partitioned into a busy prefix and an idle suffix.
pub(crate) struct Stack<T> {
    /// Boundary between busy and idle slots.
    pos: usize,
    /// Number of slots the array may hold before it must grow.
    max: usize,
    /// Occupied slots (`slots.len()` is `top`).
    slots: Vec<T>,
    growth: Growth,
}

impl<T: Locate> Stack<T> {
    /// Creates an empty stack with `growth.initial` slots reserved.
    pub(crate) fn new(growth: Growth) -> Result<Self, Error> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(growth.initial)
            .map_err(|_| Error::ResourceExhausted)?;
        Ok(Self {
            pos: 0,
            max: growth.initial,
            slots,
            growth,
        })
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn top(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn max(&self) -> usize {
        self.max
    }

    pub(crate) fn get(&self, slot: usize) -> Option<&T> {
        self.slots.get(slot)
    }

    /// Returns the idle item that the next [Stack::pop] would hand out.
    pub(crate) fn idle(&self) -> Option<&T> {
        self.slots.get(self.pos)
    }

    /// Hands out the first idle slot, if any.
    pub(crate) fn pop(&mut self) -> Option<usize> {
        if self.pos == self.slots.len() {
            return None;
        }
        let slot = self.pos;
        self.pos += 1;
        Some(slot)
    }

    /// Adds a new busy item at `pos`.
    ///
    /// If an idle item occupies `pos`, it is moved to the end of the array so idle items stay
    /// contiguous.
    pub(crate) fn insert(&mut self, item: T) -> Result<usize, Error> {
        self.reserve()?;

        let slot = self.pos;
        let top = self.slots.len();
        self.slots.push(item);
        if slot != top {
            self.slots.swap(slot, top);
            self.slots[top].locate(top);
        }
        self.slots[slot].locate(slot);
        self.pos += 1;
        Ok(slot)
    }

    /// Returns the busy item at `slot` to the idle region.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is not busy.
    pub(crate) fn release(&mut self, slot: usize) {
        assert!(
            slot < self.pos,
            "slot {slot} is not busy (pos={})",
            self.pos
        );
        self.pos -= 1;
        if slot != self.pos {
            self.slots.swap(slot, self.pos);
            self.slots[slot].locate(slot);
            self.slots[self.pos].locate(self.pos);
        }
    }

    /// Removes idle items until at most `keep` remain, discarding the items with the smallest
    /// `key` first. The slot array itself keeps its size.
    pub(crate) fn shed_idle<K: Ord>(&mut self, keep: usize, key: impl Fn(&T) -> K) -> Vec<T> {
        let mut shed = Vec::new();
        while self.slots.len() - self.pos > keep {
            let Some(victim) = (self.pos..self.slots.len()).min_by_key(|&i| key(&self.slots[i]))
            else {
                break;
            };
            let last = self.slots.len() - 1;
            if victim != last {
                self.slots.swap(victim, last);
                self.slots[victim].locate(victim);
            }
            if let Some(item) = self.slots.pop() {
                shed.push(item);
            }
        }
        shed
    }

    /// Ensures there is room for one more slot, growing the array if required.
    fn reserve(&mut self) -> Result<(), Error> {
        if self.slots.len() < self.max {
            return Ok(());
        }
        let max = self.growth.next(self.max).ok_or(Error::ResourceExhausted)?;
        self.slots
            .try_reserve_exact(max - self.slots.len())
            .map_err(|_| Error::ResourceExhausted)?;
        self.max = max;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::cell::Cell;

    /// An item that remembers its id and the slot it was last told about.
    struct Item {
        id: usize,
        slot: Cell<usize>,
    }

    impl Item {
        fn new(id: usize) -> Self {
            Self {
                id,
                slot: Cell::new(usize::MAX),
            }
        }
    }

    impl Locate for Item {
        fn locate(&self, slot: usize) {
            self.slot.set(slot);
        }
    }

    fn growth(initial: usize, threshold: usize, increment: usize, limit: usize) -> Growth {
        Growth {
            initial,
            threshold,
            increment,
            limit,
        }
    }

    /// Asserts every item's locator matches its physical slot and `0 <= pos <= top <= max`.
    fn assert_compact(stack: &Stack<Item>) {
        assert!(stack.pos() <= stack.top());
        assert!(stack.top() <= stack.max());
        for slot in 0..stack.top() {
            assert_eq!(stack.get(slot).unwrap().slot.get(), slot);
        }
    }

    #[test]
    fn test_insert_then_pop_reuses_released_slot() {
        let mut stack = Stack::new(growth(4, 16, 16, 64)).unwrap();
        let a = stack.insert(Item::new(0)).unwrap();
        assert_eq!(a, 0);
        stack.release(a);
        assert_eq!((stack.pos(), stack.top()), (0, 1));

        let b = stack.pop().unwrap();
        assert_eq!(b, 0);
        assert_eq!(stack.get(b).unwrap().id, 0);
        assert!(stack.pop().is_none());
        assert_compact(&stack);
    }

    #[test]
    fn test_release_swaps_last_busy_into_hole() {
        let mut stack = Stack::new(growth(4, 16, 16, 64)).unwrap();
        for id in 0..3 {
            stack.insert(Item::new(id)).unwrap();
        }

        // Releasing the first item moves the last busy item into its slot
        stack.release(0);
        assert_eq!(stack.pos(), 2);
        assert_eq!(stack.get(0).unwrap().id, 2);
        assert_eq!(stack.get(2).unwrap().id, 0);
        assert_compact(&stack);
    }

    #[test]
    fn test_insert_moves_idle_to_end() {
        let mut stack = Stack::new(growth(4, 16, 16, 64)).unwrap();
        stack.insert(Item::new(0)).unwrap();
        stack.insert(Item::new(1)).unwrap();
        stack.release(1);
        stack.release(0);
        assert_eq!((stack.pos(), stack.top()), (0, 2));

        // A new busy item takes `pos`; the idle occupant moves to the end
        let slot = stack.insert(Item::new(2)).unwrap();
        assert_eq!(slot, 0);
        assert_eq!((stack.pos(), stack.top()), (1, 3));
        assert_eq!(stack.idle().unwrap().id, 1);
        assert_eq!(stack.get(2).unwrap().id, 0);
        assert_compact(&stack);
    }

    #[test]
    fn test_growth_doubles_then_increments() {
        let g = growth(2, 8, 3, 20);
        assert_eq!(g.next(2), Some(4));
        assert_eq!(g.next(4), Some(8));
        assert_eq!(g.next(8), Some(11));
        assert_eq!(g.next(17), Some(20));
        assert_eq!(g.next(20), None);
    }

    #[test]
    fn test_growth_cap_exhausts() {
        let mut stack = Stack::new(growth(2, 4, 2, 5)).unwrap();
        for id in 0..5 {
            stack.insert(Item::new(id)).unwrap();
        }
        assert_eq!(stack.max(), 5);
        assert_eq!(
            stack.insert(Item::new(5)).err(),
            Some(Error::ResourceExhausted)
        );

        // Idle slots are still reusable at the cap
        stack.release(3);
        assert_eq!(stack.pop(), Some(4));
        assert_compact(&stack);
    }

    #[test]
    fn test_shed_idle_keeps_largest() {
        let mut stack = Stack::new(growth(4, 16, 16, 64)).unwrap();
        for id in [10, 30, 20] {
            stack.insert(Item::new(id)).unwrap();
        }
        stack.release(0);
        stack.release(0);
        stack.release(0);
        assert_eq!(stack.top() - stack.pos(), 3);

        let shed = stack.shed_idle(1, |item| item.id);
        let mut ids: Vec<_> = shed.iter().map(|item| item.id).collect();
        ids.sort();
        assert_eq!(ids, vec![10, 20]);
        assert_eq!(stack.top(), 1);
        assert_eq!(stack.idle().unwrap().id, 30);
        assert!(stack.max() >= 4);
        assert_compact(&stack);
    }

    #[test]
    fn test_random_sequences_stay_compact() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..32 {
            let mut stack = Stack::new(growth(1, 8, 4, 256)).unwrap();
            let mut busy: Vec<usize> = Vec::new(); // ids of busy items
            let mut next_id = 0;

            for _ in 0..500 {
                if busy.is_empty() || rng.gen_bool(0.55) {
                    let slot = match stack.pop() {
                        Some(slot) => slot,
                        None => {
                            next_id += 1;
                            stack.insert(Item::new(next_id)).unwrap()
                        }
                    };
                    busy.push(stack.get(slot).unwrap().id);
                } else {
                    let id = busy.swap_remove(rng.gen_range(0..busy.len()));
                    let slot = (0..stack.top())
                        .find(|&s| stack.get(s).unwrap().id == id)
                        .unwrap();
                    stack.release(stack.get(slot).unwrap().slot.get());
                }

                // Busy items occupy exactly [0, pos) and idle items exactly [pos, top)
                assert_eq!(stack.pos(), busy.len());
                for slot in 0..stack.pos() {
                    assert!(busy.contains(&stack.get(slot).unwrap().id));
                }
                for slot in stack.pos()..stack.top() {
                    assert!(!busy.contains(&stack.get(slot).unwrap().id));
                }
                assert_compact(&stack);
            }
        }
    }
}
