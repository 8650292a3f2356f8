//! Fixed-capacity pools of reusable objects.
//!
//! A [`Pool`] pre-allocates every slot at construction and hands out indices
//! ([`SlotId`]) rather than references, so the objects keep their identity (and
//! their allocations) for the whole run. Free indices live in a stack; acquiring
//! from an empty stack returns [`Acquire::Exhausted`] immediately so that the
//! caller can apply backpressure instead of waiting.
//!
//! A pool belongs to exactly one executor shard and is never shared, which is why
//! there is no synchronization anywhere in this module.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ContractViolation;

/// Index of a slot inside a [`Pool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(u32);

impl SlotId {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of [`Pool::acquire`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    /// A free slot was handed out.
    Acquired(SlotId),
    /// Every slot is in use; callers should treat this as backpressure.
    Exhausted,
}

impl Acquire {
    pub fn slot(self) -> Option<SlotId> {
        match self {
            Acquire::Acquired(slot) => Some(slot),
            Acquire::Exhausted => None,
        }
    }
}

/// Objects that can be recycled by a [`Pool`].
///
/// `reset` is called when the slot is released and must bring the object back to
/// the state it had right after construction, keeping its allocations.
pub trait Reset {
    fn reset(&mut self);
}

/// Bounded pool with an explicit free list.
pub struct Pool<T> {
    slots: Vec<T>,
    free: Vec<u32>,
    in_use: Vec<bool>,
    min_used: usize,
    max_used: usize,
}

impl<T: Reset> Pool<T> {
    /// Allocates `capacity` slots using `init`.
    pub fn new(capacity: usize, mut init: impl FnMut(SlotId) -> T) -> Self {
        let slots = (0..capacity as u32).map(|i| init(SlotId(i))).collect();
        Self {
            slots,
            // lowest index on top so that slots are handed out in order
            free: (0..capacity as u32).rev().collect(),
            in_use: vec![false; capacity],
            min_used: 0,
            max_used: 0,
        }
    }

    /// Takes a free slot, never blocking.
    pub fn acquire(&mut self) -> Acquire {
        match self.free.pop() {
            Some(index) => {
                self.in_use[index as usize] = true;
                let used = self.outstanding();
                self.max_used = self.max_used.max(used);
                Acquire::Acquired(SlotId(index))
            }
            None => Acquire::Exhausted,
        }
    }

    /// Resets the slot's object and makes it available to the next [`Pool::acquire`].
    ///
    /// Releasing a slot that is not currently acquired is a contract violation:
    /// it would let two owners share one object.
    pub fn release(&mut self, slot: SlotId) -> Result<(), ContractViolation> {
        let index = slot.index();
        match self.in_use.get(index) {
            None => Err(ContractViolation::SlotOutOfRange {
                slot,
                capacity: self.capacity(),
            }),
            Some(false) => Err(ContractViolation::DoubleRelease(slot)),
            Some(true) => {
                self.in_use[index] = false;
                self.slots[index].reset();
                self.free.push(slot.0);
                self.min_used = self.min_used.min(self.outstanding());
                Ok(())
            }
        }
    }
}

impl<T> Pool<T> {
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently acquired.
    pub fn outstanding(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn is_acquired(&self, slot: SlotId) -> bool {
        self.in_use.get(slot.index()).copied().unwrap_or(false)
    }

    /// The object of an acquired slot. Free slots are not accessible.
    pub fn get(&self, slot: SlotId) -> Option<&T> {
        if self.is_acquired(slot) {
            self.slots.get(slot.index())
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut T> {
        if self.is_acquired(slot) {
            self.slots.get_mut(slot.index())
        } else {
            None
        }
    }

    /// Acquired slots in index order.
    pub fn acquired(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.in_use
            .iter()
            .zip(self.slots.iter())
            .enumerate()
            .filter(|(_, (used, _))| **used)
            .map(|(i, (_, slot))| (SlotId(i as u32), slot))
    }

    /// Lowest number of outstanding slots since the last [`Pool::reset_stats`].
    pub fn min_used(&self) -> usize {
        self.min_used
    }

    /// Highest number of outstanding slots since the last [`Pool::reset_stats`].
    pub fn max_used(&self) -> usize {
        self.max_used
    }

    pub fn reset_stats(&mut self) {
        let current = self.outstanding();
        self.min_used = current;
        self.max_used = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Item {
        id: u32,
        dirty: bool,
        resets: u32,
    }

    impl Reset for Item {
        fn reset(&mut self) {
            self.dirty = false;
            self.resets += 1;
        }
    }

    fn pool(capacity: usize) -> Pool<Item> {
        Pool::new(capacity, |slot| Item {
            id: slot.index() as u32,
            ..Default::default()
        })
    }

    #[test]
    fn acquire_until_exhausted() {
        let mut pool = pool(3);
        let slots: Vec<_> = (0..3).map(|_| pool.acquire()).collect();
        assert_eq!(
            slots,
            vec![
                Acquire::Acquired(SlotId(0)),
                Acquire::Acquired(SlotId(1)),
                Acquire::Acquired(SlotId(2))
            ]
        );
        assert_eq!(pool.acquire(), Acquire::Exhausted);
        assert_eq!(pool.outstanding(), 3);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn release_resets_and_preserves_identity() {
        let mut pool = pool(2);
        let slot = pool.acquire().slot().unwrap();
        pool.get_mut(slot).unwrap().dirty = true;
        pool.release(slot).unwrap();

        let again = pool.acquire().slot().unwrap();
        assert_eq!(again, slot);
        let item = pool.get(again).unwrap();
        assert_eq!(item.id, slot.index() as u32);
        assert!(!item.dirty);
        assert_eq!(item.resets, 1);
    }

    #[test]
    fn double_release_is_reported() {
        let mut pool = pool(2);
        let slot = pool.acquire().slot().unwrap();
        pool.release(slot).unwrap();
        assert_eq!(
            pool.release(slot),
            Err(ContractViolation::DoubleRelease(slot))
        );
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn release_without_acquire_is_reported() {
        let mut pool = pool(2);
        assert_eq!(
            pool.release(SlotId(1)),
            Err(ContractViolation::DoubleRelease(SlotId(1)))
        );
        assert_eq!(
            pool.release(SlotId(7)),
            Err(ContractViolation::SlotOutOfRange {
                slot: SlotId(7),
                capacity: 2
            })
        );
    }

    #[test]
    fn free_slots_are_not_accessible() {
        let mut pool = pool(2);
        assert!(pool.get(SlotId(0)).is_none());
        let slot = pool.acquire().slot().unwrap();
        assert!(pool.get(slot).is_some());
        assert_eq!(pool.acquired().map(|(s, _)| s).collect::<Vec<_>>(), vec![slot]);
    }

    #[test]
    fn usage_watermarks() {
        let mut pool = pool(4);
        let a = pool.acquire().slot().unwrap();
        let b = pool.acquire().slot().unwrap();
        let c = pool.acquire().slot().unwrap();
        assert_eq!(pool.max_used(), 3);
        assert_eq!(pool.min_used(), 0);

        pool.reset_stats();
        assert_eq!((pool.min_used(), pool.max_used()), (3, 3));
        pool.release(a).unwrap();
        pool.release(b).unwrap();
        assert_eq!((pool.min_used(), pool.max_used()), (1, 3));
        pool.release(c).unwrap();
        assert_eq!(pool.min_used(), 0);
    }

    #[test]
    fn zero_capacity_is_always_exhausted() {
        let mut pool = pool(0);
        assert_eq!(pool.acquire(), Acquire::Exhausted);
    }
}
