//! Generational slot arena.
//!
//! Objects are stored in slots addressed by a handle carrying the slot index
//! and the slot generation at insertion time. Removing an object bumps the
//! slot generation, so stale handles resolve to `None` instead of aliasing
//! whatever object reuses the slot.

use std::marker::PhantomData;

/// A typed arena handle.
pub trait Handle: Copy + Eq + std::hash::Hash + std::fmt::Debug {
    /// Builds a handle from raw parts.
    fn from_parts(index: u32, generation: u32) -> Self;

    /// Slot index.
    fn index(&self) -> u32;

    /// Slot generation the handle was issued for.
    fn generation(&self) -> u32;
}

#[derive(Debug, Clone)]
enum Slot<T> {
    Occupied { generation: u32, value: T },
    Free { generation: u32 },
}

impl<T> Slot<T> {
    fn generation(&self) -> u32 {
        match self {
            Slot::Occupied { generation, .. } | Slot::Free { generation } => *generation,
        }
    }
}

/// Arena storing `T` values keyed by handles of type `H`.
///
/// Iteration order is slot index order, which is stable for the lifetime of
/// an object.
#[derive(Debug, Clone)]
pub struct Arena<H, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    _handle: PhantomData<H>,
}

impl<H: Handle, T> Default for Arena<H, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Handle, T> Arena<H, T> {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            _handle: PhantomData,
        }
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no objects are live.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots ever allocated (live plus tombstoned).
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Inserts a value, reusing the lowest freed slot when available.
    pub fn insert(&mut self, value: T) -> H {
        self.len += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = slot.generation();
            *slot = Slot::Occupied { generation, value };
            return H::from_parts(index, generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        H::from_parts(index, 0)
    }

    /// Inserts a value built from its own handle.
    pub fn insert_with(&mut self, build: impl FnOnce(H) -> T) -> H {
        let (index, generation) = match self.free.last() {
            Some(&index) => (index, self.slots[index as usize].generation()),
            None => (self.slots.len() as u32, 0),
        };
        let handle = H::from_parts(index, generation);
        let inserted = self.insert(build(handle));
        debug_assert_eq!(inserted, handle);
        inserted
    }

    /// Removes and returns the value, tombstoning the slot.
    pub fn remove(&mut self, handle: H) -> Option<T> {
        let slot = self.slots.get_mut(handle.index() as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation() => {
                let next = Slot::Free {
                    generation: generation.wrapping_add(1),
                };
                let old = std::mem::replace(slot, next);
                self.free.push(handle.index());
                self.len -= 1;
                match old {
                    Slot::Occupied { value, .. } => Some(value),
                    Slot::Free { .. } => None,
                }
            }
            _ => None,
        }
    }

    /// Returns true if the handle still refers to a live object.
    pub fn contains(&self, handle: H) -> bool {
        self.get(handle).is_some()
    }

    /// Resolves a handle.
    pub fn get(&self, handle: H) -> Option<&T> {
        match self.slots.get(handle.index() as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation() => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Resolves a handle mutably.
    pub fn get_mut(&mut self, handle: H) -> Option<&mut T> {
        match self.slots.get_mut(handle.index() as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation() => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Resolves two distinct handles mutably at once.
    pub fn get2_mut(&mut self, a: H, b: H) -> Option<(&mut T, &mut T)> {
        if a.index() == b.index() {
            return None;
        }
        if !self.contains(a) || !self.contains(b) {
            return None;
        }

        let (ai, bi) = (a.index() as usize, b.index() as usize);
        let (lo, hi) = if ai < bi { (ai, bi) } else { (bi, ai) };
        let (head, tail) = self.slots.split_at_mut(hi);
        let (lo_slot, hi_slot) = (&mut head[lo], &mut tail[0]);

        let (Slot::Occupied { value: lo_val, .. }, Slot::Occupied { value: hi_val, .. }) =
            (lo_slot, hi_slot)
        else {
            return None;
        };

        if ai < bi {
            Some((lo_val, hi_val))
        } else {
            Some((hi_val, lo_val))
        }
    }

    /// Iterates live objects in slot order, skipping tombstones.
    pub fn iter(&self) -> impl Iterator<Item = (H, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => {
                    Some((H::from_parts(index as u32, *generation), value))
                }
                Slot::Free { .. } => None,
            })
    }

    /// Iterates live objects mutably in slot order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (H, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => {
                    Some((H::from_parts(index as u32, *generation), value))
                }
                Slot::Free { .. } => None,
            })
    }

    /// Handles of all live objects, in slot order.
    pub fn handles(&self) -> Vec<H> {
        self.iter().map(|(h, _)| h).collect()
    }

    /// Number of tombstoned slots.
    pub fn tombstones(&self) -> usize {
        self.slots.len() - self.len
    }

    /// Removes every object for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(H, &T) -> bool) -> Vec<T> {
        let doomed: Vec<H> = self
            .iter()
            .filter(|(h, v)| !keep(*h, v))
            .map(|(h, _)| h)
            .collect();
        doomed.into_iter().filter_map(|h| self.remove(h)).collect()
    }
}
