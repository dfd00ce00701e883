// Generation-checked handles and handle pools
//
// Handles replace direct object references everywhere in the backend: a stable
// slot index plus a generation that is bumped on every slot reuse, so a stale
// handle is detectable instead of silently aliasing a new resource.

use std::fmt;
use std::marker::PhantomData;

/// Typed, generation-checked reference into a [`HandlePool`].
///
/// Generation 0 is the invalid sentinel; live slots always carry a non-zero
/// generation.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub const INVALID: Self = Self {
        index: u32::MAX,
        generation: 0,
        _marker: PhantomData,
    };

    pub fn is_valid(&self) -> bool {
        self.generation != 0
    }

    pub(crate) fn index(&self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}
impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Handle({}v{})", self.index, self.generation)
        } else {
            write!(f, "Handle(invalid)")
        }
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::INVALID
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Stable-index store with O(1) generation-checked lookup.
///
/// Removal bumps the slot generation immediately, so every outstanding handle
/// to the removed entry fails the check even before the slot is reused.
pub struct HandlePool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Default for HandlePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandlePool<T> {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new() }
    }

    pub fn add(&mut self, value: T) -> Handle<T> {
        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert!(slot.value.is_none());
                slot.value = Some(value);
                index
            }
            None => {
                self.slots.push(Slot { generation: 1, value: Some(value) });
                (self.slots.len() - 1) as u32
            }
        };

        Handle {
            index,
            generation: self.slots[index as usize].generation,
            _marker: PhantomData,
        }
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Remove an entry; the slot is invalidated for all outstanding handles
    /// and queued for reuse. Returns `None` for stale or invalid handles.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(handle.index);
        Some(value)
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value.as_ref().map(|v| {
                (
                    Handle { index: i as u32, generation: slot.generation, _marker: PhantomData },
                    v,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(|slot| slot.value.as_mut())
    }

    /// Drain every live entry; used for the forced teardown at shutdown.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1).max(1);
                self.free.push(i as u32);
                out.push(value);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_strictly_between_add_and_remove() {
        let mut pool = HandlePool::new();
        let h = pool.add(42u32);
        assert!(h.is_valid());
        assert_eq!(pool.get(h), Some(&42));

        assert_eq!(pool.remove(h), Some(42));
        assert_eq!(pool.get(h), None);
        assert_eq!(pool.remove(h), None); // idempotent
    }

    #[test]
    fn slot_reuse_bumps_generation() {
        let mut pool = HandlePool::new();
        let a = pool.add(1u32);
        pool.remove(a);

        let b = pool.add(2u32);
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert_eq!(pool.get(a), None);
        assert_eq!(pool.get(b), Some(&2));
    }

    #[test]
    fn invalid_sentinel_never_resolves() {
        let mut pool = HandlePool::<u32>::new();
        pool.add(7);
        assert_eq!(pool.get(Handle::INVALID), None);
        assert!(!Handle::<u32>::INVALID.is_valid());
    }

    #[test]
    fn distinct_handles_for_identical_values() {
        let mut pool = HandlePool::new();
        let a = pool.add([1u8; 4]);
        let b = pool.add([1u8; 4]);
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
    }
}
