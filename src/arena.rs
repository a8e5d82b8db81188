//! Generational handles for message elements.
//!
//! A handle names one element for its whole lifetime. Removing an element
//! bumps the generation of its slot, so a handle held after removal never
//! resolves to whatever element reuses the slot later.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ElementHandle {
    pub slot: u32,
    pub generation: u32,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
pub struct ElementArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> ElementArena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, value: T) -> ElementHandle {
        self.len += 1;
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.value = Some(value);
            return ElementHandle {
                slot,
                generation: entry.generation,
            };
        }

        let slot = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        ElementHandle {
            slot,
            generation: 0,
        }
    }

    pub fn remove(&mut self, handle: ElementHandle) -> Option<T> {
        let entry = self.slots.get_mut(handle.slot as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.slot);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, handle: ElementHandle) -> Option<&T> {
        self.slots
            .get(handle.slot as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: ElementHandle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.value.as_mut())
    }

    pub fn contains(&self, handle: ElementHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn clear(&mut self) {
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            if entry.value.take().is_some() {
                entry.generation = entry.generation.wrapping_add(1);
                self.free.push(slot as u32);
            }
        }
        self.len = 0;
    }
}

impl<T> Default for ElementArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Membership index keyed by handle: one generation per slot, nothing else.
///
/// Holds no element data, so forgetting an element only requires the next
/// `retain` pass to drop its slot.
#[derive(Debug, Default)]
pub struct SeenRegistry {
    seen: Vec<Option<u32>>,
    len: usize,
}

impl SeenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, handle: ElementHandle) -> bool {
        self.seen.get(handle.slot as usize).copied().flatten() == Some(handle.generation)
    }

    /// Returns true when the handle was not tracked before.
    pub fn insert(&mut self, handle: ElementHandle) -> bool {
        let slot = handle.slot as usize;
        if slot >= self.seen.len() {
            self.seen.resize(slot + 1, None);
        }
        match self.seen[slot] {
            Some(generation) if generation == handle.generation => false,
            Some(_) => {
                self.seen[slot] = Some(handle.generation);
                true
            }
            None => {
                self.seen[slot] = Some(handle.generation);
                self.len += 1;
                true
            }
        }
    }

    /// Forget every handle that is not in `present`.
    pub fn retain(&mut self, present: &[ElementHandle]) {
        let mut keep = vec![None; self.seen.len()];
        for handle in present {
            if self.contains(*handle) {
                keep[handle.slot as usize] = Some(handle.generation);
            }
        }
        self.len = keep.iter().filter(|entry| entry.is_some()).count();
        self.seen = keep;
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reused_slot_gets_new_generation() {
        let mut arena = ElementArena::new();
        let first = arena.insert("a");
        assert_eq!(arena.remove(first), Some("a"));
        let second = arena.insert("b");

        assert_eq!(first.slot, second.slot);
        assert_ne!(first.generation, second.generation);
        assert_eq!(arena.get(first), None);
        assert_eq!(arena.get(second), Some(&"b"));
        assert_eq!(arena.remove(first), None);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn clear_invalidates_outstanding_handles() {
        let mut arena = ElementArena::new();
        let a = arena.insert(1);
        let b = arena.insert(2);
        arena.clear();
        assert!(arena.is_empty());
        assert!(!arena.contains(a));
        assert!(!arena.contains(b));
    }

    #[test]
    fn registry_treats_new_generation_as_unseen() {
        let mut registry = SeenRegistry::new();
        let old = ElementHandle { slot: 3, generation: 0 };
        let reused = ElementHandle { slot: 3, generation: 1 };

        assert!(registry.insert(old));
        assert!(!registry.insert(old));
        assert!(!registry.contains(reused));
        assert!(registry.insert(reused));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn retain_drops_absent_handles() {
        let mut registry = SeenRegistry::new();
        let a = ElementHandle { slot: 0, generation: 0 };
        let b = ElementHandle { slot: 1, generation: 0 };
        registry.insert(a);
        registry.insert(b);

        registry.retain(&[b]);

        assert!(!registry.contains(a));
        assert!(registry.contains(b));
        assert_eq!(registry.len(), 1);
    }
}
