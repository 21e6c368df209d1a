//! Generation-checked session table.
//!
//! Sessions refer to each other by [`SessionId`]. An id stays valid only
//! while its slot holds the same generation, so a slot that is freed and
//! reused never answers to an id handed out for the previous occupant.

use serde::Serialize;
use std::fmt;

/// Opaque handle to a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId {
    index: u32,
    generation: u32,
}

impl SessionId {
    #[cfg(test)]
    pub(crate) fn from_raw(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Master/child links every stored session exposes to the registry.
pub trait Linked {
    fn master(&self) -> Option<SessionId>;
    fn set_master(&mut self, master: Option<SessionId>);
    fn deallocated_master(&self) -> Option<SessionId>;
    fn set_deallocated_master(&mut self, id: Option<SessionId>);
}

struct Slot<S> {
    generation: u32,
    value: Option<S>,
}

pub struct Registry<S> {
    slots: Vec<Slot<S>>,
    free: Vec<u32>,
    len: usize,
    capacity: usize,
}

impl<S: Linked> Registry<S> {
    pub fn new() -> Self {
        Self::with_capacity_limit(usize::MAX)
    }

    /// Registry refusing inserts beyond `capacity` live sessions.
    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    pub fn capacity_limit(&self) -> usize {
        self.capacity
    }

    /// Registers a session; gives it back when the table is full.
    pub fn insert(&mut self, value: S) -> Result<SessionId, S> {
        if self.is_full() {
            return Err(value);
        }
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Ok(SessionId {
                index,
                generation: slot.generation,
            });
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Ok(SessionId {
            index,
            generation: 0,
        })
    }

    /// Unregisters a session.
    ///
    /// Every survivor whose master is `id` loses that link and remembers `id`
    /// as its deallocated master instead.
    pub fn remove(&mut self, id: SessionId) -> Option<S> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;

        for survivor in self.slots.iter_mut().filter_map(|s| s.value.as_mut()) {
            if survivor.master() == Some(id) {
                survivor.set_master(None);
                survivor.set_deallocated_master(Some(id));
            }
        }
        Some(value)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: SessionId) -> Option<&S> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut S> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Snapshot of live ids, safe to walk while sessions are removed.
    pub fn ids(&self) -> Vec<SessionId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(index, slot)| SessionId {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SessionId, &S)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    SessionId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }
}

impl<S: Linked> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}
