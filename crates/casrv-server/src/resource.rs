//! Id-keyed, insertion-ordered resource table.
//!
//! The table is the single owner of a session's channels. Lookup by the
//! client's id goes through a hash index into an ordered map, so iteration
//! follows creation order without a second list holding the same objects.

use std::collections::{BTreeMap, HashMap};

/// Resources keyed by a client-chosen 32-bit id.
#[derive(Debug)]
pub struct ResourceTable<T> {
    entries: BTreeMap<u64, T>,
    index: HashMap<u32, u64>,
    next_seq: u64,
}

impl<T> ResourceTable<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Add `item` under `id`. An id already in use hands the item back.
    pub fn insert(&mut self, id: u32, item: T) -> Result<(), T> {
        if self.index.contains_key(&id) {
            return Err(item);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(id, seq);
        self.entries.insert(seq, item);
        Ok(())
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        let seq = self.index.get(&id)?;
        self.entries.get(seq)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        let seq = self.index.get(&id)?;
        self.entries.get_mut(seq)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.index.contains_key(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        let seq = self.index.remove(&id)?;
        self.entries.remove(&seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.values_mut()
    }

    /// Remove every entry, returning them in insertion order.
    pub fn drain(&mut self) -> Vec<T> {
        self.index.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

impl<T> Default for ResourceTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
