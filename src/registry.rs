//! The script registry: hash → (published script, bound units).
//!
//! A singly-linked chain of entries over a bounded slab, accessed exclusively
//! on the real-time thread — no locking, and the chain walk is O(n) in the
//! number of registered scripts. Each entry carries an intrusive doubly-linked
//! list of the units bound to its hash so a hot-swap can fan out to every
//! affected unit with O(1) list mutation and no allocation.
//!
//! Freeing is a two-phase protocol: `begin_free` unlinks the entry from the
//! chain and flags it, but the slot itself is only recycled once the last
//! bound unit has gone away. Until then the entry lives off-chain and keeps
//! the unit list intact.

use std::sync::Arc;

use crate::error::WorldError;
use crate::script::ScriptRecord;
use crate::unit::{UnitId, UnitPool};

/// Handle to a registry slot. Stable until the slot is recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u32);

impl EntryId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

pub(crate) struct RegistryEntry {
    pub hash: i32,
    /// The currently published script. `None` between entry creation and the
    /// first successful publication.
    pub script: Option<Arc<ScriptRecord>>,
    /// Head of the intrusive unit list; the links live in the units.
    pub units_head: Option<UnitId>,
    /// Chain link.
    pub next: Option<EntryId>,
    /// Set by `begin_free`; the slot is recycled once the unit list is empty.
    pub should_be_freed: bool,
}

pub(crate) struct Registry {
    slots: Vec<Option<RegistryEntry>>,
    free: Vec<u32>,
    head: Option<EntryId>,
}

impl Registry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity as u32).rev().collect(),
            head: None,
        }
    }

    pub fn get(&self, id: EntryId) -> Option<&RegistryEntry> {
        self.slots.get(id.index())?.as_ref()
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut RegistryEntry> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    /// Walk the chain for `hash`. Entries that have been flagged for free are
    /// off the chain and will not be found, even while units still hold them.
    pub fn find(&self, hash: i32) -> Option<EntryId> {
        let mut current = self.head;
        while let Some(id) = current {
            let entry = self.get(id)?;
            if entry.hash == hash {
                return Some(id);
            }
            current = entry.next;
        }
        None
    }

    /// Return the chain entry for `hash`, allocating a fresh one (null script,
    /// empty unit list) at the head of the chain if the hash is new.
    pub fn insert_or_get(&mut self, hash: i32) -> Result<EntryId, WorldError> {
        if let Some(id) = self.find(hash) {
            return Ok(id);
        }
        let index = self.free.pop().ok_or(WorldError::PoolExhausted {
            what: "registry entry",
        })?;
        let id = EntryId(index);
        self.slots[id.index()] = Some(RegistryEntry {
            hash,
            script: None,
            units_head: None,
            next: self.head,
            should_be_freed: false,
        });
        self.head = Some(id);
        Ok(id)
    }

    /// Replace the entry's published script, returning the displaced one (if
    /// any) so the caller can route it to non-real-time destruction.
    pub fn publish(
        &mut self,
        id: EntryId,
        script: Arc<ScriptRecord>,
    ) -> Option<Arc<ScriptRecord>> {
        let entry = self.get_mut(id)?;
        std::mem::replace(&mut entry.script, Some(script))
    }

    /// First phase of the free protocol: unlink from the chain, flag the
    /// entry, and take the script out for destruction off the audio thread.
    /// The slot itself is recycled immediately when no units are bound.
    pub fn begin_free(&mut self, id: EntryId) -> Option<Arc<ScriptRecord>> {
        self.unlink_chain(id);
        let entry = self.get_mut(id)?;
        entry.should_be_freed = true;
        let script = entry.script.take();
        let empty = entry.units_head.is_none();
        if empty {
            self.release(id);
        }
        script
    }

    /// Second phase: called whenever a unit unlinks, recycles the slot once
    /// the entry is both flagged and unitless.
    pub fn release_if_unused(&mut self, id: EntryId) {
        let ready = matches!(
            self.get(id),
            Some(entry) if entry.should_be_freed && entry.units_head.is_none()
        );
        if ready {
            self.release(id);
        }
    }

    pub fn head(&self) -> Option<EntryId> {
        self.head
    }

    /// All chain entries, head first.
    pub fn chain(&self) -> ChainIter<'_> {
        ChainIter {
            registry: self,
            current: self.head,
        }
    }

    /// Number of occupied slots, including flagged entries that are off the
    /// chain but still have units bound.
    pub fn live_slots(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Link `unit_id` at the head of the entry's unit list.
    pub fn link_unit(&mut self, units: &mut UnitPool, entry_id: EntryId, unit_id: UnitId) {
        let head = match self.get(entry_id) {
            Some(entry) => entry.units_head,
            None => return,
        };
        if let Some(head_id) = head {
            if let Some(head_unit) = units.get_mut(head_id) {
                head_unit.prev = Some(unit_id);
            }
        }
        if let Some(unit) = units.get_mut(unit_id) {
            unit.prev = None;
            unit.next = head;
            unit.entry = Some(entry_id);
        }
        if let Some(entry) = self.get_mut(entry_id) {
            entry.units_head = Some(unit_id);
        }
    }

    /// Remove `unit_id` from the entry's unit list, patching the neighbors.
    pub fn unlink_unit(&mut self, units: &mut UnitPool, entry_id: EntryId, unit_id: UnitId) {
        let (prev, next) = match units.get(unit_id) {
            Some(unit) => (unit.prev, unit.next),
            None => return,
        };
        if let Some(entry) = self.get_mut(entry_id) {
            if entry.units_head == Some(unit_id) {
                entry.units_head = next;
            }
        }
        if let Some(prev_id) = prev {
            if let Some(unit) = units.get_mut(prev_id) {
                unit.next = next;
            }
        }
        if let Some(next_id) = next {
            if let Some(unit) = units.get_mut(next_id) {
                unit.prev = prev;
            }
        }
        if let Some(unit) = units.get_mut(unit_id) {
            unit.prev = None;
            unit.next = None;
            unit.entry = None;
        }
    }

    fn unlink_chain(&mut self, id: EntryId) {
        let target_next = match self.get(id) {
            Some(entry) => entry.next,
            None => return,
        };
        if self.head == Some(id) {
            self.head = target_next;
            return;
        }
        let mut current = self.head;
        while let Some(current_id) = current {
            let next = match self.get(current_id) {
                Some(entry) => entry.next,
                None => return,
            };
            if next == Some(id) {
                if let Some(entry) = self.get_mut(current_id) {
                    entry.next = target_next;
                }
                return;
            }
            current = next;
        }
    }

    fn release(&mut self, id: EntryId) {
        if let Some(slot) = self.slots.get_mut(id.index()) {
            if slot.take().is_some() {
                self.free.push(id.0);
            }
        }
    }
}

pub(crate) struct ChainIter<'a> {
    registry: &'a Registry,
    current: Option<EntryId>,
}

impl Iterator for ChainIter<'_> {
    type Item = EntryId;

    fn next(&mut self) -> Option<EntryId> {
        let id = self.current?;
        self.current = self.registry.get(id)?.next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::UnitStub;
    use crate::unit::{GeneratorUnit, UnitConfig};

    fn script(sample: &str) -> Arc<ScriptRecord> {
        Arc::new(ScriptRecord::parse(sample, Vec::new()).unwrap())
    }

    fn unit(id: UnitId) -> GeneratorUnit {
        GeneratorUnit::new(&UnitConfig::default(), UnitStub::new(id))
    }

    #[test]
    fn insert_or_get_reuses_entries() {
        let mut registry = Registry::with_capacity(4);
        let first = registry.insert_or_get(42).unwrap();
        let second = registry.insert_or_get(42).unwrap();
        assert_eq!(first, second);
        assert_ne!(registry.insert_or_get(7).unwrap(), first);
        assert_eq!(registry.chain().count(), 2);
    }

    #[test]
    fn publish_returns_the_displaced_script() {
        let mut registry = Registry::with_capacity(4);
        let id = registry.insert_or_get(1).unwrap();
        assert!(registry.publish(id, script("out0 = 1")).is_none());
        let old = registry.publish(id, script("out0 = 2")).unwrap();
        assert_eq!(old.sections().sample, "out0 = 1");
    }

    #[test]
    fn begin_free_recycles_empty_entries_immediately() {
        let mut registry = Registry::with_capacity(2);
        let id = registry.insert_or_get(1).unwrap();
        registry.publish(id, script("out0 = 1"));
        let taken = registry.begin_free(id);
        assert!(taken.is_some());
        assert_eq!(registry.find(1), None);
        assert_eq!(registry.live_slots(), 0);
    }

    #[test]
    fn flagged_entry_with_units_stays_allocated() {
        let mut registry = Registry::with_capacity(2);
        let mut units = UnitPool::with_capacity(2);
        let entry = registry.insert_or_get(1).unwrap();
        let unit_id = units.insert_with(unit).unwrap();
        registry.link_unit(&mut units, entry, unit_id);

        registry.begin_free(entry);
        assert_eq!(registry.find(1), None);
        assert_eq!(registry.live_slots(), 1);

        registry.unlink_unit(&mut units, entry, unit_id);
        registry.release_if_unused(entry);
        assert_eq!(registry.live_slots(), 0);
    }

    #[test]
    fn unit_list_links_are_patched() {
        let mut registry = Registry::with_capacity(2);
        let mut units = UnitPool::with_capacity(4);
        let entry = registry.insert_or_get(1).unwrap();
        let a = units.insert_with(unit).unwrap();
        let b = units.insert_with(unit).unwrap();
        let c = units.insert_with(unit).unwrap();
        registry.link_unit(&mut units, entry, a);
        registry.link_unit(&mut units, entry, b);
        registry.link_unit(&mut units, entry, c);

        // Head insertion: list order is c, b, a
        assert_eq!(registry.get(entry).unwrap().units_head, Some(c));

        // Remove the middle element
        registry.unlink_unit(&mut units, entry, b);
        assert_eq!(units.get(c).unwrap().next, Some(a));
        assert_eq!(units.get(a).unwrap().prev, Some(c));

        registry.unlink_unit(&mut units, entry, c);
        assert_eq!(registry.get(entry).unwrap().units_head, Some(a));
        assert_eq!(units.get(a).unwrap().prev, None);
    }
}
