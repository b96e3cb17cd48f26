//! In-memory `legacy_id -> new_id` mapping plus per-table id allocation.

use std::collections::{HashMap, HashSet};

use super::entity::{Entity, IdRange, ImportRef, PRIVATE_OFFSET};

#[derive(Debug, Default)]
pub struct IdRegistry {
    maps: HashMap<Entity, HashMap<i64, i64>>,
    next_ids: HashMap<&'static str, i64>,
}

impl IdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&self, entity: Entity, legacy_id: i64) -> Option<i64> {
        self.maps.get(&entity)?.get(&legacy_id).copied()
    }

    pub fn contains(&self, entity: Entity, legacy_id: i64) -> bool {
        self.map(entity, legacy_id).is_some()
    }

    /// Record a mapping. Existing entries are never overwritten; returns false
    /// when the legacy id was already mapped.
    pub fn insert(&mut self, entity: Entity, legacy_id: i64, new_id: i64) -> bool {
        let map = self.maps.entry(entity).or_default();
        if map.contains_key(&legacy_id) {
            return false;
        }
        map.insert(legacy_id, new_id);
        true
    }

    pub fn insert_ref(&mut self, r: &ImportRef) -> bool {
        self.insert(r.entity, r.legacy_id, r.new_id)
    }

    /// Drop entries whose rows never reached the destination.
    pub fn forget(&mut self, refs: &[ImportRef]) {
        for r in refs {
            if let Some(map) = self.maps.get_mut(&r.entity) {
                if map.get(&r.legacy_id) == Some(&r.new_id) {
                    map.remove(&r.legacy_id);
                }
            }
        }
    }

    /// Seed a table's allocator from its pre-run maximum id. Never moves backwards.
    pub fn seed_table(&mut self, table: &'static str, max_id: i64) {
        let next = max_id.max(0) + 1;
        let slot = self.next_ids.entry(table).or_insert(next);
        if *slot < next {
            *slot = next;
        }
    }

    pub fn allocate(&mut self, table: &'static str) -> i64 {
        let slot = self.next_ids.entry(table).or_insert(1);
        let id = *slot;
        *slot += 1;
        id
    }

    pub fn allocate_for(&mut self, entity: Entity) -> i64 {
        self.allocate(entity.table())
    }

    /// Highest allocated id for a table, if anything was allocated or seeded.
    pub fn last_allocated(&self, table: &str) -> Option<i64> {
        self.next_ids.get(table).map(|n| n - 1).filter(|&n| n > 0)
    }

    /// Highest mapped legacy id in a range. Private marks are reported without the offset.
    pub fn high_water(&self, entity: Entity, range: IdRange) -> Option<i64> {
        let max = self
            .maps
            .get(&entity)?
            .keys()
            .copied()
            .filter(|&id| IdRange::of(id) == range)
            .max()?;
        Some(match range {
            IdRange::Public => max,
            IdRange::Private => max - PRIVATE_OFFSET,
        })
    }

    /// Snapshot of the legacy ids already mapped for an entity.
    pub fn legacy_ids(&self, entity: Entity) -> HashSet<i64> {
        self.maps
            .get(&entity)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, entity: Entity) -> usize {
        self.maps.get(&entity).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.maps.values().all(HashMap::is_empty)
    }
}
