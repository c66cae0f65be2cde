//! Descriptor dedup cache: an in-memory mirror of every live security cell,
//! bucketed by a checksum of the canonical descriptor bytes (the conv key).
//! The store consults it before allocating a cell so identical descriptors
//! share storage; lookups compare full bytes, the conv key only picks the
//! bucket. Cells dedup within a storage class only, since volatile cells
//! vanish on reload.

use std::collections::HashMap;

use tracing::trace;

use crate::cells::{CellIndex, CellType};

#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub conv_key: u32,
    pub cell_type: CellType,
    pub descriptor: Vec<u8>,
}

pub struct SecurityCache {
    buckets: Vec<Vec<CellIndex>>,
    by_cell: HashMap<CellIndex, CacheEntry>,
}

/// Checksum of canonical descriptor bytes; selects the dedup bucket.
pub fn conv_key(descriptor: &[u8]) -> u32 {
    crc32fast::hash(descriptor)
}

impl SecurityCache {
    pub fn new(bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        Self {
            buckets: vec![Vec::new(); bucket_count],
            by_cell: HashMap::new(),
        }
    }

    fn bucket_of(&self, key: u32) -> usize {
        key as usize % self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.by_cell.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_cell.is_empty()
    }

    pub fn get(&self, cell: CellIndex) -> Option<&CacheEntry> {
        self.by_cell.get(&cell)
    }

    /// Entry for a security cell a node currently references. A node
    /// pointing at a cell the cache does not know is corrupt state, not an
    /// error the caller can handle.
    pub fn entry(&self, cell: CellIndex) -> &CacheEntry {
        match self.by_cell.get(&cell) {
            Some(e) => e,
            None => panic!("security cache has no entry for referenced cell {}", cell),
        }
    }

    pub fn insert(&mut self, cell: CellIndex, cell_type: CellType, descriptor: Vec<u8>) {
        let key = conv_key(&descriptor);
        trace!(target: "regvault::cache", "insert: cell={} key={:#x}", cell, key);
        let bucket = self.bucket_of(key);
        self.buckets[bucket].push(cell);
        let old = self.by_cell.insert(cell, CacheEntry { conv_key: key, cell_type, descriptor });
        debug_assert!(old.is_none(), "cache already held {}", cell);
    }

    pub fn remove(&mut self, cell: CellIndex) {
        if let Some(entry) = self.by_cell.remove(&cell) {
            trace!(target: "regvault::cache", "remove: cell={} key={:#x}", cell, entry.conv_key);
            let bucket = self.bucket_of(entry.conv_key);
            self.buckets[bucket].retain(|c| *c != cell);
        }
    }

    /// Find a live cell of the same storage class holding exactly these
    /// descriptor bytes. Scans one bucket; candidates with a colliding conv
    /// key are rejected by the byte comparison.
    pub fn find_matching(&self, descriptor: &[u8], cell_type: CellType) -> Option<CellIndex> {
        let key = conv_key(descriptor);
        let bucket = self.bucket_of(key);
        for cell in &self.buckets[bucket] {
            let entry = &self.by_cell[cell];
            if entry.conv_key == key
                && entry.cell_type == cell_type
                && entry.descriptor == descriptor
            {
                return Some(*cell);
            }
        }
        None
    }

    /// The descriptor bytes of `cell` changed without the cell moving.
    /// Rehashes, so the entry may migrate to another bucket.
    pub fn rewrite_in_place(&mut self, cell: CellIndex, descriptor: Vec<u8>) {
        let entry = match self.by_cell.get_mut(&cell) {
            Some(e) => e,
            None => panic!("rewrite of cell {} the cache does not hold", cell),
        };
        let old_key = entry.conv_key;
        let new_key = conv_key(&descriptor);
        entry.conv_key = new_key;
        entry.descriptor = descriptor;
        if self.bucket_of(old_key) != self.bucket_of(new_key) {
            let (from, to) = (self.bucket_of(old_key), self.bucket_of(new_key));
            self.buckets[from].retain(|c| *c != cell);
            self.buckets[to].push(cell);
        }
        trace!(target: "regvault::cache", "rewrite: cell={} key {:#x} -> {:#x}", cell, old_key, new_key);
    }

    /// The cell behind an entry relocated to a new index; bytes unchanged.
    pub fn relocate(&mut self, old: CellIndex, new: CellIndex) {
        let entry = match self.by_cell.remove(&old) {
            Some(e) => e,
            None => panic!("relocation of cell {} the cache does not hold", old),
        };
        trace!(target: "regvault::cache", "relocate: {} -> {}", old, new);
        let bucket = self.bucket_of(entry.conv_key);
        for slot in self.buckets[bucket].iter_mut() {
            if *slot == old {
                *slot = new;
            }
        }
        self.by_cell.insert(new, entry);
    }

    pub fn cells(&self) -> impl Iterator<Item = (CellIndex, &CacheEntry)> {
        self.by_cell.iter().map(|(c, e)| (*c, e))
    }
}
