//! In-memory cell arena: slot vector plus free list, stable u32 indices.
//! Models the contract of the persisted cell allocator: allocation and
//! dirty-marking can fail (resource exhaustion), reads of a live cell can
//! in principle fail to map, and multi-cell operations pin every cell they
//! touch until they finish. Test code can cap the allocation and
//! dirty-mark budgets to drive the failure paths deterministically.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use tracing::trace;

use super::{CellIndex, CellType};

struct Slot {
    ty: CellType,
    dirty: bool,
    data: Vec<u8>,
}

pub struct CellArena {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// Outstanding pin counts, kept apart from slots so a pinned cell can
    /// be freed mid-operation and still released by its tracker afterwards.
    pins: HashMap<u32, u32>,
    /// While true, `release` is a no-op; see `suspend_release`.
    release_suspended: bool,
    alloc_budget: Option<usize>,
    dirty_budget: Option<usize>,
}

impl CellArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            pins: HashMap::new(),
            release_suspended: false,
            alloc_budget: None,
            dirty_budget: None,
        }
    }

    /// Cap the number of future allocations (including reallocations).
    /// `None` removes the cap.
    pub fn set_alloc_budget(&mut self, budget: Option<usize>) {
        self.alloc_budget = budget;
    }

    /// Cap the number of future successful dirty marks. `None` removes it.
    pub fn set_dirty_budget(&mut self, budget: Option<usize>) {
        self.dirty_budget = budget;
    }

    pub fn allocate(&mut self, size: usize, ty: CellType) -> Option<CellIndex> {
        if let Some(b) = self.alloc_budget.as_mut() {
            if *b == 0 {
                return None;
            }
            *b -= 1;
        }
        let slot = Slot { ty, dirty: true, data: vec![0u8; size] };
        let idx = match self.free.pop() {
            Some(i) => {
                self.slots[i as usize] = Some(slot);
                i
            }
            None => {
                self.slots.push(Some(slot));
                (self.slots.len() - 1) as u32
            }
        };
        trace!(target: "regvault::cells", "allocate: index={} size={} ty={:?}", idx, size, ty);
        Some(CellIndex(idx))
    }

    /// Resize a cell. Always relocates to a fresh index so callers must
    /// handle relocation; the old index is freed on success.
    pub fn reallocate(&mut self, index: CellIndex, new_size: usize) -> Option<CellIndex> {
        let ty = self.cell_type(index)?;
        let new = self.allocate(new_size, ty)?;
        let copy_len = {
            let old = self.slot(index)?;
            old.data.len().min(new_size)
        };
        let src: Vec<u8> = self.slot(index)?.data[..copy_len].to_vec();
        self.slot_mut(new)?.data[..copy_len].copy_from_slice(&src);
        self.free_cell(index);
        trace!(target: "regvault::cells", "reallocate: {} -> {} size={}", index, new, new_size);
        Some(new)
    }

    pub fn free_cell(&mut self, index: CellIndex) {
        if let Some(slot) = self.slots.get_mut(index.0 as usize) {
            if slot.take().is_some() {
                self.free.push(index.0);
                trace!(target: "regvault::cells", "free: {}", index);
            }
        }
    }

    pub fn get(&self, index: CellIndex) -> Option<&[u8]> {
        self.slot(index).map(|s| s.data.as_slice())
    }

    pub fn get_mut(&mut self, index: CellIndex) -> Option<&mut [u8]> {
        self.slot_mut(index).map(|s| s.data.as_mut_slice())
    }

    /// Mark a cell dirty so the paging layer will write it back. Returns
    /// false on log-space exhaustion.
    pub fn mark_dirty(&mut self, index: CellIndex) -> bool {
        if self.slot(index).is_none() {
            return false;
        }
        if let Some(b) = self.dirty_budget.as_mut() {
            if *b == 0 {
                return false;
            }
            *b -= 1;
        }
        if let Some(s) = self.slot_mut(index) {
            s.dirty = true;
        }
        true
    }

    pub fn is_dirty(&self, index: CellIndex) -> bool {
        self.slot(index).map(|s| s.dirty).unwrap_or(false)
    }

    pub fn cell_type(&self, index: CellIndex) -> Option<CellType> {
        self.slot(index).map(|s| s.ty)
    }

    pub fn is_live(&self, index: CellIndex) -> bool {
        self.slot(index).is_some()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn pin(&mut self, index: CellIndex) {
        *self.pins.entry(index.0).or_insert(0) += 1;
    }

    /// Drop one pin. A no-op while releases are suspended (see
    /// `suspend_release`), which is how a subtree walk keeps every visited
    /// cell pinned for its whole duration.
    pub fn release(&mut self, index: CellIndex) {
        if self.release_suspended {
            return;
        }
        self.release_one(index);
    }

    fn release_one(&mut self, index: CellIndex) {
        if let Some(n) = self.pins.get_mut(&index.0) {
            *n -= 1;
            if *n == 0 {
                self.pins.remove(&index.0);
            }
        }
    }

    pub fn pinned_count(&self) -> usize {
        self.pins.values().map(|n| *n as usize).sum()
    }

    /// Clear every dirty flag and return the cells that were dirty, in
    /// index order. The flush path writes these back.
    pub fn take_dirty(&mut self) -> Vec<CellIndex> {
        let mut out = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(s) = slot {
                if s.dirty {
                    s.dirty = false;
                    out.push(CellIndex(i as u32));
                }
            }
        }
        out
    }

    /// Disable per-cell release until the returned guard drops. The guard
    /// snapshots the pin set and restores it exactly, so pins taken during
    /// the suspension window are released on every exit path, early
    /// failure included.
    pub fn suspend_release(&mut self) -> SuspendedRelease<'_> {
        let saved = self.pins.clone();
        self.release_suspended = true;
        SuspendedRelease { arena: self, saved }
    }

    fn slot(&self, index: CellIndex) -> Option<&Slot> {
        self.slots.get(index.0 as usize)?.as_ref()
    }

    fn slot_mut(&mut self, index: CellIndex) -> Option<&mut Slot> {
        self.slots.get_mut(index.0 as usize)?.as_mut()
    }
}

impl Default for CellArena {
    fn default() -> Self {
        Self::new()
    }
}

/// Arena view with releases suspended; dropping it restores the pin set
/// captured at suspension time and re-enables releases.
pub struct SuspendedRelease<'a> {
    arena: &'a mut CellArena,
    saved: HashMap<u32, u32>,
}

impl Deref for SuspendedRelease<'_> {
    type Target = CellArena;
    fn deref(&self) -> &CellArena {
        self.arena
    }
}

impl DerefMut for SuspendedRelease<'_> {
    fn deref_mut(&mut self) -> &mut CellArena {
        self.arena
    }
}

impl Drop for SuspendedRelease<'_> {
    fn drop(&mut self) {
        self.arena.release_suspended = false;
        self.arena.pins = std::mem::take(&mut self.saved);
    }
}

/// Bulk pin bookkeeping for a multi-cell mutation: every cell the
/// operation touches gets tracked, and `release_all` is called once on
/// every exit path so no pin outlives the operation.
#[derive(Default)]
pub struct CellRefTracker {
    tracked: Vec<CellIndex>,
}

impl CellRefTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `index` for the duration of the operation. Returns false if the
    /// cell cannot be mapped.
    pub fn track(&mut self, cells: &mut CellArena, index: CellIndex) -> bool {
        if !cells.is_live(index) {
            return false;
        }
        cells.pin(index);
        self.tracked.push(index);
        true
    }

    pub fn release_all(&mut self, cells: &mut CellArena) {
        for idx in self.tracked.drain(..) {
            cells.release(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_free_reuses_slots() {
        let mut a = CellArena::new();
        let c0 = a.allocate(8, CellType::Stable).unwrap();
        let c1 = a.allocate(8, CellType::Stable).unwrap();
        assert_ne!(c0, c1);
        a.free_cell(c0);
        assert!(!a.is_live(c0));
        let c2 = a.allocate(4, CellType::Volatile).unwrap();
        assert_eq!(c2, c0, "freed slot should be reused");
        assert_eq!(a.cell_type(c2), Some(CellType::Volatile));
    }

    #[test]
    fn reallocate_moves_and_preserves_prefix() {
        let mut a = CellArena::new();
        let c = a.allocate(4, CellType::Stable).unwrap();
        a.get_mut(c).unwrap().copy_from_slice(&[1, 2, 3, 4]);
        let n = a.reallocate(c, 6).unwrap();
        assert_ne!(n, c);
        assert!(!a.is_live(c));
        assert_eq!(&a.get(n).unwrap()[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn budgets_fail_allocation_and_dirty() {
        let mut a = CellArena::new();
        let c = a.allocate(4, CellType::Stable).unwrap();
        a.set_alloc_budget(Some(0));
        assert!(a.allocate(4, CellType::Stable).is_none());
        assert!(a.reallocate(c, 8).is_none());
        a.set_dirty_budget(Some(1));
        assert!(a.mark_dirty(c));
        assert!(!a.mark_dirty(c));
    }

    #[test]
    fn tracker_releases_everything() {
        let mut a = CellArena::new();
        let c0 = a.allocate(4, CellType::Stable).unwrap();
        let c1 = a.allocate(4, CellType::Stable).unwrap();
        let mut tr = CellRefTracker::new();
        assert!(tr.track(&mut a, c0));
        assert!(tr.track(&mut a, c1));
        assert!(tr.track(&mut a, c0));
        assert_eq!(a.pinned_count(), 3);
        // Freeing a tracked cell must not break the later bulk release.
        a.free_cell(c1);
        tr.release_all(&mut a);
        assert_eq!(a.pinned_count(), 0);
    }

    #[test]
    fn suspended_release_restores_pin_set() {
        let mut a = CellArena::new();
        let c0 = a.allocate(4, CellType::Stable).unwrap();
        let c1 = a.allocate(4, CellType::Stable).unwrap();
        a.pin(c0);
        {
            let mut s = a.suspend_release();
            s.pin(c1);
            s.release(c1); // ignored while suspended
            assert_eq!(s.pinned_count(), 2);
        }
        assert_eq!(a.pinned_count(), 1);
        a.release(c0);
        assert_eq!(a.pinned_count(), 0);
    }
}
