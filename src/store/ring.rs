//! The security cell ring: a circular doubly-linked list threading every
//! live security cell of a hive through the Flink/Blink fields in the
//! cells themselves. All operations are pure index rewiring over the
//! arena, and the singleton self-loop is an explicit branch everywhere,
//! never an emergent case.

use tracing::debug;

use crate::cells::layout::SecurityHeader;
use crate::cells::{CellArena, CellIndex};
use crate::error::{RegError, RegResult};

fn header(cells: &CellArena, cell: CellIndex) -> RegResult<SecurityHeader> {
    cells
        .get(cell)
        .and_then(SecurityHeader::read)
        .ok_or_else(|| RegError::exhausted("map security cell"))
}

fn store_header(cells: &mut CellArena, cell: CellIndex, hdr: &SecurityHeader) -> RegResult<()> {
    let buf = cells
        .get_mut(cell)
        .ok_or_else(|| RegError::exhausted("map security cell"))?;
    hdr.write(buf);
    Ok(())
}

/// Make `cell` the sole element of its own ring (hive creation, or a
/// volatile cell that never joins the stable list).
pub fn link_solo(cells: &mut CellArena, cell: CellIndex) -> RegResult<()> {
    debug!(target: "regvault::ring", "link_solo: {}", cell);
    let mut hdr = header(cells, cell)?;
    hdr.flink = cell;
    hdr.blink = cell;
    store_header(cells, cell, &hdr)
}

/// Splice `cell` into the ring immediately after `anchor`. Marks the two
/// rewired neighbors dirty; fails with no rewiring done if either mark
/// fails.
pub fn link_after(cells: &mut CellArena, anchor: CellIndex, cell: CellIndex) -> RegResult<()> {
    debug!(target: "regvault::ring", "link_after: {} after {}", cell, anchor);
    let anchor_hdr = header(cells, anchor)?;
    let next = anchor_hdr.flink;
    if !(cells.mark_dirty(anchor) && cells.mark_dirty(next)) {
        return Err(RegError::exhausted("mark ring neighbors dirty"));
    }

    let mut hdr = header(cells, cell)?;
    hdr.blink = anchor;
    hdr.flink = next;
    store_header(cells, cell, &hdr)?;

    if next == anchor {
        // Singleton anchor: it becomes both neighbors of the new cell.
        let mut a = header(cells, anchor)?;
        a.flink = cell;
        a.blink = cell;
        store_header(cells, anchor, &a)?;
    } else {
        let mut a = header(cells, anchor)?;
        a.flink = cell;
        store_header(cells, anchor, &a)?;
        let mut n = header(cells, next)?;
        n.blink = cell;
        store_header(cells, next, &n)?;
    }
    Ok(())
}

/// Take `cell` out of the ring. The caller has already marked the
/// neighbors dirty; the cell itself is about to be freed.
pub fn unlink(cells: &mut CellArena, cell: CellIndex) -> RegResult<()> {
    debug!(target: "regvault::ring", "unlink: {}", cell);
    let hdr = header(cells, cell)?;
    if hdr.flink == cell {
        // Singleton: nothing to rewire.
        debug_assert_eq!(hdr.blink, cell);
        return Ok(());
    }
    let mut f = header(cells, hdr.flink)?;
    debug_assert_eq!(f.blink, cell);
    f.blink = hdr.blink;
    store_header(cells, hdr.flink, &f)?;
    let mut b = header(cells, hdr.blink)?;
    debug_assert_eq!(b.flink, cell);
    b.flink = hdr.flink;
    store_header(cells, hdr.blink, &b)?;
    Ok(())
}

/// After a cell relocated from `old` to `new` (links copied verbatim),
/// rewire the two neighbors to reference the new index. A cell that was
/// its own neighbor is re-pointed at itself.
pub fn repoint_neighbors(cells: &mut CellArena, old: CellIndex, new: CellIndex) -> RegResult<()> {
    debug!(target: "regvault::ring", "repoint_neighbors: {} -> {}", old, new);
    let hdr = header(cells, new)?;
    if hdr.flink == old {
        let mut h = header(cells, new)?;
        h.flink = new;
        store_header(cells, new, &h)?;
    } else {
        let mut f = header(cells, hdr.flink)?;
        f.blink = new;
        store_header(cells, hdr.flink, &f)?;
    }
    // Re-read: the flink fix above may have been to this same cell.
    let hdr = header(cells, new)?;
    if hdr.blink == old {
        let mut h = header(cells, new)?;
        h.blink = new;
        store_header(cells, new, &h)?;
    } else {
        let mut b = header(cells, hdr.blink)?;
        b.flink = new;
        store_header(cells, hdr.blink, &b)?;
    }
    Ok(())
}

/// Number of cells reachable by following Flink from `start` until it
/// loops. `None` means the ring is broken (does not close within the
/// arena's live-cell count).
pub fn ring_len(cells: &CellArena, start: CellIndex) -> Option<usize> {
    let bound = cells.live_count() + 1;
    let mut cur = start;
    for n in 1..=bound {
        cur = header(cells, cur).ok()?.flink;
        if cur == start {
            return Some(n);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::layout::{init_security_cell, security_cell_size};
    use crate::cells::CellType;

    fn new_cell(cells: &mut CellArena) -> CellIndex {
        let desc = [0u8; 4];
        let idx = cells.allocate(security_cell_size(desc.len()), CellType::Stable).unwrap();
        init_security_cell(cells.get_mut(idx).unwrap(), &desc);
        idx
    }

    #[test]
    fn solo_points_to_itself() {
        let mut cells = CellArena::new();
        let a = new_cell(&mut cells);
        link_solo(&mut cells, a).unwrap();
        let hdr = header(&cells, a).unwrap();
        assert_eq!(hdr.flink, a);
        assert_eq!(hdr.blink, a);
        assert_eq!(ring_len(&cells, a), Some(1));
    }

    #[test]
    fn insert_after_singleton_and_grow() {
        let mut cells = CellArena::new();
        let a = new_cell(&mut cells);
        let b = new_cell(&mut cells);
        let c = new_cell(&mut cells);
        link_solo(&mut cells, a).unwrap();
        link_after(&mut cells, a, b).unwrap();
        assert_eq!(ring_len(&cells, a), Some(2));
        link_after(&mut cells, a, c).unwrap();
        assert_eq!(ring_len(&cells, a), Some(3));
        // a -> c -> b -> a
        assert_eq!(header(&cells, a).unwrap().flink, c);
        assert_eq!(header(&cells, c).unwrap().flink, b);
        assert_eq!(header(&cells, b).unwrap().flink, a);
        assert_eq!(header(&cells, a).unwrap().blink, b);
    }

    #[test]
    fn unlink_back_to_singleton() {
        let mut cells = CellArena::new();
        let a = new_cell(&mut cells);
        let b = new_cell(&mut cells);
        link_solo(&mut cells, a).unwrap();
        link_after(&mut cells, a, b).unwrap();
        unlink(&mut cells, b).unwrap();
        cells.free_cell(b);
        let hdr = header(&cells, a).unwrap();
        assert_eq!(hdr.flink, a);
        assert_eq!(hdr.blink, a);
        assert_eq!(ring_len(&cells, a), Some(1));
    }

    #[test]
    fn unlink_singleton_is_noop() {
        let mut cells = CellArena::new();
        let a = new_cell(&mut cells);
        link_solo(&mut cells, a).unwrap();
        unlink(&mut cells, a).unwrap();
    }

    #[test]
    fn repoint_after_relocation_of_singleton() {
        let mut cells = CellArena::new();
        let a = new_cell(&mut cells);
        link_solo(&mut cells, a).unwrap();
        // Simulate relocation: copy to a fresh cell, free the old one.
        let moved = cells.reallocate(a, security_cell_size(4)).unwrap();
        repoint_neighbors(&mut cells, a, moved).unwrap();
        let hdr = header(&cells, moved).unwrap();
        assert_eq!(hdr.flink, moved);
        assert_eq!(hdr.blink, moved);
    }

    #[test]
    fn repoint_after_relocation_in_pair() {
        let mut cells = CellArena::new();
        let a = new_cell(&mut cells);
        let b = new_cell(&mut cells);
        link_solo(&mut cells, a).unwrap();
        link_after(&mut cells, a, b).unwrap();
        let moved = cells.reallocate(b, security_cell_size(4)).unwrap();
        repoint_neighbors(&mut cells, b, moved).unwrap();
        assert_eq!(ring_len(&cells, a), Some(2));
        assert_eq!(header(&cells, a).unwrap().flink, moved);
        assert_eq!(header(&cells, a).unwrap().blink, moved);
        assert_eq!(header(&cells, moved).unwrap().flink, a);
        assert_eq!(header(&cells, moved).unwrap().blink, a);
    }

    #[test]
    fn insert_fails_cleanly_when_dirty_budget_exhausted() {
        let mut cells = CellArena::new();
        let a = new_cell(&mut cells);
        let b = new_cell(&mut cells);
        link_solo(&mut cells, a).unwrap();
        cells.set_dirty_budget(Some(0));
        let err = link_after(&mut cells, a, b).unwrap_err();
        assert!(err.is_resource());
        // Anchor untouched.
        assert_eq!(ring_len(&cells, a), Some(1));
    }
}
