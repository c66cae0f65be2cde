//! The hive store: key nodes referencing shared security cells. Identical
//! descriptors are stored once and reference counted; the dedup cache
//! (`cache`) finds them and the per-hive ring (`ring`) threads them for
//! enumeration. Mutations mark every cell dirty before touching it, pin
//! every cell they reach until they finish, and take the four lock levels
//! in order.
//!
//! A failed multi-cell mutation can leave earlier cells updated; the store
//! stays structurally sound (counts, links and cache agree) but the
//! logical operation is not rolled back. Callers treat resource errors as
//! fatal for the affected hive.

mod cache;
mod ring;

pub use cache::{conv_key, CacheEntry, SecurityCache};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::access::check_descriptor_access;
use crate::cells::layout::{
    self, init_security_cell, security_cell_size, KeyNode, SecurityHeader, NODE_FLAG_HIVE_ENTRY,
    NODE_SIZE, SECURITY_HEADER_LEN,
};
use crate::cells::{CellArena, CellIndex, CellRefTracker, CellType};
use crate::config::StoreConfig;
use crate::descriptor::ops::{merge_fields, query_fields, ActorContext, QueryError};
use crate::descriptor::{root_descriptor, Descriptor, FieldSet};
use crate::error::{RegError, RegResult};
use crate::locks::{
    FlushBarrier, LockContext, NamespaceLock, NodeLock, NodeReadToken, SecurityLock,
};

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Open handle to one key node. Clones share the node lock and the
/// deleted flag, so any clone observes the deletion.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<HandleState>,
}

struct HandleState {
    cell: CellIndex,
    lock: NodeLock,
    deleted: AtomicBool,
}

impl NodeHandle {
    fn new(cell: CellIndex) -> Self {
        Self {
            inner: Arc::new(HandleState {
                cell,
                lock: NodeLock::new(),
                deleted: AtomicBool::new(false),
            }),
        }
    }

    pub fn cell(&self) -> CellIndex {
        self.inner.cell
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> RegResult<()> {
        if self.is_deleted() {
            Err(RegError::Deleted)
        } else {
            Ok(())
        }
    }

    fn mark_deleted(&self) {
        self.inner.deleted.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("cell", &self.inner.cell)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

pub struct Hive {
    config: StoreConfig,
    namespace: NamespaceLock,
    flush: FlushBarrier,
    security: SecurityLock<SecurityCache>,
    cells: RwLock<CellArena>,
}

impl Hive {
    pub fn new(config: StoreConfig) -> Self {
        let cache = SecurityCache::new(config.security_hash_buckets);
        Self {
            config,
            namespace: NamespaceLock::new(),
            flush: FlushBarrier::new(),
            security: SecurityLock::new(cache),
            cells: RwLock::new(CellArena::new()),
        }
    }

    /// Create the hive root node with the default descriptor. The root's
    /// security cell anchors the stable ring.
    pub fn create_root(&self) -> RegResult<NodeHandle> {
        let ns = self.namespace.exclusive();
        let flush = self.flush.enter_structural(&ns);
        let mut cache = self.security.exclusive(&flush);
        let mut cells = self.cells.write();

        let bytes = root_descriptor().to_bytes().map_err(RegError::malformed)?;
        let node_cell = cells
            .allocate(NODE_SIZE, CellType::Stable)
            .ok_or_else(|| RegError::exhausted("allocate root node"))?;
        let sec = match assign_descriptor(&mut cells, &mut cache, CellType::Stable, bytes, None) {
            Ok(sec) => sec,
            Err(e) => {
                cells.free_cell(node_cell);
                return Err(e);
            }
        };
        let mut node = KeyNode::new(CellIndex::NIL, NODE_FLAG_HIVE_ENTRY, now_ms());
        node.security = sec;
        node.write(node_buf(&mut cells, node_cell)?);
        info!(target: "regvault::store", "created hive root node={} security={}", node_cell, sec);
        Ok(NodeHandle::new(node_cell))
    }

    /// Create a subkey of `parent`. With no explicit descriptor the child
    /// adopts the parent's, which dedups onto the parent's security cell.
    /// The new security cell, if any, is spliced into the ring right after
    /// the parent's.
    pub fn create_key(
        &self,
        parent: &NodeHandle,
        ty: CellType,
        descriptor: Option<&Descriptor>,
    ) -> RegResult<NodeHandle> {
        let ns = self.namespace.exclusive();
        // The deleted flag is only raised under the namespace lock, so
        // checking it here rules out a racing delete reusing the slot.
        parent.ensure_live()?;
        let flush = self.flush.enter_structural(&ns);
        let mut cache = self.security.exclusive(&flush);
        let mut cells = self.cells.write();

        let pnode = read_node(&cells, parent.cell())?;
        let bytes = match descriptor {
            Some(d) => d.to_bytes().map_err(RegError::malformed)?,
            None => descriptor_bytes_for(&cells, &cache, pnode.security)?,
        };

        let node_cell = cells
            .allocate(NODE_SIZE, ty)
            .ok_or_else(|| RegError::exhausted("allocate key node"))?;
        let anchor = if ty == CellType::Stable { Some(pnode.security) } else { None };
        let sec = match assign_descriptor(&mut cells, &mut cache, ty, bytes, anchor) {
            Ok(sec) => sec,
            Err(e) => {
                cells.free_cell(node_cell);
                return Err(e);
            }
        };
        let mut node = KeyNode::new(parent.cell(), 0, now_ms());
        node.security = sec;
        node.write(node_buf(&mut cells, node_cell)?);

        if let Err(e) = add_child(&mut cells, parent.cell(), node_cell) {
            if let Err(rollback) = release_reference(&mut cells, &mut cache, sec) {
                warn!(
                    target: "regvault::store",
                    "rollback of security reference {} failed: {}", sec, rollback
                );
            }
            cells.free_cell(node_cell);
            return Err(e);
        }
        debug!(target: "regvault::store", "created key node={} security={} parent={}", node_cell, sec, parent.cell());
        Ok(NodeHandle::new(node_cell))
    }

    /// Replace the selected descriptor fields of a key. Dedup applies to
    /// the merged result: the node may adopt an existing cell, split off
    /// its own, or rewrite a private one in place or via relocation.
    pub fn set_security(
        &self,
        node: &NodeHandle,
        fields: FieldSet,
        modification: &Descriptor,
    ) -> RegResult<()> {
        let modification = modification.to_bytes().map_err(RegError::malformed)?;
        let ns = self.namespace.shared();
        let node_ex = node.inner.lock.exclusive(&ns);
        node.ensure_live()?;
        let flush = self.flush.enter(&node_ex);
        let mut cache = self.security.exclusive(&flush);
        let mut cells = self.cells.write();

        let mut tracker = CellRefTracker::new();
        let out = apply_security_update(
            &mut cells,
            &mut cache,
            &mut tracker,
            node.cell(),
            fields,
            &modification,
        );
        tracker.release_all(&mut cells);
        out
    }

    /// Extract the selected fields of a key's descriptor. Internally goes
    /// through the sized-buffer protocol: a small first attempt, one retry
    /// at the reported size.
    pub fn query_security(&self, node: &NodeHandle, fields: FieldSet) -> RegResult<Vec<u8>> {
        let ns = self.namespace.shared();
        let tok = NodeReadToken::acquire(&node.inner.lock, &ns, LockContext::Acquire);
        node.ensure_live()?;
        let cache = self.security.shared(&tok);
        let cells = self.cells.read();

        let knode = read_node(&cells, node.cell())?;
        let bytes = descriptor_bytes_for(&cells, &cache, knode.security)?;

        let mut first = [0u8; 128];
        let mut len = first.len();
        match query_fields(fields, &bytes, &mut first, &mut len) {
            Ok(()) => Ok(first[..len].to_vec()),
            Err(QueryError::BufferTooSmall) => {
                let mut out = vec![0u8; len];
                let mut len2 = len;
                query_fields(fields, &bytes, &mut out, &mut len2).map_err(|e| match e {
                    QueryError::Malformed(r) => RegError::malformed(r),
                    QueryError::BufferTooSmall => {
                        RegError::malformed("descriptor size changed between query attempts")
                    }
                })?;
                out.truncate(len2);
                Ok(out)
            }
            Err(QueryError::Malformed(r)) => Err(RegError::malformed(r)),
        }
    }

    /// Delete a leaf key: unhook it from its parent, drop its descriptor
    /// reference, free the node cell. Every handle clone observes the
    /// deletion afterwards.
    pub fn delete_key(&self, node: &NodeHandle) -> RegResult<()> {
        let ns = self.namespace.exclusive();
        node.ensure_live()?;
        let flush = self.flush.enter_structural(&ns);
        let mut cache = self.security.exclusive(&flush);
        let mut cells = self.cells.write();

        let knode = read_node(&cells, node.cell())?;
        if knode.subkey_count > 0 {
            return Err(RegError::NotEmpty);
        }
        if !cells.mark_dirty(node.cell()) {
            return Err(RegError::exhausted("mark key node dirty"));
        }
        if !knode.parent.is_nil() {
            remove_child(&mut cells, knode.parent, node.cell())?;
        }
        release_reference(&mut cells, &mut cache, knode.security)?;
        cells.free_cell(node.cell());
        node.mark_deleted();
        debug!(target: "regvault::store", "deleted key node={}", node.cell());
        Ok(())
    }

    /// Does `actor` hold `desired` access to this key? `ctx` says whether
    /// the caller already owns the node lock exclusively (a nested check
    /// inside its own mutation) or this call should take it shared.
    pub fn check_access(
        &self,
        node: &NodeHandle,
        actor: &ActorContext,
        desired: u32,
        ctx: LockContext,
    ) -> RegResult<()> {
        let ns = self.namespace.shared();
        let tok = NodeReadToken::acquire(&node.inner.lock, &ns, ctx);
        node.ensure_live()?;
        let cache = self.security.shared(&tok);
        let cells = self.cells.read();

        let knode = read_node(&cells, node.cell())?;
        let bytes = descriptor_bytes_for(&cells, &cache, knode.security)?;
        check_descriptor_access(&bytes, actor, desired)
    }

    /// Does `actor` hold `desired` access to every key under `root`?
    /// `include_root` says whether the root itself is checked too. Fails
    /// fast on the first denial. The walk holds the namespace exclusively,
    /// keeps every visited cell pinned for its whole duration, and refuses
    /// trees deeper than the configured bound.
    pub fn check_subtree_access(
        &self,
        root: &NodeHandle,
        actor: &ActorContext,
        desired: u32,
        include_root: bool,
    ) -> RegResult<()> {
        let ns = self.namespace.exclusive();
        root.ensure_live()?;
        let cache = self.security.shared_for_walk(&ns);
        let mut cells_guard = self.cells.write();
        let mut cells = cells_guard.suspend_release();

        #[derive(Clone, Copy)]
        struct Frame {
            node: CellIndex,
            next_child: usize,
        }

        let check_node = |cells: &mut CellArena, cell: CellIndex| -> RegResult<()> {
            cells.pin(cell);
            let node = read_node(cells, cell)?;
            cells.pin(node.security);
            let bytes = descriptor_bytes_for(cells, &cache, node.security)?;
            check_descriptor_access(&bytes, actor, desired)
        };

        if include_root {
            check_node(&mut cells, root.cell())?;
        } else {
            cells.pin(root.cell());
        }
        let mut stack = vec![Frame { node: root.cell(), next_child: 0 }];
        while let Some(top) = stack.last().copied() {
            let node = read_node(&cells, top.node)?;
            if top.next_child >= node.subkey_count as usize {
                stack.pop();
                continue;
            }
            if let Some(f) = stack.last_mut() {
                f.next_child += 1;
            }
            let list = cells
                .get(node.subkey_list)
                .ok_or_else(|| RegError::exhausted("map subkey list"))?;
            let child = layout::child_at(list, top.next_child)
                .ok_or_else(|| RegError::exhausted("read subkey list entry"))?;
            if stack.len() + 1 > self.config.max_tree_depth {
                debug!(target: "regvault::store", "subtree walk over depth bound at {}", child);
                return Err(RegError::TooDeep { depth: stack.len() + 1 });
            }
            check_node(&mut cells, child)?;
            stack.push(Frame { node: child, next_child: 0 });
        }
        Ok(())
    }

    pub fn last_write_time(&self, node: &NodeHandle) -> RegResult<DateTime<Utc>> {
        let ns = self.namespace.shared();
        let _tok = NodeReadToken::acquire(&node.inner.lock, &ns, LockContext::Acquire);
        node.ensure_live()?;
        let cells = self.cells.read();
        let knode = read_node(&cells, node.cell())?;
        DateTime::from_timestamp_millis(knode.last_write_ms)
            .ok_or_else(|| RegError::malformed("stored timestamp out of range"))
    }

    /// Write back every dirty cell (here: clear the flags) while the
    /// barrier excludes security mutations. Returns how many were dirty.
    pub fn flush_dirty(&self) -> usize {
        let _ex = self.flush.flush();
        let mut cells = self.cells.write();
        let flushed = cells.take_dirty();
        debug!(target: "regvault::store", "flushed {} dirty cells", flushed.len());
        flushed.len()
    }

    /// Cross-check cache, cells and ring: every cached cell maps, carries
    /// a positive count and the cached bytes, and sits on a closed ring.
    pub fn verify_security(&self) -> RegResult<()> {
        let ns = self.namespace.exclusive();
        let cache = self.security.shared_for_walk(&ns);
        let cells = self.cells.read();
        for (cell, entry) in cache.cells() {
            let buf = cells
                .get(cell)
                .ok_or_else(|| RegError::exhausted("map cached security cell"))?;
            let hdr = SecurityHeader::read(buf)
                .ok_or_else(|| RegError::malformed("cached cell is not a security cell"))?;
            if hdr.reference_count == 0 {
                return Err(RegError::malformed("live security cell with zero references"));
            }
            let stored = layout::security_descriptor_bytes(buf)
                .ok_or_else(|| RegError::malformed("cached cell descriptor unreadable"))?;
            if stored != entry.descriptor.as_slice() {
                return Err(RegError::malformed("cache bytes diverge from cell"));
            }
            if ring::ring_len(&cells, cell).is_none() {
                return Err(RegError::malformed("security ring does not close"));
            }
        }
        Ok(())
    }

    // Diagnostics, used by the tests and by callers auditing a hive.

    pub fn security_cell(&self, node: &NodeHandle) -> RegResult<CellIndex> {
        let cells = self.cells.read();
        node.ensure_live()?;
        Ok(read_node(&cells, node.cell())?.security)
    }

    pub fn security_ref_count(&self, node: &NodeHandle) -> RegResult<u32> {
        let cells = self.cells.read();
        node.ensure_live()?;
        let knode = read_node(&cells, node.cell())?;
        let buf = cells
            .get(knode.security)
            .ok_or_else(|| RegError::exhausted("map security cell"))?;
        let hdr = SecurityHeader::read(buf)
            .ok_or_else(|| RegError::malformed("bad security cell signature"))?;
        Ok(hdr.reference_count)
    }

    pub fn security_ring_len(&self, node: &NodeHandle) -> RegResult<usize> {
        let cells = self.cells.read();
        node.ensure_live()?;
        let knode = read_node(&cells, node.cell())?;
        ring::ring_len(&cells, knode.security)
            .ok_or_else(|| RegError::malformed("security ring does not close"))
    }

    pub fn live_security_cells(&self) -> usize {
        let ns = self.namespace.exclusive();
        self.security.shared_for_walk(&ns).len()
    }

    pub fn total_security_refs(&self) -> RegResult<u32> {
        let ns = self.namespace.exclusive();
        let cache = self.security.shared_for_walk(&ns);
        let cells = self.cells.read();
        let mut total = 0;
        for (cell, _) in cache.cells() {
            let buf = cells
                .get(cell)
                .ok_or_else(|| RegError::exhausted("map cached security cell"))?;
            let hdr = SecurityHeader::read(buf)
                .ok_or_else(|| RegError::malformed("bad security cell signature"))?;
            total += hdr.reference_count;
        }
        Ok(total)
    }

    pub fn pinned_cells(&self) -> usize {
        self.cells.read().pinned_count()
    }

    /// Direct arena access for diagnostics and failure injection.
    pub fn with_arena<R>(&self, f: impl FnOnce(&mut CellArena) -> R) -> R {
        f(&mut self.cells.write())
    }
}

fn read_node(cells: &CellArena, cell: CellIndex) -> RegResult<KeyNode> {
    cells
        .get(cell)
        .and_then(KeyNode::read)
        .ok_or_else(|| RegError::exhausted("map key node"))
}

fn node_buf(cells: &mut CellArena, cell: CellIndex) -> RegResult<&mut [u8]> {
    cells
        .get_mut(cell)
        .ok_or_else(|| RegError::exhausted("map key node"))
}

fn read_header(cells: &CellArena, cell: CellIndex) -> RegResult<SecurityHeader> {
    cells
        .get(cell)
        .and_then(SecurityHeader::read)
        .ok_or_else(|| RegError::exhausted("map security cell"))
}

fn write_header(cells: &mut CellArena, cell: CellIndex, hdr: &SecurityHeader) -> RegResult<()> {
    let buf = cells
        .get_mut(cell)
        .ok_or_else(|| RegError::exhausted("map security cell"))?;
    hdr.write(buf);
    Ok(())
}

/// Descriptor bytes behind a security cell, served from the cache when it
/// has them and from the cell otherwise.
fn descriptor_bytes_for(
    cells: &CellArena,
    cache: &SecurityCache,
    sec: CellIndex,
) -> RegResult<Vec<u8>> {
    if let Some(entry) = cache.get(sec) {
        return Ok(entry.descriptor.clone());
    }
    let buf = cells
        .get(sec)
        .ok_or_else(|| RegError::exhausted("map security cell"))?;
    layout::security_descriptor_bytes(buf)
        .map(|b| b.to_vec())
        .ok_or_else(|| RegError::malformed("bad security cell signature"))
}

/// Give a node a reference to `bytes`: adopt an existing identical cell or
/// allocate, initialize, link and cache a new one. Stable cells splice
/// after `anchor`; volatile cells (and the ring anchor itself) self-loop.
fn assign_descriptor(
    cells: &mut CellArena,
    cache: &mut SecurityCache,
    ty: CellType,
    bytes: Vec<u8>,
    anchor: Option<CellIndex>,
) -> RegResult<CellIndex> {
    if let Some(hit) = cache.find_matching(&bytes, ty) {
        if !cells.mark_dirty(hit) {
            return Err(RegError::exhausted("mark shared security cell dirty"));
        }
        let mut hdr = read_header(cells, hit)?;
        hdr.reference_count += 1;
        write_header(cells, hit, &hdr)?;
        debug!(target: "regvault::store", "descriptor dedup onto {} (refs={})", hit, hdr.reference_count);
        return Ok(hit);
    }

    let cell = cells
        .allocate(security_cell_size(bytes.len()), ty)
        .ok_or_else(|| RegError::exhausted("allocate security cell"))?;
    init_security_cell(
        cells
            .get_mut(cell)
            .ok_or_else(|| RegError::exhausted("map security cell"))?,
        &bytes,
    );
    match (ty, anchor) {
        (CellType::Stable, Some(a)) => ring::link_after(cells, a, cell)?,
        _ => ring::link_solo(cells, cell)?,
    }
    cache.insert(cell, ty, bytes);
    Ok(cell)
}

/// Drop one reference to a security cell. The last reference unlinks it
/// from the ring, evicts the cache entry and frees the cell.
fn release_reference(
    cells: &mut CellArena,
    cache: &mut SecurityCache,
    sec: CellIndex,
) -> RegResult<()> {
    let mut hdr = read_header(cells, sec)?;
    debug_assert!(hdr.reference_count >= 1);
    if !cells.mark_dirty(sec) {
        return Err(RegError::exhausted("mark security cell dirty"));
    }
    if hdr.reference_count > 1 {
        hdr.reference_count -= 1;
        return write_header(cells, sec, &hdr);
    }
    if hdr.flink != sec && !(cells.mark_dirty(hdr.flink) && cells.mark_dirty(hdr.blink)) {
        return Err(RegError::exhausted("mark ring neighbors dirty"));
    }
    ring::unlink(cells, sec)?;
    cache.remove(sec);
    cells.free_cell(sec);
    debug!(target: "regvault::store", "freed security cell {}", sec);
    Ok(())
}

/// The four-way security update. Merge first; then in order: unchanged
/// bytes are a no-op, an identical existing cell is adopted, a shared cell
/// splits off a private copy, and a private cell is rewritten in place
/// when the length allows or relocated when it does not.
fn apply_security_update(
    cells: &mut CellArena,
    cache: &mut SecurityCache,
    tracker: &mut CellRefTracker,
    node_cell: CellIndex,
    fields: FieldSet,
    modification: &[u8],
) -> RegResult<()> {
    let mut node = read_node(cells, node_cell)?;
    let sec = node.security;
    if !(tracker.track(cells, node_cell) && tracker.track(cells, sec)) {
        return Err(RegError::exhausted("pin security cells"));
    }

    let current = cache.entry(sec).descriptor.clone();
    let merged =
        merge_fields(&current, fields, modification).map_err(RegError::malformed)?;
    // Every successful set moves the write timestamp, the no-op included.
    node.last_write_ms = now_ms();
    if merged == current {
        if !cells.mark_dirty(node_cell) {
            return Err(RegError::exhausted("mark key node dirty"));
        }
        node.write(node_buf(cells, node_cell)?);
        debug!(target: "regvault::store", "security update is a no-op on {}", node_cell);
        return Ok(());
    }

    let ty = cells
        .cell_type(sec)
        .ok_or_else(|| RegError::exhausted("map security cell"))?;

    if let Some(matching) = cache.find_matching(&merged, ty) {
        debug_assert_ne!(matching, sec);
        if !tracker.track(cells, matching) {
            return Err(RegError::exhausted("pin matching security cell"));
        }
        if !(cells.mark_dirty(node_cell) && cells.mark_dirty(matching)) {
            return Err(RegError::exhausted("mark cells dirty"));
        }
        let mut hdr = read_header(cells, matching)?;
        hdr.reference_count += 1;
        write_header(cells, matching, &hdr)?;
        node.security = matching;
        node.write(node_buf(cells, node_cell)?);
        release_reference(cells, cache, sec)?;
        debug!(target: "regvault::store", "node {} adopted shared cell {}", node_cell, matching);
        return Ok(());
    }

    let mut hdr = read_header(cells, sec)?;
    if hdr.reference_count > 1 {
        // Shared cell, descriptor diverging: split off a private copy and
        // leave the other referents on the old cell.
        if !(cells.mark_dirty(node_cell) && cells.mark_dirty(sec)) {
            return Err(RegError::exhausted("mark cells dirty"));
        }
        let fresh = cells
            .allocate(security_cell_size(merged.len()), ty)
            .ok_or_else(|| RegError::exhausted("allocate security cell"))?;
        if !tracker.track(cells, fresh) {
            return Err(RegError::exhausted("pin fresh security cell"));
        }
        init_security_cell(
            cells
                .get_mut(fresh)
                .ok_or_else(|| RegError::exhausted("map security cell"))?,
            &merged,
        );
        if ty == CellType::Stable {
            ring::link_after(cells, sec, fresh)?;
        } else {
            ring::link_solo(cells, fresh)?;
        }
        cache.insert(fresh, ty, merged);
        // Re-read: the splice above rewired this cell's links.
        let mut hdr = read_header(cells, sec)?;
        hdr.reference_count -= 1;
        write_header(cells, sec, &hdr)?;
        node.security = fresh;
        node.write(node_buf(cells, node_cell)?);
        debug!(target: "regvault::store", "node {} split from {} to {}", node_cell, sec, fresh);
        return Ok(());
    }

    // Sole referent: rewrite the private cell.
    if !(cells.mark_dirty(sec) && cells.mark_dirty(node_cell)) {
        return Err(RegError::exhausted("mark cells dirty"));
    }
    if merged.len() == current.len() {
        layout::overwrite_security_descriptor(
            cells
                .get_mut(sec)
                .ok_or_else(|| RegError::exhausted("map security cell"))?,
            &merged,
        );
        cache.rewrite_in_place(sec, merged);
        node.write(node_buf(cells, node_cell)?);
        debug!(target: "regvault::store", "rewrote {} in place", sec);
        return Ok(());
    }

    // Length changed: the cell relocates and both the ring and the node
    // reference chase it.
    let fresh = cells
        .reallocate(sec, security_cell_size(merged.len()))
        .ok_or_else(|| RegError::exhausted("reallocate security cell"))?;
    if !tracker.track(cells, fresh) {
        return Err(RegError::exhausted("pin relocated security cell"));
    }
    hdr.descriptor_length = merged.len() as u32;
    write_header(cells, fresh, &hdr)?;
    {
        let buf = cells
            .get_mut(fresh)
            .ok_or_else(|| RegError::exhausted("map security cell"))?;
        buf[SECURITY_HEADER_LEN..SECURITY_HEADER_LEN + merged.len()].copy_from_slice(&merged);
    }
    if ty == CellType::Stable && hdr.flink != sec {
        if !(cells.mark_dirty(hdr.flink) && cells.mark_dirty(hdr.blink)) {
            return Err(RegError::exhausted("mark ring neighbors dirty"));
        }
        ring::repoint_neighbors(cells, sec, fresh)?;
    } else {
        ring::link_solo(cells, fresh)?;
    }
    cache.relocate(sec, fresh);
    cache.rewrite_in_place(fresh, merged);
    node.security = fresh;
    node.write(node_buf(cells, node_cell)?);
    debug!(target: "regvault::store", "relocated {} to {} for resize", sec, fresh);
    Ok(())
}

/// Append a child to the parent's subkey list. The list lives in its own
/// cell and relocates as it grows, so only the parent node is rewritten.
fn add_child(cells: &mut CellArena, parent: CellIndex, child: CellIndex) -> RegResult<()> {
    let mut node = read_node(cells, parent)?;
    if !cells.mark_dirty(parent) {
        return Err(RegError::exhausted("mark parent node dirty"));
    }
    let count = node.subkey_count as usize;
    let ty = cells
        .cell_type(parent)
        .ok_or_else(|| RegError::exhausted("map parent node"))?;
    let list = if node.subkey_list.is_nil() {
        cells
            .allocate(layout::child_list_size(1), ty)
            .ok_or_else(|| RegError::exhausted("allocate subkey list"))?
    } else {
        cells
            .reallocate(node.subkey_list, layout::child_list_size(count + 1))
            .ok_or_else(|| RegError::exhausted("grow subkey list"))?
    };
    layout::write_child(
        cells
            .get_mut(list)
            .ok_or_else(|| RegError::exhausted("map subkey list"))?,
        count,
        child,
    );
    node.subkey_list = list;
    node.subkey_count = count as u32 + 1;
    node.last_write_ms = now_ms();
    node.write(node_buf(cells, parent)?);
    Ok(())
}

fn remove_child(cells: &mut CellArena, parent: CellIndex, child: CellIndex) -> RegResult<()> {
    let mut node = read_node(cells, parent)?;
    if !cells.mark_dirty(parent) {
        return Err(RegError::exhausted("mark parent node dirty"));
    }
    let count = node.subkey_count as usize;
    let list = cells
        .get(node.subkey_list)
        .ok_or_else(|| RegError::exhausted("map subkey list"))?;
    let pos = (0..count)
        .find(|i| layout::child_at(list, *i) == Some(child))
        .unwrap_or_else(|| panic!("child {} missing from parent {} subkey list", child, parent));
    let last = layout::child_at(list, count - 1)
        .ok_or_else(|| RegError::exhausted("read subkey list entry"))?;

    if count == 1 {
        cells.free_cell(node.subkey_list);
        node.subkey_list = CellIndex::NIL;
    } else {
        // Swap the last entry into the hole, then shrink.
        layout::write_child(
            cells
                .get_mut(node.subkey_list)
                .ok_or_else(|| RegError::exhausted("map subkey list"))?,
            pos,
            last,
        );
        node.subkey_list = cells
            .reallocate(node.subkey_list, layout::child_list_size(count - 1))
            .ok_or_else(|| RegError::exhausted("shrink subkey list"))?;
    }
    node.subkey_count = count as u32 - 1;
    node.last_write_ms = now_ms();
    node.write(node_buf(cells, parent)?);
    Ok(())
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod store_tests;
