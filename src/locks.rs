//! Four-level lock hierarchy: global namespace lock, per-node lock, store
//! flush barrier, store security lock. The order is fixed and enforced by
//! type: acquiring a level takes a guard from the level above as evidence,
//! so a call site that tries to lock out of order does not compile.
//!
//! Mutations: namespace shared -> node exclusive -> flush shared ->
//! security exclusive. Reads: namespace shared -> node shared -> security
//! shared, flush barrier skipped. Whole-store walks take the namespace
//! lock exclusively and need no per-node locks.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Level 1: the process-wide namespace lock.
#[derive(Default)]
pub struct NamespaceLock {
    inner: RwLock<()>,
}

pub struct NamespaceShared<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

pub struct NamespaceExclusive<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

impl NamespaceLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> NamespaceShared<'_> {
        NamespaceShared { _guard: self.inner.read() }
    }

    /// Exclusive hold over the whole namespace; used by subtree walks,
    /// which then need no per-node locks.
    pub fn exclusive(&self) -> NamespaceExclusive<'_> {
        NamespaceExclusive { _guard: self.inner.write() }
    }
}

/// Level 2: one lock per open-node handle.
#[derive(Default)]
pub struct NodeLock {
    inner: RwLock<()>,
}

pub struct NodeExclusive<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

pub struct NodeShared<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

impl NodeLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exclusive<'a>(&'a self, _ns: &NamespaceShared<'_>) -> NodeExclusive<'a> {
        NodeExclusive { _guard: self.inner.write() }
    }

    pub fn shared<'a>(&'a self, _ns: &NamespaceShared<'_>) -> NodeShared<'a> {
        NodeShared { _guard: self.inner.read() }
    }
}

/// How a read path should treat the per-node lock. The caller-holds
/// variant replaces the old tagged-pointer trick: a caller that already
/// owns the node lock exclusively says so and the read path skips
/// re-acquiring it. Never valid on a path that acquires exclusively.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockContext {
    Acquire,
    CallerHoldsExclusive,
}

/// Evidence that the node lock is held for reading, either because this
/// path acquired it shared or because the caller attests to an exclusive
/// hold.
pub enum NodeReadToken<'a> {
    Acquired(NodeShared<'a>),
    CallerHeld,
}

impl<'a> NodeReadToken<'a> {
    pub fn acquire(lock: &'a NodeLock, ns: &NamespaceShared<'_>, ctx: LockContext) -> Self {
        match ctx {
            LockContext::Acquire => NodeReadToken::Acquired(lock.shared(ns)),
            LockContext::CallerHoldsExclusive => NodeReadToken::CallerHeld,
        }
    }
}

/// Level 3: hive flush barrier. Mutators hold it shared so no flush can
/// observe a half-done security mutation; the flusher takes it exclusive.
#[derive(Default)]
pub struct FlushBarrier {
    inner: RwLock<()>,
}

pub struct FlushShared<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

pub struct FlushExclusive<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

impl FlushBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter<'a>(&'a self, _node: &NodeExclusive<'_>) -> FlushShared<'a> {
        FlushShared { _guard: self.inner.read() }
    }

    /// Structural mutations (key creation, deletion) hold the whole
    /// namespace exclusively instead of a per-node lock; they still enter
    /// the barrier so flushes see them whole.
    pub fn enter_structural<'a>(&'a self, _ns: &NamespaceExclusive<'_>) -> FlushShared<'a> {
        FlushShared { _guard: self.inner.read() }
    }

    /// Flusher side: excludes all security mutations for the duration.
    pub fn flush(&self) -> FlushExclusive<'_> {
        FlushExclusive { _guard: self.inner.write() }
    }
}

/// Level 4: the store security lock, guarding the dedup cache and ring.
pub struct SecurityLock<T> {
    inner: RwLock<T>,
}

impl<T> SecurityLock<T> {
    pub fn new(value: T) -> Self {
        Self { inner: RwLock::new(value) }
    }

    pub fn exclusive<'a>(&'a self, _flush: &FlushShared<'_>) -> RwLockWriteGuard<'a, T> {
        self.inner.write()
    }

    pub fn shared<'a>(&'a self, _node: &NodeReadToken<'_>) -> RwLockReadGuard<'a, T> {
        self.inner.read()
    }

    /// Shared access under an exclusive namespace hold (walk paths, where
    /// no per-node locks exist).
    pub fn shared_for_walk<'a>(&'a self, _ns: &NamespaceExclusive<'_>) -> RwLockReadGuard<'a, T> {
        self.inner.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_acquisition_for_mutation() {
        let ns = NamespaceLock::new();
        let node = NodeLock::new();
        let flush = FlushBarrier::new();
        let sec = SecurityLock::new(0u32);

        let g1 = ns.shared();
        let g2 = node.exclusive(&g1);
        let g3 = flush.enter(&g2);
        let mut cache = sec.exclusive(&g3);
        *cache += 1;
        assert_eq!(*cache, 1);
    }

    #[test]
    fn read_path_skips_flush_barrier() {
        let ns = NamespaceLock::new();
        let node = NodeLock::new();
        let flush = FlushBarrier::new();
        let sec = SecurityLock::new(7u32);

        // A flush in progress must not block readers.
        let _flushing = flush.flush();
        let g1 = ns.shared();
        let tok = NodeReadToken::acquire(&node, &g1, LockContext::Acquire);
        assert_eq!(*sec.shared(&tok), 7);
    }

    #[test]
    fn caller_held_context_does_not_touch_node_lock() {
        let ns = NamespaceLock::new();
        let node = NodeLock::new();
        let sec = SecurityLock::new(1u32);

        let g1 = ns.shared();
        let _held = node.exclusive(&g1);
        // With the node lock already held exclusively, a nested read would
        // self-deadlock if it re-acquired; the context makes it skip.
        let tok = NodeReadToken::acquire(&node, &g1, LockContext::CallerHoldsExclusive);
        assert_eq!(*sec.shared(&tok), 1);
    }

    #[test]
    fn flush_excludes_mutators() {
        let ns = NamespaceLock::new();
        let node = NodeLock::new();
        let flush = FlushBarrier::new();

        let g1 = ns.shared();
        let g2 = node.exclusive(&g1);
        let _mutating = flush.enter(&g2);
        // Flusher cannot start while a mutation holds the barrier shared.
        assert!(flush.inner.try_write().is_none());
    }
}
