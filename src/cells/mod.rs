//! Cell storage: an index-addressed arena of fixed-size regions plus the
//! persisted byte layouts the security engine stores in them. The arena
//! stands in for the paging/allocation layer of the hive file; everything
//! above it addresses cells by stable integer index, never by pointer.

mod arena;
pub mod layout;

pub use arena::{CellArena, CellRefTracker, SuspendedRelease};

use std::fmt;

/// Opaque allocator-assigned address of one storage cell.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellIndex(pub u32);

impl CellIndex {
    /// The reserved "no cell" value. A node's security reference is NIL
    /// only in the window between node construction and the mandatory
    /// initial descriptor assignment.
    pub const NIL: CellIndex = CellIndex(u32::MAX);

    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }
}

impl fmt::Debug for CellIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "Cell(NIL)")
        } else {
            write!(f, "Cell({})", self.0)
        }
    }
}

impl fmt::Display for CellIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Storage class of a cell. Volatile cells do not survive a reload, so
/// volatile security cells anchor their own ring instead of joining the
/// stable list.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CellType {
    Stable,
    Volatile,
}
