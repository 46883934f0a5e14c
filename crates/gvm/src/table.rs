//! Translation-table geometry and the per-space table arena.
//!
//! The hierarchy is a scale model of a nested-MMU region/segment/page
//! scheme: 4 KiB pages, 1 MiB segments, then three region levels above.
//! Region and segment tables hold 2048 entries; page tables hold 256.
//!
//! Tables live in a per-address-space [`TableArena`] and are addressed by
//! small integer [`TableHandle`]s, never by raw pointers. Entries store
//! handles, so recursive teardown is index-based and bounds-checked.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::entry::Entry;
use crate::error::{Error, Result};

/// Page size shift (4 KiB pages).
pub const PAGE_SHIFT: u32 = 12;

/// Page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Segment size in bytes (the large-leaf granularity).
pub const SEGMENT_SIZE: u64 = 1 << 20;

/// Number of entries in a region or segment table.
pub const REGION_TABLE_ENTRIES: usize = 2048;

/// Number of entries in a page table.
pub const PAGE_TABLE_ENTRIES: usize = 256;

/// One level of the translation hierarchy.
///
/// A table "at" a level is indexed by that level's address bits; each of its
/// entries covers [`Level::entry_size`] bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    PageTable,
    Segment,
    Region3,
    Region2,
    Region1,
}

impl Level {
    /// Address shift of this level's index bits.
    pub const fn shift(self) -> u32 {
        match self {
            Level::PageTable => 12,
            Level::Segment => 20,
            Level::Region3 => 31,
            Level::Region2 => 42,
            Level::Region1 => 53,
        }
    }

    /// Bytes covered by a single entry at this level.
    pub const fn entry_size(self) -> u64 {
        1 << self.shift()
    }

    /// Number of entries in a table indexed at this level.
    pub const fn entries(self) -> usize {
        match self {
            Level::PageTable => PAGE_TABLE_ENTRIES,
            _ => REGION_TABLE_ENTRIES,
        }
    }

    /// Bytes such a table occupies in guest memory (entries are 8 bytes).
    /// This is the region a shadow must protect in the parent.
    pub const fn table_bytes(self) -> u64 {
        (self.entries() as u64) * 8
    }

    /// Mask aligning an address down to this level's unit.
    pub const fn mask(self) -> u64 {
        !(self.entry_size() - 1)
    }

    /// Extracts this level's table index from an address.
    #[inline]
    pub const fn index_of(self, addr: u64) -> usize {
        ((addr >> self.shift()) as usize) & (self.entries() - 1)
    }

    /// The level one step down, toward pages.
    pub const fn child(self) -> Option<Level> {
        match self {
            Level::PageTable => None,
            Level::Segment => Some(Level::PageTable),
            Level::Region3 => Some(Level::Segment),
            Level::Region2 => Some(Level::Region3),
            Level::Region1 => Some(Level::Region2),
        }
    }

    /// The level one step up, toward the root.
    pub const fn parent(self) -> Option<Level> {
        match self {
            Level::PageTable => Some(Level::Segment),
            Level::Segment => Some(Level::Region3),
            Level::Region3 => Some(Level::Region2),
            Level::Region2 => Some(Level::Region1),
            Level::Region1 => None,
        }
    }
}

/// Selects the root table level for a requested address-space limit,
/// choosing the shallowest hierarchy that covers it. Returns the level and
/// the effective (rounded-up) limit.
pub(crate) const fn root_level_for_limit(limit: u64) -> (Level, u64) {
    if limit < Level::Region3.entry_size() {
        (Level::Segment, Level::Region3.entry_size() - 1)
    } else if limit < Level::Region2.entry_size() {
        (Level::Region3, Level::Region2.entry_size() - 1)
    } else if limit < Level::Region1.entry_size() {
        (Level::Region2, Level::Region1.entry_size() - 1)
    } else {
        (Level::Region1, u64::MAX)
    }
}

/// Identifies the parent structure a shadow page table mirrors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShadowOrigin {
    /// Parent guest address of the shadowed page table (or block base).
    pub origin: u64,
    /// The "table" is a contiguous identity block, not a real structure;
    /// it was never protected in the parent.
    pub fake: bool,
}

/// Handle naming one table inside a [`TableArena`].
///
/// Handle 0 is reserved so that a zero entry payload always means "none".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TableHandle(u32);

impl TableHandle {
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub(crate) const fn raw(self) -> u32 {
        self.0
    }
}

/// One translation table: a boxed entry array plus its level and, for
/// shadow page tables, the parent origin it mirrors.
pub struct Table {
    level: Level,
    entries: Box<[Entry]>,
    origin: Option<ShadowOrigin>,
}

impl Table {
    fn new(level: Level) -> Self {
        Self {
            level,
            entries: vec![Entry::EMPTY; level.entries()].into_boxed_slice(),
            origin: None,
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Returns the entry at `index`.
    ///
    /// # Panics
    /// Panics if the index is out of bounds for this level.
    pub fn entry(&self, index: usize) -> Entry {
        self.entries[index]
    }

    pub fn set_entry(&mut self, index: usize, entry: Entry) {
        self.entries[index] = entry;
    }

    pub fn origin(&self) -> Option<ShadowOrigin> {
        self.origin
    }

    pub fn set_origin(&mut self, origin: ShadowOrigin) {
        self.origin = Some(origin);
    }
}

/// Arena owning every table of one address space.
///
/// Allocation is capacity-limited so table exhaustion surfaces as
/// [`Error::OutOfMemory`] instead of aborting. Handles are only ever created
/// by this arena; a stale or foreign handle is an internal invariant
/// violation and panics rather than risking a wrong translation.
pub struct TableArena {
    slots: Vec<Option<Table>>,
    free: Vec<u32>,
    live: usize,
    capacity: usize,
}

impl TableArena {
    /// Creates an arena that will hold at most `capacity` tables.
    pub fn new(capacity: usize) -> Self {
        Self {
            // Slot 0 is reserved; see `TableHandle`.
            slots: vec![None],
            free: Vec::new(),
            live: 0,
            capacity,
        }
    }

    /// Allocates a zero-initialized table indexed at `level`.
    pub fn alloc(&mut self, level: Level) -> Result<TableHandle> {
        if self.live >= self.capacity {
            log::error!("table arena exhausted ({} tables)", self.capacity);
            return Err(Error::OutOfMemory);
        }
        let table = Table::new(level);
        let raw = match self.free.pop() {
            Some(raw) => {
                self.slots[raw as usize] = Some(table);
                raw
            }
            None => {
                self.slots.push(Some(table));
                (self.slots.len() - 1) as u32
            }
        };
        self.live += 1;
        Ok(TableHandle::from_raw(raw))
    }

    /// Frees a table, returning it for inspection by teardown code.
    pub fn free(&mut self, handle: TableHandle) -> Table {
        let table = self.slots[handle.raw() as usize]
            .take()
            .unwrap_or_else(|| panic!("double free of table handle {}", handle.raw()));
        self.free.push(handle.raw());
        self.live -= 1;
        table
    }

    /// Returns a reference to the table named by `handle`.
    ///
    /// # Panics
    /// Panics on a freed or foreign handle.
    pub fn get(&self, handle: TableHandle) -> &Table {
        self.slots[handle.raw() as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("stale table handle {}", handle.raw()))
    }

    /// Returns a mutable reference to the table named by `handle`.
    ///
    /// # Panics
    /// Panics on a freed or foreign handle.
    pub fn get_mut(&mut self, handle: TableHandle) -> &mut Table {
        self.slots[handle.raw() as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("stale table handle {}", handle.raw()))
    }

    /// Number of live tables.
    pub fn live(&self) -> usize {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod levels {
        use super::*;

        #[test]
        fn index_extraction() {
            let addr = (3u64 << Level::Region2.shift())
                | (5u64 << Level::Region3.shift())
                | (7u64 << Level::Segment.shift())
                | (9u64 << Level::PageTable.shift());
            assert_eq!(Level::Region2.index_of(addr), 3);
            assert_eq!(Level::Region3.index_of(addr), 5);
            assert_eq!(Level::Segment.index_of(addr), 7);
            assert_eq!(Level::PageTable.index_of(addr), 9);
        }

        #[test]
        fn child_parent_chain() {
            assert_eq!(Level::Region1.child(), Some(Level::Region2));
            assert_eq!(Level::Segment.child(), Some(Level::PageTable));
            assert_eq!(Level::PageTable.child(), None);
            assert_eq!(Level::PageTable.parent(), Some(Level::Segment));
            assert_eq!(Level::Region1.parent(), None);
        }

        #[test]
        fn root_depth_selection() {
            assert_eq!(root_level_for_limit(0).0, Level::Segment);
            assert_eq!(root_level_for_limit((1 << 31) - 1).0, Level::Segment);
            assert_eq!(root_level_for_limit(1 << 31).0, Level::Region3);
            assert_eq!(root_level_for_limit(1 << 42).0, Level::Region2);
            assert_eq!(root_level_for_limit(1 << 53).0, Level::Region1);
            assert_eq!(root_level_for_limit(u64::MAX).1, u64::MAX);
        }

        #[test]
        fn effective_limit_rounds_up() {
            let (_, limit) = root_level_for_limit(0x1000);
            assert_eq!(limit, (1 << 31) - 1);
        }
    }

    mod arena {
        use super::*;

        #[test]
        fn alloc_reserves_handle_zero() {
            let mut arena = TableArena::new(8);
            let handle = arena.alloc(Level::Segment).unwrap();
            assert_ne!(handle.raw(), 0);
            assert_eq!(arena.get(handle).level(), Level::Segment);
        }

        #[test]
        fn capacity_exhaustion_reports_out_of_memory() {
            let mut arena = TableArena::new(2);
            arena.alloc(Level::Segment).unwrap();
            arena.alloc(Level::PageTable).unwrap();
            assert_eq!(arena.alloc(Level::PageTable), Err(Error::OutOfMemory));
        }

        #[test]
        fn free_recycles_slots() {
            let mut arena = TableArena::new(1);
            let handle = arena.alloc(Level::PageTable).unwrap();
            arena.free(handle);
            assert_eq!(arena.live(), 0);
            let again = arena.alloc(Level::PageTable).unwrap();
            assert_eq!(again, handle);
        }

        #[test]
        fn tables_start_empty() {
            let mut arena = TableArena::new(1);
            let handle = arena.alloc(Level::PageTable).unwrap();
            let table = arena.get(handle);
            for i in 0..Level::PageTable.entries() {
                assert!(table.entry(i).is_empty());
            }
        }

        #[test]
        #[should_panic(expected = "stale table handle")]
        fn stale_handle_panics() {
            let mut arena = TableArena::new(1);
            let handle = arena.alloc(Level::PageTable).unwrap();
            arena.free(handle);
            arena.get(handle);
        }
    }
}
