//! Reverse mapping from host pages to the shadow structures built on them.
//!
//! Every shadow table is backed by a page of parent guest memory, which in
//! turn is backed by a host page. When that host page changes, the shadow
//! structures derived from it must be torn down. The [`RmapStore`] records,
//! per host page, which shadow slots to revisit, each tagged with the level
//! of the slot so teardown knows how much to remove.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::table::{Level, PAGE_SHIFT};

/// Level of the shadow-table slot a reverse-map entry points back to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RmapTag {
    Region1,
    Region2,
    Region3,
    Segment,
    PageTable,
}

impl RmapTag {
    /// The slot level this tag names.
    pub fn level(self) -> Level {
        match self {
            RmapTag::Region1 => Level::Region1,
            RmapTag::Region2 => Level::Region2,
            RmapTag::Region3 => Level::Region3,
            RmapTag::Segment => Level::Segment,
            RmapTag::PageTable => Level::PageTable,
        }
    }

    pub(crate) fn for_level(level: Level) -> RmapTag {
        match level {
            Level::Region1 => RmapTag::Region1,
            Level::Region2 => RmapTag::Region2,
            Level::Region3 => RmapTag::Region3,
            Level::Segment => RmapTag::Segment,
            Level::PageTable => RmapTag::PageTable,
        }
    }
}

/// One reverse-map record: the shadow guest address whose slot depends on
/// the host page, and the level of that slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RmapEntry {
    pub raddr: u64,
    pub tag: RmapTag,
}

/// Per-space reverse-map store, keyed by host page index.
pub struct RmapStore {
    map: BTreeMap<u64, Vec<RmapEntry>>,
}

impl RmapStore {
    pub fn new() -> Self {
        Self { map: BTreeMap::new() }
    }

    /// Records that the shadow slot at `entry` depends on the host page
    /// containing `haddr`. Inserting an identical record twice is a no-op.
    pub fn insert(&mut self, haddr: u64, entry: RmapEntry) {
        let list = self.map.entry(haddr >> PAGE_SHIFT).or_default();
        if !list.contains(&entry) {
            list.push(entry);
        }
    }

    /// Removes and returns every record for the host page containing `haddr`.
    pub fn take(&mut self, haddr: u64) -> Vec<RmapEntry> {
        self.map.remove(&(haddr >> PAGE_SHIFT)).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drops every record, a bounded batch of host pages at a time.
    pub fn clear(&mut self) {
        const BATCH: usize = 16;
        let mut keys = [0u64; BATCH];
        loop {
            let mut n = 0;
            for (&key, _) in self.map.iter().take(BATCH) {
                keys[n] = key;
                n += 1;
            }
            if n == 0 {
                break;
            }
            for &key in &keys[..n] {
                self.map.remove(&key);
            }
        }
    }
}

impl Default for RmapStore {
    fn default() -> Self {
        Self::new()
    }
}
