//! Host context: the outer environment guest address spaces attach to.
//!
//! The [`HostContext`] owns the list of attached spaces, the notifier
//! registry, the injected platform invalidation hooks, and a scale model of
//! the host MMU: segment descriptors with per-page state behind a
//! per-segment lock. Host-side changes (unmap, write-unprotect) enter the
//! engine here and fan out to the attached spaces and their shadows.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard, RwLock};

use crate::address::HostAddress;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::notifier::NotifierRegistry;
use crate::platform::InvalidationOps;
use crate::protect::{Notify, Protection};
use crate::space::{self, AddressSpace};
use crate::table::{Level, PAGE_SIZE, PAGE_TABLE_ENTRIES, SEGMENT_SIZE};

/// Host-side configuration, fixed at context creation.
#[derive(Clone, Debug)]
pub struct HostConfig {
    /// Allow guest segments to be backed by large host blocks.
    pub allow_large_pages: bool,
    /// Translation-table budget per address space.
    pub max_tables: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            allow_large_pages: false,
            max_tables: 4096,
        }
    }
}

/// Which attached space, if any, is unambiguously the active one.
enum ActiveRoot {
    None,
    Sole(u64),
    Ambiguous,
}

/// Per-page host state.
#[derive(Clone, Copy, Default)]
pub(crate) struct HostPte {
    pub(crate) present: bool,
    pub(crate) writable: bool,
    /// Re-enter the notifier bus when this page's protection changes.
    pub(crate) notify_fixup: bool,
    /// Re-enter shadow teardown when this page changes.
    pub(crate) notify_shadow: bool,
    pub(crate) dirty: bool,
}

/// State of one host segment: either a contiguous large block or an array
/// of per-page descriptors shared with the guest spaces linked to it.
pub(crate) enum HostSegmentState {
    Large { writable: bool, dirty: bool },
    Tables { ptes: Box<[HostPte]> },
}

/// One host segment behind its own lock. This lock doubles as the
/// page-granular lock for every guest segment linked to it.
pub(crate) struct HostSegment {
    inner: Mutex<HostSegmentState>,
}

impl HostSegment {
    fn tables() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HostSegmentState::Tables {
                ptes: vec![HostPte::default(); PAGE_TABLE_ENTRIES].into_boxed_slice(),
            }),
        })
    }

    fn large(writable: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HostSegmentState::Large {
                writable,
                dirty: false,
            }),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HostSegmentState> {
        self.inner.lock()
    }
}

/// Forces host-page protection down to `prot` and arms the requested
/// notification bits. Fails with [`Error::Again`] if the page is not
/// resident; the caller is expected to fault it in and retry.
pub(crate) fn force_prot(pte: &mut HostPte, prot: Protection, notify: Notify) -> Result<()> {
    if !pte.present {
        return Err(Error::Again);
    }
    match prot {
        Protection::None => {
            pte.present = false;
            pte.writable = false;
        }
        Protection::Read => pte.writable = false,
        Protection::Write => return Err(Error::InvalidArgument),
    }
    if notify.contains(Notify::MPROT) {
        pte.notify_fixup = true;
    }
    if notify.contains(Notify::SHADOW) {
        pte.notify_shadow = true;
    }
    Ok(())
}

/// Makes host pages resident on demand.
///
/// Injected so the environment controls residency policy; the default,
/// [`PopulateOnFault`], simply populates the page in the emulated host MMU.
pub trait FaultHandler: Send + Sync {
    fn fault_in(&self, host: &HostContext, haddr: u64, access: Protection) -> Result<()>;
}

/// Default fault handler: populate the page, write-unprotecting if needed.
pub struct PopulateOnFault;

impl FaultHandler for PopulateOnFault {
    fn fault_in(&self, host: &HostContext, haddr: u64, access: Protection) -> Result<()> {
        host.populate(haddr, access)
    }
}

/// The host environment shared by a set of guest address spaces.
pub struct HostContext {
    config: HostConfig,
    /// Serializes structural host changes against fault handling. Fault and
    /// protection paths take the read side; bulk remapping takes the write
    /// side.
    fault_lock: RwLock<()>,
    spaces: RwLock<Vec<Arc<AddressSpace>>>,
    active_root: Mutex<ActiveRoot>,
    segments: RwLock<BTreeMap<u64, Arc<HostSegment>>>,
    notifiers: NotifierRegistry,
    platform: Arc<dyn InvalidationOps>,
    fault_handler: Box<dyn FaultHandler>,
    next_space_id: AtomicU64,
}

impl HostContext {
    pub fn new(config: HostConfig, platform: Arc<dyn InvalidationOps>) -> Arc<Self> {
        Self::with_fault_handler(config, platform, Box::new(PopulateOnFault))
    }

    pub fn with_fault_handler(
        config: HostConfig,
        platform: Arc<dyn InvalidationOps>,
        fault_handler: Box<dyn FaultHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            fault_lock: RwLock::new(()),
            spaces: RwLock::new(Vec::new()),
            active_root: Mutex::new(ActiveRoot::None),
            segments: RwLock::new(BTreeMap::new()),
            notifiers: NotifierRegistry::new(),
            platform,
            fault_handler,
            next_space_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn notifiers(&self) -> &NotifierRegistry {
        &self.notifiers
    }

    pub fn platform(&self) -> &Arc<dyn InvalidationOps> {
        &self.platform
    }

    pub(crate) fn fault_lock(&self) -> &RwLock<()> {
        &self.fault_lock
    }

    pub(crate) fn allocate_space_id(&self) -> u64 {
        self.next_space_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Creates an address space able to translate guest addresses up to at
    /// least `limit` and attaches it to this context.
    pub fn create_space(self: &Arc<Self>, limit: u64) -> Result<Arc<AddressSpace>> {
        space::create_space(self, limit)
    }

    /// Snapshot of the attached spaces. Holders of the snapshot may use the
    /// spaces freely; a space removed concurrently stays valid and reports
    /// itself removed.
    pub fn spaces(&self) -> Vec<Arc<AddressSpace>> {
        self.spaces.read().clone()
    }

    /// The id of the sole attached space, or `None` when there is no
    /// attached space or more than one.
    pub fn active_space(&self) -> Option<u64> {
        match *self.active_root.lock() {
            ActiveRoot::Sole(id) => Some(id),
            _ => None,
        }
    }

    pub(crate) fn attach(&self, space: &Arc<AddressSpace>) {
        let mut spaces = self.spaces.write();
        spaces.push(space.clone());
        self.recompute_active(&spaces);
    }

    pub(crate) fn detach(&self, space: &Arc<AddressSpace>) {
        let mut spaces = self.spaces.write();
        spaces.retain(|s| !Arc::ptr_eq(s, space));
        self.recompute_active(&spaces);
    }

    fn recompute_active(&self, spaces: &[Arc<AddressSpace>]) {
        *self.active_root.lock() = match spaces {
            [] => ActiveRoot::None,
            [sole] => ActiveRoot::Sole(sole.id()),
            _ => ActiveRoot::Ambiguous,
        };
    }

    pub(crate) fn segment(&self, base: u64) -> Option<Arc<HostSegment>> {
        self.segments
            .read()
            .get(&(base >> Level::Segment.shift()))
            .cloned()
    }

    fn ensure_segment(&self, base: u64) -> Arc<HostSegment> {
        self.segments
            .write()
            .entry(base >> Level::Segment.shift())
            .or_insert_with(HostSegment::tables)
            .clone()
    }

    /// Populates one host page for test setup or explicit pre-faulting.
    pub fn map_page(&self, host: HostAddress, writable: bool) {
        let haddr = host.as_u64();
        let segment = self.ensure_segment(haddr & Level::Segment.mask());
        let mut state = segment.lock();
        if let HostSegmentState::Tables { ptes } = &mut *state {
            ptes[Level::PageTable.index_of(haddr)] = HostPte {
                present: true,
                writable,
                ..HostPte::default()
            };
        }
    }

    /// Backs a host segment with a contiguous large block.
    pub fn map_large_segment(&self, host: HostAddress, writable: bool) {
        self.segments.write().insert(
            host.as_u64() >> Level::Segment.shift(),
            HostSegment::large(writable),
        );
    }

    pub(crate) fn fault_in(&self, haddr: u64, access: Protection) -> Result<()> {
        self.fault_handler.fault_in(self, haddr, access)
    }

    /// Makes the page containing `haddr` resident for the given access,
    /// lifting write protection if necessary. A lifted protection is a
    /// translation change and is dispatched as such.
    pub(crate) fn populate(&self, haddr: u64, access: Protection) -> Result<()> {
        let segment = self.ensure_segment(haddr & Level::Segment.mask());
        let mut fired = (false, false);
        {
            let mut state = segment.lock();
            match &mut *state {
                HostSegmentState::Large { writable, dirty } => {
                    if access == Protection::Write {
                        if !*writable {
                            return Err(Error::Fault);
                        }
                        *dirty = true;
                    }
                }
                HostSegmentState::Tables { ptes } => {
                    let pte = &mut ptes[Level::PageTable.index_of(haddr)];
                    if !pte.present {
                        pte.present = true;
                        pte.writable = access == Protection::Write;
                        if access == Protection::Write {
                            pte.dirty = true;
                        }
                    } else if access == Protection::Write {
                        if !pte.writable {
                            fired = (pte.notify_fixup, pte.notify_shadow);
                            pte.notify_fixup = false;
                            pte.notify_shadow = false;
                            pte.writable = true;
                        }
                        pte.dirty = true;
                    }
                }
            }
        }
        if fired.0 || fired.1 {
            self.pte_changed(haddr & !(PAGE_SIZE - 1), fired.0, fired.1);
        }
        Ok(())
    }

    /// A host-side store to the page containing `haddr`. Populates and
    /// write-unprotects as a real store through the host mapping would.
    pub fn write_page(&self, host: HostAddress) -> Result<()> {
        self.populate(host.as_u64(), Protection::Write)
    }

    /// Removes one host page. Guest structures built on it are notified
    /// and shadows derived from it are torn down.
    pub fn unmap_page(&self, host: HostAddress) {
        let haddr = host.as_u64();
        let Some(segment) = self.segment(haddr & Level::Segment.mask()) else {
            return;
        };
        let fired;
        {
            let mut state = segment.lock();
            let HostSegmentState::Tables { ptes } = &mut *state else {
                return;
            };
            let pte = &mut ptes[Level::PageTable.index_of(haddr)];
            fired = (pte.present && pte.notify_fixup, pte.present && pte.notify_shadow);
            *pte = HostPte::default();
        }
        if fired.0 || fired.1 {
            self.pte_changed(haddr & !(PAGE_SIZE - 1), fired.0, fired.1);
        }
    }

    /// Fans a host page change out to the attached spaces: shadow teardown
    /// first, then the notifier bus. Runs with no locks held.
    pub(crate) fn pte_changed(&self, haddr: u64, fixup: bool, shadow: bool) {
        if !fixup && !shadow {
            return;
        }
        for space in self.spaces() {
            let gaddr = {
                let inner = space.inner.lock();
                match inner
                    .host_to_guest
                    .get(&(haddr >> Level::Segment.shift()))
                {
                    Some(&gbase) => gbase + (haddr & (SEGMENT_SIZE - 1)),
                    None => continue,
                }
            };
            if shadow {
                let children: Vec<_> = space.children.lock().clone();
                let mut prune = false;
                for child in &children {
                    child.shadow_notify(haddr, gaddr);
                    prune |= child.is_removed();
                }
                if prune {
                    space.children.lock().retain(|c| !c.is_removed());
                }
            }
            if fixup {
                let page = gaddr & !(PAGE_SIZE - 1);
                self.notifiers.notify(&space, page, page + PAGE_SIZE - 1);
            }
        }
    }

    /// Invalidates a whole host segment: every attached space drops its
    /// reverse lookup and segment entry, with break-before-make against the
    /// platform. `local` selects the non-broadcast invalidation primitive.
    pub fn invalidate_segment(&self, host: HostAddress, local: bool) {
        let haddr = host.as_u64() & Level::Segment.mask();
        for space in self.spaces() {
            let mut inner = space.inner.lock();
            let Some(gbase) = inner
                .host_to_guest
                .remove(&(haddr >> Level::Segment.shift()))
            else {
                continue;
            };
            let Some((table, idx)) = space.walk(&inner, gbase, Level::Segment) else {
                continue;
            };
            let entry = inner.arena.get(table).entry(idx);
            if entry.is_empty() {
                continue;
            }
            if entry.is_notify() {
                self.notifiers
                    .notify(&space, gbase, gbase + SEGMENT_SIZE - 1);
            }
            let stale = entry.invalid();
            inner.arena.get_mut(table).set_entry(idx, stale);
            if local {
                self.platform.invalidate_entry_local(gbase, stale.raw());
                self.platform.flush_space(space.id());
            } else {
                self.platform.invalidate_entry(gbase, stale.raw());
            }
            inner.arena.get_mut(table).set_entry(idx, Entry::EMPTY);
        }
    }

    /// Disconnects a freed host segment from every attached space. No
    /// notification: the host structure is gone, not changed.
    pub fn unlink_segment(&self, host: HostAddress) {
        let haddr = host.as_u64() & Level::Segment.mask();
        for space in self.spaces() {
            let mut flush = false;
            {
                let mut inner = space.inner.lock();
                let Some(gbase) = inner
                    .host_to_guest
                    .remove(&(haddr >> Level::Segment.shift()))
                else {
                    continue;
                };
                if let Some((table, idx)) = space.walk(&inner, gbase, Level::Segment) {
                    if !inner.arena.get(table).entry(idx).is_empty() {
                        inner.arena.get_mut(table).set_entry(idx, Entry::EMPTY);
                        flush = true;
                    }
                }
            }
            if flush {
                self.platform.flush_space(space.id());
            }
        }
    }
}
