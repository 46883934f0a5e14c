//! Guest address spaces and their translation hierarchies.
//!
//! An [`AddressSpace`] owns a multi-level translation hierarchy built lazily
//! as guest addresses are linked to host memory. Regular spaces map guest
//! segments onto host segments and share the host's page descriptors at the
//! bottom level; shadow spaces (see the shadow operations on this type)
//! mirror translation structures that live in another space's guest memory.
//!
//! Lock order, outermost first: host fault lock, host segment lock, then
//! this space's `inner` lock. The parent's `children` lock is taken before
//! any child's `inner` lock, and never while the parent's `inner` is held.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::address::{GuestAddress, HostAddress};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::host::{HostContext, HostSegmentState};
use crate::rmap::RmapStore;
use crate::table::{
    Level, PAGE_SIZE, SEGMENT_SIZE, TableArena, TableHandle, root_level_for_limit,
};

/// Identifies the root structure of a nested guest's own translation setup,
/// as read from that guest's control state by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootDescriptor {
    /// Guest address of the top-level table in the parent space.
    pub origin: u64,
    /// Level the top-level table is indexed at.
    pub level: Level,
    /// The nested guest runs without translation; the shadow mirrors an
    /// identity layout and `origin` does not name real table memory.
    pub real_space: bool,
}

impl RootDescriptor {
    /// Byte span the top-level table occupies in the parent, page aligned.
    pub(crate) fn table_span(&self) -> u64 {
        let span = self.level.table_bytes();
        if span < PAGE_SIZE { PAGE_SIZE } else { span }
    }

    /// Whether `gaddr` falls inside the top-level table itself. A write
    /// there invalidates the whole shadow, not an individual slot.
    pub(crate) fn covers(&self, gaddr: u64) -> bool {
        if self.real_space {
            return false;
        }
        let start = self.origin & !(PAGE_SIZE - 1);
        gaddr >= start && gaddr < start + self.table_span()
    }
}

/// Links a shadow space to the space whose guest memory it mirrors.
pub(crate) struct ShadowLink {
    pub(crate) parent: Arc<AddressSpace>,
    pub(crate) descriptor: RootDescriptor,
}

/// State guarded by the per-space lock.
pub(crate) struct SpaceInner {
    pub(crate) arena: TableArena,
    pub(crate) root: TableHandle,
    /// Guest segment index to host segment base.
    pub(crate) guest_to_host: BTreeMap<u64, u64>,
    /// Host segment index to guest segment base.
    pub(crate) host_to_guest: BTreeMap<u64, u64>,
    pub(crate) rmap: RmapStore,
    pub(crate) removed: bool,
}

/// A guest address space: the central object of the translation engine.
pub struct AddressSpace {
    id: u64,
    host: Arc<HostContext>,
    limit: u64,
    root_level: Level,
    pub(crate) inner: Mutex<SpaceInner>,
    pub(crate) children: Mutex<Vec<Arc<AddressSpace>>>,
    pub(crate) shadow: Option<ShadowLink>,
}

impl AddressSpace {
    pub(crate) fn build(
        host: Arc<HostContext>,
        root_level: Level,
        limit: u64,
        shadow: Option<ShadowLink>,
    ) -> Result<AddressSpace> {
        let mut arena = TableArena::new(host.config().max_tables);
        let root = arena.alloc(root_level)?;
        Ok(AddressSpace {
            id: host.allocate_space_id(),
            host,
            limit,
            root_level,
            inner: Mutex::new(SpaceInner {
                arena,
                root,
                guest_to_host: BTreeMap::new(),
                host_to_guest: BTreeMap::new(),
                rmap: RmapStore::new(),
                removed: false,
            }),
            children: Mutex::new(Vec::new()),
            shadow,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Highest guest address this space translates, inclusive.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn root_level(&self) -> Level {
        self.root_level
    }

    pub fn is_shadow(&self) -> bool {
        self.shadow.is_some()
    }

    /// The space whose guest memory this shadow mirrors.
    pub fn parent(&self) -> Option<Arc<AddressSpace>> {
        self.shadow.as_ref().map(|link| link.parent.clone())
    }

    pub fn shadow_descriptor(&self) -> Option<RootDescriptor> {
        self.shadow.as_ref().map(|link| link.descriptor)
    }

    pub fn host(&self) -> &Arc<HostContext> {
        &self.host
    }

    /// Whether this space has been removed. A removed space rejects every
    /// translation operation; remaining references only keep memory alive.
    pub fn is_removed(&self) -> bool {
        self.inner.lock().removed
    }

    /// Number of live translation tables, for diagnostics.
    pub fn table_count(&self) -> usize {
        self.inner.lock().arena.live()
    }

    /// Walks the hierarchy to the slot covering `gaddr` in the table indexed
    /// at `target`. Returns `None` if the space is removed, the address is
    /// out of range, the hierarchy is too shallow, or an intermediate entry
    /// is missing or invalid. The slot itself is returned regardless of its
    /// content.
    pub(crate) fn walk(
        &self,
        inner: &SpaceInner,
        gaddr: u64,
        target: Level,
    ) -> Option<(TableHandle, usize)> {
        if inner.removed || gaddr > self.limit || target > self.root_level {
            return None;
        }
        let mut level = self.root_level;
        let mut handle = inner.root;
        loop {
            let idx = level.index_of(gaddr);
            if level == target {
                return Some((handle, idx));
            }
            let entry = inner.arena.get(handle).entry(idx);
            if entry.is_invalid() {
                return None;
            }
            if level == Level::Segment && (!self.is_shadow() || entry.is_large()) {
                // Regular spaces bottom out at the segment level; the page
                // descriptors below belong to the host.
                return None;
            }
            handle = entry.table_handle()?;
            level = level.child()?;
        }
    }

    pub(crate) fn translate_raw(&self, gaddr: u64) -> Result<u64> {
        let inner = self.inner.lock();
        match inner.guest_to_host.get(&(gaddr >> Level::Segment.shift())) {
            Some(&host_base) => Ok(host_base + (gaddr & (SEGMENT_SIZE - 1))),
            None => Err(Error::NotMapped),
        }
    }

    /// Translates a guest address through the segment connections.
    ///
    /// This reports where the address *would* land; it does not build
    /// translation structures. Use [`fault`](Self::fault) for that.
    pub fn translate(&self, guest: GuestAddress) -> Result<HostAddress> {
        self.translate_raw(guest.as_u64()).map(HostAddress::new)
    }

    /// Connects a range of guest segments to a range of host segments.
    ///
    /// Everything previously mapped in the guest range is dropped first.
    /// Addresses and length must be segment aligned and the guest range must
    /// fit below the configured limit.
    pub fn map_range(&self, guest: GuestAddress, host: HostAddress, len: u64) -> Result<()> {
        if self.is_shadow() {
            return Err(Error::InvalidArgument);
        }
        if len == 0
            || !guest.is_aligned(SEGMENT_SIZE)
            || !host.is_aligned(SEGMENT_SIZE)
            || len & (SEGMENT_SIZE - 1) != 0
            || guest.as_u64().checked_add(len).is_none()
            || host.as_u64().checked_add(len).is_none()
            || guest.as_u64() + len - 1 > self.limit
        {
            return Err(Error::InvalidArgument);
        }

        let _guard = self.host.fault_lock().write();
        let mut flush = false;
        {
            let mut inner = self.inner.lock();
            if inner.removed {
                return Err(Error::Again);
            }
            let mut off = 0;
            while off < len {
                let gaddr = guest.as_u64() + off;
                flush |= self.unmap_one(&mut inner, gaddr);
                inner
                    .guest_to_host
                    .insert(gaddr >> Level::Segment.shift(), host.as_u64() + off);
                off += SEGMENT_SIZE;
            }
        }
        if flush {
            self.host.platform().flush_space(self.id);
        }
        log::trace!(
            "space {}: mapped guest {guest} +{len:#x} to host {host}",
            self.id
        );
        Ok(())
    }

    /// Drops the segment connections in a guest range.
    pub fn unmap_range(&self, guest: GuestAddress, len: u64) -> Result<()> {
        if self.is_shadow() {
            return Err(Error::InvalidArgument);
        }
        if len == 0 || !guest.is_aligned(SEGMENT_SIZE) || len & (SEGMENT_SIZE - 1) != 0 {
            return Err(Error::InvalidArgument);
        }

        let _guard = self.host.fault_lock().write();
        let mut flush = false;
        {
            let mut inner = self.inner.lock();
            let mut off = 0;
            while off < len {
                flush |= self.unmap_one(&mut inner, guest.as_u64() + off);
                off += SEGMENT_SIZE;
            }
        }
        if flush {
            self.host.platform().flush_space(self.id);
        }
        Ok(())
    }

    /// Drops one segment connection. Returns whether a live table entry was
    /// cleared, i.e. whether cached translations need flushing.
    fn unmap_one(&self, inner: &mut SpaceInner, gaddr: u64) -> bool {
        let gidx = gaddr >> Level::Segment.shift();
        let Some(host_base) = inner.guest_to_host.remove(&gidx) else {
            return false;
        };
        inner
            .host_to_guest
            .remove(&(host_base >> Level::Segment.shift()));
        if let Some((table, idx)) = self.walk(inner, gaddr, Level::Segment) {
            let entry = inner.arena.get(table).entry(idx);
            if !entry.is_empty() {
                inner.arena.get_mut(table).set_entry(idx, Entry::EMPTY);
                return true;
            }
        }
        false
    }

    pub(crate) fn link_raw(&self, gaddr: u64, haddr: u64) -> Result<()> {
        if self.is_shadow() || gaddr > self.limit {
            return Err(Error::InvalidArgument);
        }
        // The page layout within the segment is shared with the host, so
        // the two addresses must agree below the segment boundary.
        if (gaddr ^ haddr) & (SEGMENT_SIZE - 1) != 0 {
            return Err(Error::InvalidArgument);
        }

        // Build intermediate tables down to the segment table.
        let (seg_table, seg_idx) = {
            let mut inner = self.inner.lock();
            if inner.removed {
                return Err(Error::Again);
            }
            let mut level = self.root_level;
            let mut handle = inner.root;
            while level != Level::Segment {
                let idx = level.index_of(gaddr);
                let entry = inner.arena.get(handle).entry(idx);
                let child_level = match level.child() {
                    Some(l) => l,
                    None => return Err(Error::InvalidArgument),
                };
                handle = match entry.table_handle() {
                    Some(child) => child,
                    None => {
                        let child = inner.arena.alloc(child_level)?;
                        inner
                            .arena
                            .get_mut(handle)
                            .set_entry(idx, Entry::next_table(child));
                        child
                    }
                };
                level = child_level;
            }
            (handle, Level::Segment.index_of(gaddr))
        };

        let host_base = haddr & Level::Segment.mask();
        let segment = self.host.segment(host_base).ok_or(Error::Fault)?;
        let state = segment.lock();
        let large = matches!(*state, HostSegmentState::Large { .. });
        if large && !self.host.config().allow_large_pages {
            return Err(Error::Fault);
        }

        let mut inner = self.inner.lock();
        if inner.removed {
            return Err(Error::Again);
        }
        let entry = inner.arena.get(seg_table).entry(seg_idx);
        if entry.is_empty() {
            inner
                .host_to_guest
                .insert(host_base >> Level::Segment.shift(), gaddr & Level::Segment.mask());
            let new = match &*state {
                HostSegmentState::Large { writable, .. } => Entry::host(host_base)
                    .large()
                    .protected(!*writable)
                    .uncommitted(true),
                HostSegmentState::Tables { .. } => Entry::host(host_base),
            };
            inner.arena.get_mut(seg_table).set_entry(seg_idx, new);
            Ok(())
        } else if entry.host_address() == host_base && entry.is_large() == large {
            if let HostSegmentState::Large { writable, .. } = &*state {
                if entry.is_invalid() {
                    // The leaf was parked invalid by an access revocation;
                    // the fault bringing us back here makes it live again.
                    self.segment_xchg(
                        &mut inner,
                        seg_table,
                        seg_idx,
                        gaddr,
                        Entry::host(host_base)
                            .large()
                            .protected(!*writable)
                            .uncommitted(true),
                    );
                } else if *writable && entry.is_protected() {
                    // The host block became writable again; lift the stale
                    // protection and treat the segment as dirty.
                    self.segment_xchg(
                        &mut inner,
                        seg_table,
                        seg_idx,
                        gaddr,
                        entry.protected(false).uncommitted(true),
                    );
                }
            }
            Ok(())
        } else {
            log::debug!(
                "space {}: link conflict at guest {gaddr:#x}, host {host_base:#x}",
                self.id
            );
            Err(Error::Conflict)
        }
    }

    /// Wires the segment covering `guest` into the translation hierarchy,
    /// pointing it at the host segment covering `host`.
    ///
    /// The two addresses must be congruent modulo the segment size and the
    /// host segment must be populated; use [`fault`](Self::fault) unless the
    /// host address is already known and resident.
    pub fn link(&self, guest: GuestAddress, host: HostAddress) -> Result<()> {
        self.link_raw(guest.as_u64(), host.as_u64())
    }

    /// Resolves a guest fault: makes the backing host page resident and
    /// wires the segment into the hierarchy.
    pub fn fault(&self, guest: GuestAddress, write: bool) -> Result<()> {
        use crate::protect::Protection;

        let _guard = self.host.fault_lock().read();
        let haddr = self.translate_raw(guest.as_u64())?;
        let access = if write { Protection::Write } else { Protection::Read };
        self.host.fault_in(haddr & !(PAGE_SIZE - 1), access)?;
        self.link_raw(guest.as_u64(), haddr)
    }

    /// Detaches the space: no further translations, structures released.
    ///
    /// Shadows built on this space are invalidated first. Outstanding
    /// references stay safe to hold; they observe a removed space.
    pub fn remove(self: &Arc<Self>) {
        if self.is_shadow() {
            self.destroy_shadow();
            return;
        }
        let children: Vec<_> = core::mem::take(&mut *self.children.lock());
        for child in &children {
            child.unshadow();
        }
        self.host.detach(self);
        {
            let mut inner = self.inner.lock();
            inner.removed = true;
            inner.guest_to_host.clear();
            inner.host_to_guest.clear();
            inner.rmap.clear();
        }
        self.host.platform().flush_space(self.id);
        log::trace!("space {}: removed", self.id);
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.host.platform().flush_space(self.id);
    }
}

/// Chooses hierarchy depth for a limit and builds a regular space.
pub(crate) fn create_space(host: &Arc<HostContext>, limit: u64) -> Result<Arc<AddressSpace>> {
    let (root_level, limit) = root_level_for_limit(limit);
    let space = Arc::new(AddressSpace::build(host.clone(), root_level, limit, None)?);
    host.attach(&space);
    log::trace!(
        "space {}: created, root {:?}, limit {:#x}",
        space.id(),
        root_level,
        limit
    );
    Ok(space)
}
