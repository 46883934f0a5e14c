//! Shadow address spaces for nested guests.
//!
//! A shadow space mirrors translation structures that a nested guest keeps
//! in its parent's guest memory. Each shadow table is built on demand,
//! validated against the parent only after the backing parent pages are
//! write-protected, and torn down the moment any of those pages changes.
//! The reverse map ties host pages back to the shadow slots built on them.

use alloc::sync::Arc;

use crate::address::GuestAddress;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::host::{HostSegmentState, force_prot};
use crate::protect::{Notify, Protection};
use crate::rmap::{RmapEntry, RmapTag};
use crate::space::{AddressSpace, RootDescriptor, ShadowLink, SpaceInner};
use crate::table::{Level, PAGE_SIZE, ShadowOrigin, TableHandle};

/// Describes the parent-side table a shadow table will mirror, as read from
/// the nested guest's parent entry.
#[derive(Clone, Copy, Debug)]
pub struct ParentTable {
    /// Guest address of the table in the parent space.
    pub origin: u64,
    /// The parent entry carries protection; the shadow entry inherits it.
    pub protected: bool,
    /// No table exists in the parent; mirror a contiguous identity range.
    pub fake: bool,
}

impl AddressSpace {
    /// Returns a shadow space mirroring the nested root named by
    /// `descriptor`, creating it if no equivalent shadow exists.
    ///
    /// Unless the descriptor names a real-space (identity) root, the
    /// top-level table in the parent is write-protected first; any later
    /// write to it invalidates the entire shadow.
    pub fn new_shadow(self: &Arc<Self>, descriptor: RootDescriptor) -> Result<Arc<AddressSpace>> {
        if self.is_shadow() || descriptor.level == Level::PageTable {
            return Err(Error::InvalidArgument);
        }
        if let Some(existing) = self.find_shadow(&descriptor) {
            return Ok(existing);
        }
        if !descriptor.real_space {
            self.protect_range(
                GuestAddress::new(descriptor.origin & !(PAGE_SIZE - 1)),
                descriptor.table_span(),
                Protection::Read,
                Notify::SHADOW,
            )?;
        }
        let limit = match descriptor.level.parent() {
            Some(parent) => parent.entry_size() - 1,
            None => u64::MAX,
        };
        let space = Arc::new(AddressSpace::build(
            self.host().clone(),
            descriptor.level,
            limit,
            Some(ShadowLink {
                parent: self.clone(),
                descriptor,
            }),
        )?);

        let mut children = self.children.lock();
        // Someone may have built the same shadow while we protected.
        if let Some(existing) = children
            .iter()
            .find(|c| c.shadow_descriptor() == Some(descriptor) && !c.is_removed())
        {
            return Ok(existing.clone());
        }
        children.push(space.clone());
        log::trace!(
            "space {}: shadow {} created for root {:#x} ({:?})",
            self.id(),
            space.id(),
            descriptor.origin,
            descriptor.level
        );
        Ok(space)
    }

    /// Finds an existing, still valid shadow of the given nested root.
    pub fn find_shadow(&self, descriptor: &RootDescriptor) -> Option<Arc<AddressSpace>> {
        self.children
            .lock()
            .iter()
            .find(|c| c.shadow_descriptor().as_ref() == Some(descriptor) && !c.is_removed())
            .cloned()
    }

    /// Detaches this shadow from its parent and invalidates it.
    pub fn destroy_shadow(self: &Arc<Self>) {
        let Some(link) = self.shadow.as_ref() else {
            return;
        };
        link.parent
            .children
            .lock()
            .retain(|c| !Arc::ptr_eq(c, self));
        self.unshadow();
        log::trace!("space {}: shadow destroyed", self.id());
    }

    /// Builds the shadow table indexed at `level` for `saddr`, mirroring
    /// the parent table described by `parent`.
    ///
    /// The containing shadow table must already exist ([`Error::Again`]
    /// otherwise, resolved by building top-down). The new table only
    /// becomes visible to translation after the parent pages holding the
    /// mirrored table are write-protected; fake tables have no parent
    /// memory and are valid immediately.
    pub fn shadow_level(
        &self,
        saddr: GuestAddress,
        parent: ParentTable,
        level: Level,
    ) -> Result<()> {
        if !self.is_shadow() {
            return Err(Error::InvalidArgument);
        }
        let saddr = saddr.as_u64();
        let slot_level = level.parent().ok_or(Error::InvalidArgument)?;

        let new_handle = {
            let mut inner = self.inner.lock();
            if inner.removed {
                return Err(Error::Again);
            }
            let (table, idx) = self.walk(&inner, saddr, slot_level).ok_or(Error::Again)?;
            let entry = inner.arena.get(table).entry(idx);
            if !entry.is_invalid() {
                // Already built and validated.
                return Ok(());
            }
            if entry.has_payload() {
                // Mid-validation on another thread.
                return Err(Error::Again);
            }
            let handle = inner.arena.alloc(level)?;
            inner.arena.get_mut(handle).set_origin(ShadowOrigin {
                origin: parent.origin,
                fake: parent.fake,
            });
            let installed = Entry::next_table(handle)
                .invalid()
                .protected(parent.protected);
            if parent.fake {
                inner.arena.get_mut(table).set_entry(idx, installed.valid());
                return Ok(());
            }
            inner.arena.get_mut(table).set_entry(idx, installed);
            handle
        };

        let raddr = saddr & slot_level.mask();
        let span = level.table_bytes().max(PAGE_SIZE);
        let rc = self.protect_rmap(
            raddr,
            RmapTag::for_level(slot_level),
            parent.origin & !(PAGE_SIZE - 1),
            span,
        );

        let mut inner = self.inner.lock();
        match rc {
            Ok(()) => {
                let Some((table, idx)) = self.walk(&inner, saddr, slot_level) else {
                    return Err(Error::Again);
                };
                let entry = inner.arena.get(table).entry(idx);
                if entry.table_handle() != Some(new_handle) {
                    // Torn down while we were protecting.
                    return Err(Error::Again);
                }
                inner.arena.get_mut(table).set_entry(idx, entry.valid());
                Ok(())
            }
            Err(e) => {
                self.unshadow_slot(&mut inner, slot_level, raddr);
                Err(e)
            }
        }
    }

    /// Installs one shadow page translation: `saddr` in this shadow maps to
    /// the host page backing `paddr` in the parent, read-only if either the
    /// nested guest or the parent page demands it.
    ///
    /// The covering shadow page table must already exist.
    pub fn shadow_page(&self, saddr: GuestAddress, paddr: u64, protect: bool) -> Result<()> {
        let Some(link) = self.shadow.as_ref() else {
            return Err(Error::InvalidArgument);
        };
        let parent = link.parent.clone();
        let saddr = saddr.as_u64() & !(PAGE_SIZE - 1);
        let paddr = paddr & !(PAGE_SIZE - 1);

        let _guard = self.host().fault_lock().read();
        loop {
            // The covering shadow page table must exist; parent-side
            // faulting cannot conjure it.
            {
                let inner = self.inner.lock();
                if inner.removed {
                    return Err(Error::Again);
                }
                self.walk(&inner, saddr, Level::PageTable)
                    .ok_or(Error::Again)?;
            }
            let vmaddr = parent.translate_raw(paddr).map_err(|_| Error::Fault)?;
            let vm_page = vmaddr & !(PAGE_SIZE - 1);
            match self.try_shadow_page(saddr, vm_page, protect) {
                Err(Error::Again) => parent.fixup(paddr, vm_page, Protection::Read)?,
                other => return other,
            }
        }
    }

    fn try_shadow_page(&self, saddr: u64, vm_page: u64, protect: bool) -> Result<()> {
        let segment = self
            .host()
            .segment(vm_page & Level::Segment.mask())
            .ok_or(Error::Again)?;
        let mut state = segment.lock();
        let mut inner = self.inner.lock();
        if inner.removed {
            return Err(Error::Again);
        }
        let (table, idx) = self
            .walk(&inner, saddr, Level::PageTable)
            .ok_or(Error::Again)?;
        let existing = inner.arena.get(table).entry(idx);
        if !existing.is_invalid() {
            return if existing.host_address() == vm_page {
                Ok(())
            } else {
                Err(Error::Again)
            };
        }
        let host_readonly = match &mut *state {
            HostSegmentState::Tables { ptes } => {
                let pte = &mut ptes[Level::PageTable.index_of(vm_page)];
                if !pte.present {
                    return Err(Error::Again);
                }
                // Arm change tracking; the page itself stays writable.
                pte.notify_shadow = true;
                !pte.writable
            }
            HostSegmentState::Large { .. } => return Err(Error::Fault),
        };
        inner
            .arena
            .get_mut(table)
            .set_entry(idx, Entry::host(vm_page).protected(protect || host_readonly));
        inner.rmap.insert(
            vm_page,
            RmapEntry {
                raddr: saddr,
                tag: RmapTag::PageTable,
            },
        );
        Ok(())
    }

    /// Resolves a guest address through the shadow hierarchy to the host
    /// page it maps.
    pub fn resolve(&self, guest: GuestAddress) -> Result<crate::address::HostAddress> {
        if !self.is_shadow() {
            return Err(Error::InvalidArgument);
        }
        let gaddr = guest.as_u64();
        let inner = self.inner.lock();
        let (table, idx) = self
            .walk(&inner, gaddr, Level::PageTable)
            .ok_or(Error::NotMapped)?;
        let entry = inner.arena.get(table).entry(idx);
        if entry.is_invalid() {
            return Err(Error::NotMapped);
        }
        Ok(crate::address::HostAddress::new(
            entry.host_address() + (gaddr & (PAGE_SIZE - 1)),
        ))
    }

    /// Write-protects the parent pages in `[paddr, paddr + len)` and records
    /// a reverse-map entry for each, so a later change to any of them tears
    /// down the shadow slot at `raddr`.
    fn protect_rmap(&self, raddr: u64, tag: RmapTag, paddr: u64, len: u64) -> Result<()> {
        let Some(link) = self.shadow.as_ref() else {
            return Err(Error::InvalidArgument);
        };
        let parent = link.parent.clone();
        let record = RmapEntry { raddr, tag };

        let _guard = self.host().fault_lock().read();
        let mut paddr = paddr;
        let mut len = len;
        while len > 0 {
            let vmaddr = parent.translate_raw(paddr).map_err(|_| Error::Fault)?;
            let vm_page = vmaddr & !(PAGE_SIZE - 1);
            match self.protect_parent_page(vm_page, record) {
                Ok(()) => {
                    let step = (PAGE_SIZE - (paddr & (PAGE_SIZE - 1))).min(len);
                    paddr += step;
                    len -= step;
                }
                Err(Error::Again) => {
                    parent.fixup(paddr & !(PAGE_SIZE - 1), vm_page, Protection::Read)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn protect_parent_page(&self, vm_page: u64, record: RmapEntry) -> Result<()> {
        let segment = self
            .host()
            .segment(vm_page & Level::Segment.mask())
            .ok_or(Error::Again)?;
        let mut state = segment.lock();
        let mut inner = self.inner.lock();
        if inner.removed {
            return Err(Error::Again);
        }
        match &mut *state {
            HostSegmentState::Tables { ptes } => {
                force_prot(
                    &mut ptes[Level::PageTable.index_of(vm_page)],
                    Protection::Read,
                    Notify::SHADOW,
                )?;
            }
            HostSegmentState::Large { .. } => {
                // Nested guests cannot keep translation tables inside a
                // large host block.
                return Err(Error::Fault);
            }
        }
        inner.rmap.insert(vm_page, record);
        Ok(())
    }

    /// Reacts to a change of the host page at `vmaddr`, which this shadow's
    /// parent maps at `gaddr`: either the whole shadow dies (the nested
    /// root table changed) or the individual slots built on that page are
    /// torn down.
    pub(crate) fn shadow_notify(&self, vmaddr: u64, gaddr: u64) {
        let Some(descriptor) = self.shadow_descriptor() else {
            return;
        };
        let mut inner = self.inner.lock();
        if inner.removed {
            return;
        }
        if descriptor.covers(gaddr) {
            drop(inner);
            self.unshadow();
            return;
        }
        for record in inner.rmap.take(vmaddr) {
            self.unshadow_slot(&mut inner, record.tag.level(), record.raddr);
        }
    }

    /// Invalidates the entire shadow. Idempotent; the space stays allocated
    /// for outstanding references but translates nothing.
    pub(crate) fn unshadow(&self) {
        let mut inner = self.inner.lock();
        if inner.removed {
            return;
        }
        inner.removed = true;
        self.host().notifiers().notify(self, 0, u64::MAX);
        self.host().platform().flush_space(self.id());
        let root = inner.root;
        self.teardown_table(&mut inner, root, 0);
        inner.rmap.clear();
        log::trace!("space {}: shadow invalidated", self.id());
    }

    /// Tears down a single shadow slot and the subtree beneath it.
    fn unshadow_slot(&self, inner: &mut SpaceInner, slot_level: Level, raddr: u64) {
        let Some((table, idx)) = self.walk(inner, raddr, slot_level) else {
            return;
        };
        let entry = inner.arena.get(table).entry(idx);
        if entry.is_empty() {
            return;
        }
        let base = raddr & slot_level.mask();
        self.host()
            .notifiers()
            .notify(self, base, base + (slot_level.entry_size() - 1));
        let stale = entry.invalid();
        inner.arena.get_mut(table).set_entry(idx, stale);
        self.host().platform().invalidate_entry(base, stale.raw());
        if slot_level != Level::PageTable {
            if let Some(child) = entry.table_handle() {
                self.teardown_table(inner, child, base);
                inner.arena.free(child);
            }
        }
        inner.arena.get_mut(table).set_entry(idx, Entry::EMPTY);
    }

    /// Clears every entry of a shadow table, freeing the subtree. Each slot
    /// is parked invalid and purged before it is emptied.
    fn teardown_table(&self, inner: &mut SpaceInner, handle: TableHandle, base: u64) {
        let level = inner.arena.get(handle).level();
        for idx in 0..level.entries() {
            let entry = inner.arena.get(handle).entry(idx);
            if entry.is_empty() || !entry.has_payload() {
                continue;
            }
            let addr = base + (idx as u64) * level.entry_size();
            let stale = entry.invalid();
            inner.arena.get_mut(handle).set_entry(idx, stale);
            self.host().platform().invalidate_entry(addr, stale.raw());
            if level != Level::PageTable {
                if let Some(child) = entry.table_handle() {
                    self.teardown_table(inner, child, addr);
                    inner.arena.free(child);
                }
            }
            inner.arena.get_mut(handle).set_entry(idx, Entry::EMPTY);
        }
    }
}
