//! Protection engine: range protection, notification arming, the
//! break-before-make entry exchange, and dirty-bit harvesting.

use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::host::{HostSegmentState, force_prot};
use crate::space::{AddressSpace, SpaceInner};
use crate::table::{Level, PAGE_SIZE, PAGE_TABLE_ENTRIES, SEGMENT_SIZE, TableHandle};

use crate::address::GuestAddress;

/// Access level a protection request leaves in place, or the access being
/// demanded by a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protection {
    /// No access: the unit is invalidated.
    None,
    /// Read-only.
    Read,
    /// Full access. Valid as a fault access, not as a protection target.
    Write,
}

/// Notification bits armed alongside a protection change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Notify(u8);

impl Notify {
    pub const NONE: Notify = Notify(0);
    /// Report later protection changes through the notifier bus.
    pub const MPROT: Notify = Notify(1 << 0);
    /// Tear down dependent shadow structures on later changes.
    pub const SHADOW: Notify = Notify(1 << 1);

    pub const fn contains(self, other: Notify) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for Notify {
    type Output = Notify;

    fn bitor(self, rhs: Notify) -> Notify {
        Notify(self.0 | rhs.0)
    }
}

impl AddressSpace {
    /// Replaces a live segment entry under break-before-make: dispatch any
    /// pending notification, park the stale entry invalid, purge cached
    /// translations, then install the replacement.
    ///
    /// Caller holds the space lock.
    pub(crate) fn segment_xchg(
        &self,
        inner: &mut SpaceInner,
        table: TableHandle,
        idx: usize,
        gaddr: u64,
        new: Entry,
    ) {
        let base = gaddr & Level::Segment.mask();
        let old = inner.arena.get(table).entry(idx);
        let mut new = new;
        if old.is_notify() {
            self.host()
                .notifiers()
                .notify(self, base, base + SEGMENT_SIZE - 1);
            new = new.notify(false);
        }
        let stale = old.invalid();
        inner.arena.get_mut(table).set_entry(idx, stale);
        let platform = self.host().platform();
        if platform.has_broadcast() {
            platform.invalidate_entry(base, stale.raw());
        } else {
            platform.invalidate_entry_local(base, stale.raw());
            platform.flush_space(self.id());
        }
        inner.arena.get_mut(table).set_entry(idx, new);
    }

    /// Protects the single unit covering `gaddr`, arming notification bits.
    /// Returns the unit size, so callers can advance by segment over large
    /// leaves and by page otherwise.
    pub(crate) fn protect_one(&self, gaddr: u64, prot: Protection, notify: Notify) -> Result<u64> {
        let entry = {
            let mut inner = self.inner.lock();
            let (table, idx) = self.walk(&inner, gaddr, Level::Segment).ok_or(Error::Again)?;
            let entry = inner.arena.get(table).entry(idx);
            if entry.is_large() {
                if notify.contains(Notify::SHADOW) {
                    // Shadow tracking is page-granular; it cannot hang off a
                    // large leaf.
                    return Err(Error::InvalidArgument);
                }
                match prot {
                    Protection::None => {
                        // A leaf already parked invalid needs no exchange;
                        // revoking it again is complete as it stands.
                        if !entry.is_invalid() {
                            self.segment_xchg(&mut inner, table, idx, gaddr, entry.invalid());
                        }
                    }
                    Protection::Read if entry.is_invalid() => return Err(Error::Again),
                    Protection::Read if !entry.is_protected() => {
                        self.segment_xchg(&mut inner, table, idx, gaddr, entry.protected(true));
                    }
                    Protection::Read => {}
                    Protection::Write => return Err(Error::InvalidArgument),
                }
                if notify.contains(Notify::MPROT) {
                    let cur = inner.arena.get(table).entry(idx);
                    inner.arena.get_mut(table).set_entry(idx, cur.notify(true));
                }
                return Ok(SEGMENT_SIZE);
            }
            if entry.is_invalid() {
                return Err(Error::Again);
            }
            entry
        };

        // Page-granular: the descriptors live host-side, so retake the
        // locks in segment-then-space order and revalidate the slot.
        let segment = self
            .host()
            .segment(entry.host_address())
            .ok_or(Error::Again)?;
        let mut state = segment.lock();
        let inner = self.inner.lock();
        let (table, idx) = self.walk(&inner, gaddr, Level::Segment).ok_or(Error::Again)?;
        if inner.arena.get(table).entry(idx).raw() != entry.raw() {
            return Err(Error::Again);
        }
        drop(inner);
        match &mut *state {
            HostSegmentState::Tables { ptes } => {
                force_prot(&mut ptes[Level::PageTable.index_of(gaddr)], prot, notify)?;
            }
            HostSegmentState::Large { .. } => return Err(Error::Again),
        }
        Ok(PAGE_SIZE)
    }

    /// Applies `prot` across a guest range, arming `notify` bits, faulting
    /// in and linking whatever the range still misses. Returns the number
    /// of bytes protected, the whole range on success.
    ///
    /// With [`Notify::MPROT`], later changes to any translation in the
    /// range are reported through the notifier bus; this is the interface
    /// consumers use to watch guest structures they cache.
    pub fn protect_range(
        &self,
        guest: GuestAddress,
        len: u64,
        prot: Protection,
        notify: Notify,
    ) -> Result<u64> {
        if self.is_shadow() || prot == Protection::Write {
            return Err(Error::InvalidArgument);
        }
        if len == 0
            || !guest.is_aligned(PAGE_SIZE)
            || len & (PAGE_SIZE - 1) != 0
            || guest.as_u64().checked_add(len).is_none()
            || guest.as_u64() + len - 1 > self.limit()
        {
            return Err(Error::InvalidArgument);
        }

        let _guard = self.host().fault_lock().read();
        let mut gaddr = guest.as_u64();
        let mut remaining = len;
        while remaining > 0 {
            match self.protect_one(gaddr, prot, notify) {
                Ok(unit) => {
                    let step = (unit - (gaddr & (unit - 1))).min(remaining);
                    gaddr += step;
                    remaining -= step;
                }
                Err(Error::Again) => {
                    let haddr = self.translate_raw(gaddr)?;
                    self.fixup(gaddr, haddr, prot)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(len)
    }

    /// Recovers from a transient protection failure: fault the host page in
    /// and re-link the segment, then the caller retries.
    pub(crate) fn fixup(&self, gaddr: u64, haddr: u64, prot: Protection) -> Result<()> {
        let access = if prot == Protection::Write {
            Protection::Write
        } else {
            Protection::Read
        };
        self.host().fault_in(haddr & !(PAGE_SIZE - 1), access)?;
        self.link_raw(gaddr, haddr)
    }

    /// Harvests dirty state for the segment covering `guest` into a
    /// 256-bit page bitmap, re-arming write detection as it goes.
    ///
    /// Bits accumulate into `bitmap`; a large leaf that changed dirties the
    /// whole segment.
    pub fn sync_dirty(&self, guest: GuestAddress, bitmap: &mut [u64; 4]) -> Result<()> {
        let gaddr = guest.as_u64() & Level::Segment.mask();
        let _guard = self.host().fault_lock().read();

        let entry = {
            let mut inner = self.inner.lock();
            let (table, idx) = self
                .walk(&inner, gaddr, Level::Segment)
                .ok_or(Error::NotMapped)?;
            let entry = inner.arena.get(table).entry(idx);
            if entry.is_invalid() {
                return Err(Error::NotMapped);
            }
            if entry.is_large() {
                if entry.is_uncommitted() {
                    // Clear the change marker and re-protect so the next
                    // write is caught again.
                    self.segment_xchg(
                        &mut inner,
                        table,
                        idx,
                        gaddr,
                        entry.uncommitted(false).protected(true),
                    );
                    for word in bitmap.iter_mut() {
                        *word = u64::MAX;
                    }
                }
                return Ok(());
            }
            entry
        };

        let segment = self
            .host()
            .segment(entry.host_address())
            .ok_or(Error::Again)?;
        let mut state = segment.lock();
        {
            let inner = self.inner.lock();
            let (table, idx) = self.walk(&inner, gaddr, Level::Segment).ok_or(Error::Again)?;
            if inner.arena.get(table).entry(idx).raw() != entry.raw() {
                return Err(Error::Again);
            }
        }
        if let HostSegmentState::Tables { ptes } = &mut *state {
            debug_assert_eq!(ptes.len(), PAGE_TABLE_ENTRIES);
            for (i, pte) in ptes.iter_mut().enumerate() {
                if pte.dirty {
                    pte.dirty = false;
                    pte.writable = false;
                    bitmap[i / 64] |= 1 << (i % 64);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::HostAddress;
    use crate::host::{HostConfig, HostContext};
    use crate::notifier::Notifier;
    use crate::platform::{CountingFlush, NoFlush};
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use spin::Mutex;

    struct Recorder {
        events: Mutex<Vec<(u64, u64)>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }
    }

    impl Notifier for Recorder {
        fn translation_changed(&self, _space: &AddressSpace, start: u64, end: u64) {
            self.events.lock().push((start, end));
        }
    }

    fn mapped_space() -> (Arc<HostContext>, Arc<AddressSpace>) {
        let host = HostContext::new(HostConfig::default(), Arc::new(NoFlush));
        let space = host.create_space(0).unwrap();
        space
            .map_range(
                GuestAddress::new(0x10_0000),
                HostAddress::new(0x40_0000),
                SEGMENT_SIZE,
            )
            .unwrap();
        (host, space)
    }

    mod validation {
        use super::*;

        #[test]
        fn write_protection_target_is_rejected() {
            let (_host, space) = mapped_space();
            assert_eq!(
                space.protect_range(
                    GuestAddress::new(0x10_0000),
                    PAGE_SIZE,
                    Protection::Write,
                    Notify::NONE
                ),
                Err(Error::InvalidArgument)
            );
        }

        #[test]
        fn unaligned_range_is_rejected() {
            let (_host, space) = mapped_space();
            assert_eq!(
                space.protect_range(
                    GuestAddress::new(0x10_0080),
                    PAGE_SIZE,
                    Protection::Read,
                    Notify::NONE
                ),
                Err(Error::InvalidArgument)
            );
            assert_eq!(
                space.protect_range(
                    GuestAddress::new(0x10_0000),
                    0x80,
                    Protection::Read,
                    Notify::NONE
                ),
                Err(Error::InvalidArgument)
            );
        }

        #[test]
        fn unconnected_range_reports_not_mapped() {
            let (_host, space) = mapped_space();
            assert_eq!(
                space.protect_range(
                    GuestAddress::new(0x20_0000),
                    PAGE_SIZE,
                    Protection::Read,
                    Notify::NONE
                ),
                Err(Error::NotMapped)
            );
        }
    }

    mod page_protection {
        use super::*;
        use crate::host::HostSegmentState;

        #[test]
        fn protect_faults_in_missing_pages_and_write_protects() {
            let (host, space) = mapped_space();
            let done = space
                .protect_range(
                    GuestAddress::new(0x10_0000),
                    2 * PAGE_SIZE,
                    Protection::Read,
                    Notify::MPROT,
                )
                .unwrap();
            assert_eq!(done, 2 * PAGE_SIZE);

            let segment = host.segment(0x40_0000).unwrap();
            let state = segment.lock();
            let HostSegmentState::Tables { ptes } = &*state else {
                panic!("expected page descriptors");
            };
            for pte in &ptes[..2] {
                assert!(pte.present);
                assert!(!pte.writable);
                assert!(pte.notify_fixup);
            }
            assert!(!ptes[2].present);
        }

        #[test]
        fn watched_page_reports_on_host_write() {
            let (host, space) = mapped_space();
            space
                .protect_range(
                    GuestAddress::new(0x10_3000),
                    PAGE_SIZE,
                    Protection::Read,
                    Notify::MPROT,
                )
                .unwrap();

            let recorder = Recorder::new();
            host.notifiers().register(recorder.clone());
            host.write_page(HostAddress::new(0x40_3000)).unwrap();
            assert_eq!(*recorder.events.lock(), vec![(0x10_3000, 0x10_3fff)]);

            // The report disarms the watch; a second write is silent.
            host.write_page(HostAddress::new(0x40_3000)).unwrap();
            assert_eq!(recorder.events.lock().len(), 1);
        }

        #[test]
        fn protection_none_makes_the_page_nonresident() {
            let (host, space) = mapped_space();
            space.fault(GuestAddress::new(0x10_0000), true).unwrap();
            space
                .protect_range(
                    GuestAddress::new(0x10_0000),
                    PAGE_SIZE,
                    Protection::None,
                    Notify::NONE,
                )
                .unwrap();
            let segment = host.segment(0x40_0000).unwrap();
            let state = segment.lock();
            let HostSegmentState::Tables { ptes } = &*state else {
                panic!("expected page descriptors");
            };
            assert!(!ptes[0].present);
        }
    }

    mod large_leaves {
        use super::*;

        fn large_setup(
            platform: Arc<CountingFlush>,
        ) -> (Arc<HostContext>, Arc<AddressSpace>) {
            let config = HostConfig {
                allow_large_pages: true,
                ..HostConfig::default()
            };
            let host = HostContext::new(config, platform);
            host.map_large_segment(HostAddress::new(0x40_0000), true);
            let space = host.create_space(0).unwrap();
            space
                .map_range(
                    GuestAddress::new(0x10_0000),
                    HostAddress::new(0x40_0000),
                    SEGMENT_SIZE,
                )
                .unwrap();
            space.fault(GuestAddress::new(0x10_0000), false).unwrap();
            (host, space)
        }

        #[test]
        fn large_leaf_without_capability_faults_at_link() {
            let host = HostContext::new(HostConfig::default(), Arc::new(NoFlush));
            host.map_large_segment(HostAddress::new(0x40_0000), true);
            let space = host.create_space(0).unwrap();
            space
                .map_range(
                    GuestAddress::new(0x10_0000),
                    HostAddress::new(0x40_0000),
                    SEGMENT_SIZE,
                )
                .unwrap();
            assert_eq!(
                space.fault(GuestAddress::new(0x10_0000), false),
                Err(Error::Fault)
            );
        }

        #[test]
        fn protect_exchanges_the_entry_invalid_first() {
            let flush = Arc::new(CountingFlush::new(true));
            let (_host, space) = large_setup(flush.clone());
            space
                .protect_range(
                    GuestAddress::new(0x10_0000),
                    SEGMENT_SIZE,
                    Protection::Read,
                    Notify::MPROT,
                )
                .unwrap();

            let seen = flush.entry_invalidations();
            assert!(!seen.is_empty());
            // Break-before-make: the platform always observes the stale
            // entry already marked invalid.
            for (addr, raw) in seen {
                assert_eq!(addr, 0x10_0000);
                assert_eq!(raw & 1, 1);
            }
        }

        #[test]
        fn without_broadcast_protect_falls_back_to_space_flush() {
            let flush = Arc::new(CountingFlush::new(false));
            let (_host, space) = large_setup(flush.clone());
            space
                .protect_range(
                    GuestAddress::new(0x10_0000),
                    SEGMENT_SIZE,
                    Protection::Read,
                    Notify::NONE,
                )
                .unwrap();
            assert!(flush.local_invalidations() >= 1);
            assert!(flush.space_flushes() >= 1);
        }

        #[test]
        fn shadow_tracking_cannot_hang_off_large_leaves() {
            let flush = Arc::new(CountingFlush::new(true));
            let (_host, space) = large_setup(flush);
            assert_eq!(
                space.protect_range(
                    GuestAddress::new(0x10_0000),
                    SEGMENT_SIZE,
                    Protection::Read,
                    Notify::SHADOW,
                ),
                Err(Error::InvalidArgument)
            );
        }

        #[test]
        fn revoking_an_already_revoked_leaf_is_a_no_op() {
            let flush = Arc::new(CountingFlush::new(true));
            let (_host, space) = large_setup(flush.clone());
            space
                .protect_range(
                    GuestAddress::new(0x10_0000),
                    SEGMENT_SIZE,
                    Protection::None,
                    Notify::NONE,
                )
                .unwrap();
            let exchanges = flush.entry_invalidations().len();

            // The leaf is already parked invalid; revoking again must
            // terminate without another exchange.
            space
                .protect_range(
                    GuestAddress::new(0x10_0000),
                    SEGMENT_SIZE,
                    Protection::None,
                    Notify::NONE,
                )
                .unwrap();
            assert_eq!(flush.entry_invalidations().len(), exchanges);
        }

        #[test]
        fn refault_restores_a_revoked_leaf() {
            let flush = Arc::new(CountingFlush::new(true));
            let (_host, space) = large_setup(flush);
            space
                .protect_range(
                    GuestAddress::new(0x10_0000),
                    SEGMENT_SIZE,
                    Protection::None,
                    Notify::NONE,
                )
                .unwrap();

            space.fault(GuestAddress::new(0x10_0000), true).unwrap();
            space
                .protect_range(
                    GuestAddress::new(0x10_0000),
                    SEGMENT_SIZE,
                    Protection::Read,
                    Notify::NONE,
                )
                .unwrap();

            // The restored leaf comes back with its change marker set.
            let mut bitmap = [0u64; 4];
            space
                .sync_dirty(GuestAddress::new(0x10_0000), &mut bitmap)
                .unwrap();
            assert_eq!(bitmap, [u64::MAX; 4]);
        }

        #[test]
        fn protect_links_a_missing_leaf_first() {
            let flush = Arc::new(CountingFlush::new(true));
            let config = HostConfig {
                allow_large_pages: true,
                ..HostConfig::default()
            };
            let host = HostContext::new(config, flush.clone());
            host.map_large_segment(HostAddress::new(0x40_0000), true);
            let space = host.create_space(0).unwrap();
            space
                .map_range(
                    GuestAddress::new(0x10_0000),
                    HostAddress::new(0x40_0000),
                    SEGMENT_SIZE,
                )
                .unwrap();

            // Nothing faulted in yet: the first attempt has to wire the
            // leaf itself before protecting it.
            let done = space
                .protect_range(
                    GuestAddress::new(0x10_0000),
                    SEGMENT_SIZE,
                    Protection::Read,
                    Notify::MPROT,
                )
                .unwrap();
            assert_eq!(done, SEGMENT_SIZE);

            let seen = flush.entry_invalidations();
            assert!(!seen.is_empty());
            for (addr, raw) in seen {
                assert_eq!(addr, 0x10_0000);
                assert_eq!(raw & 1, 1);
            }
        }

        #[test]
        fn large_leaf_dirty_reports_whole_segment_once() {
            let flush = Arc::new(CountingFlush::new(true));
            let (_host, space) = large_setup(flush);
            let mut bitmap = [0u64; 4];
            space
                .sync_dirty(GuestAddress::new(0x10_0000), &mut bitmap)
                .unwrap();
            assert_eq!(bitmap, [u64::MAX; 4]);

            let mut again = [0u64; 4];
            space
                .sync_dirty(GuestAddress::new(0x10_0000), &mut again)
                .unwrap();
            assert_eq!(again, [0u64; 4]);
        }
    }

    mod dirty_tracking {
        use super::*;

        #[test]
        fn written_pages_show_up_once_then_rearm() {
            let (host, space) = mapped_space();
            space.fault(GuestAddress::new(0x10_3000), true).unwrap();
            space.fault(GuestAddress::new(0x10_5000), true).unwrap();

            let mut bitmap = [0u64; 4];
            space
                .sync_dirty(GuestAddress::new(0x10_0000), &mut bitmap)
                .unwrap();
            assert_eq!(bitmap[0], (1 << 3) | (1 << 5));
            assert_eq!(&bitmap[1..], &[0, 0, 0]);

            // Harvest is destructive until the guest writes again.
            let mut second = [0u64; 4];
            space
                .sync_dirty(GuestAddress::new(0x10_0000), &mut second)
                .unwrap();
            assert_eq!(second, [0u64; 4]);

            host.write_page(HostAddress::new(0x40_5000)).unwrap();
            let mut third = [0u64; 4];
            space
                .sync_dirty(GuestAddress::new(0x10_0000), &mut third)
                .unwrap();
            assert_eq!(third[0], 1 << 5);
        }

        #[test]
        fn unlinked_segment_reports_not_mapped() {
            let (_host, space) = mapped_space();
            let mut bitmap = [0u64; 4];
            assert_eq!(
                space.sync_dirty(GuestAddress::new(0x10_0000), &mut bitmap),
                Err(Error::NotMapped)
            );
        }
    }
}
