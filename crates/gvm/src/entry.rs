//! Translation table entry representation.

use crate::table::{PAGE_SHIFT, TableHandle};

/// A single translation table entry.
///
/// Entries are stored as a raw `u64`: flag bits in the low bits, a
/// page-aligned payload in the high bits. Depending on the level and the
/// kind of address space, the payload is either a [`TableHandle`] naming the
/// next-level table in the owning space's arena, or a host address (a large
/// segment leaf, or a host page frame in a shadow page table).
///
/// An entry whose invalid bit is set must never be used for translation. An
/// entry carrying a payload *and* the invalid bit is a structure that has
/// been allocated but not yet validated against its parent.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry(u64);

impl Entry {
    /// Invalid bit: the entry must not be used for translation.
    const INVALID: u64 = 1 << 0;

    /// Protect bit: the mapped unit is read-only.
    const PROTECT: u64 = 1 << 1;

    /// Notification-requested bit: changes to this unit re-enter the
    /// protection engine / notifier bus.
    const NOTIFY: u64 = 1 << 2;

    /// Uncommitted-change bit: the unit has been written since dirty
    /// tracking last harvested it.
    const UNCOMMITTED: u64 = 1 << 3;

    /// Large-leaf bit: a segment-level entry mapping a contiguous host
    /// block instead of pointing to a page table.
    const LARGE: u64 = 1 << 4;

    /// Payload mask: page-aligned table handle or host address.
    const PAYLOAD: u64 = !0 << PAGE_SHIFT;

    /// The empty entry: invalid, no payload.
    pub const EMPTY: Entry = Entry(Self::INVALID);

    /// Creates an entry pointing at the next-level table `handle`.
    pub fn next_table(handle: TableHandle) -> Self {
        Self((handle.raw() as u64) << PAGE_SHIFT)
    }

    /// Creates an entry mapping a host address (segment leaf or page frame).
    ///
    /// The address must be page-aligned; low bits are reserved for flags.
    pub fn host(addr: u64) -> Self {
        debug_assert!(addr & !Self::PAYLOAD == 0, "host address must be page-aligned");
        Self(addr & Self::PAYLOAD)
    }

    /// Returns the raw entry value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns whether this is the empty entry.
    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }

    /// Returns the next-level table handle, if any payload is present.
    ///
    /// Only meaningful for entries that were created with [`Entry::next_table`];
    /// the arena reserves handle 0 so a zero payload always means "none".
    pub fn table_handle(self) -> Option<TableHandle> {
        let raw = (self.0 & Self::PAYLOAD) >> PAGE_SHIFT;
        if raw == 0 { None } else { Some(TableHandle::from_raw(raw as u32)) }
    }

    /// Returns the host address payload.
    pub fn host_address(self) -> u64 {
        self.0 & Self::PAYLOAD
    }

    /// Returns whether any payload (table or host reference) is attached.
    pub fn has_payload(self) -> bool {
        self.0 & Self::PAYLOAD != 0
    }

    pub fn is_invalid(self) -> bool {
        self.0 & Self::INVALID != 0
    }

    pub fn is_protected(self) -> bool {
        self.0 & Self::PROTECT != 0
    }

    pub fn is_notify(self) -> bool {
        self.0 & Self::NOTIFY != 0
    }

    pub fn is_uncommitted(self) -> bool {
        self.0 & Self::UNCOMMITTED != 0
    }

    pub fn is_large(self) -> bool {
        self.0 & Self::LARGE != 0
    }

    /// Returns this entry with the invalid bit set.
    #[must_use]
    pub fn invalid(self) -> Self {
        Self(self.0 | Self::INVALID)
    }

    /// Returns this entry with the invalid bit cleared.
    #[must_use]
    pub fn valid(self) -> Self {
        Self(self.0 & !Self::INVALID)
    }

    /// Returns this entry with the protect bit set or cleared.
    #[must_use]
    pub fn protected(self, protect: bool) -> Self {
        if protect { Self(self.0 | Self::PROTECT) } else { Self(self.0 & !Self::PROTECT) }
    }

    /// Returns this entry with the notification bit set or cleared.
    #[must_use]
    pub fn notify(self, notify: bool) -> Self {
        if notify { Self(self.0 | Self::NOTIFY) } else { Self(self.0 & !Self::NOTIFY) }
    }

    /// Returns this entry with the uncommitted-change bit set or cleared.
    #[must_use]
    pub fn uncommitted(self, uncommitted: bool) -> Self {
        if uncommitted { Self(self.0 | Self::UNCOMMITTED) } else { Self(self.0 & !Self::UNCOMMITTED) }
    }

    /// Returns this entry with the large-leaf bit set.
    #[must_use]
    pub fn large(self) -> Self {
        Self(self.0 | Self::LARGE)
    }
}

impl Default for Entry {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl core::fmt::Debug for Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Entry")
            .field("payload", &format_args!("{:#x}", self.0 & Self::PAYLOAD))
            .field("invalid", &self.is_invalid())
            .field("protect", &self.is_protected())
            .field("notify", &self.is_notify())
            .field("uncommitted", &self.is_uncommitted())
            .field("large", &self.is_large())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_entry_has_no_payload() {
        assert!(Entry::EMPTY.is_empty());
        assert!(Entry::EMPTY.is_invalid());
        assert!(!Entry::EMPTY.has_payload());
        assert_eq!(Entry::EMPTY.table_handle(), None);
    }

    #[test]
    fn table_entry_round_trip() {
        let handle = TableHandle::from_raw(7);
        let entry = Entry::next_table(handle).invalid();
        assert!(entry.is_invalid());
        assert_eq!(entry.table_handle(), Some(handle));
        assert!(!entry.valid().is_invalid());
    }

    #[test]
    fn host_entry_keeps_flags_separate() {
        let entry = Entry::host(0x40_0000).large().protected(true);
        assert_eq!(entry.host_address(), 0x40_0000);
        assert!(entry.is_large());
        assert!(entry.is_protected());
        assert!(!entry.is_invalid());
    }

    #[test]
    fn invalidated_leaf_is_not_empty() {
        // Break-before-make relies on an invalidated live entry being
        // distinguishable from a never-populated slot.
        let entry = Entry::host(0x40_0000).large().invalid();
        assert!(entry.is_invalid());
        assert!(!entry.is_empty());
    }
}
