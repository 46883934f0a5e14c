#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]
//! Guest address space translation and shadow paging.
//!
//! This crate maintains translation hierarchies mapping guest addresses to
//! host memory on behalf of a virtual machine monitor:
//!
//! - [`HostContext`] models the host side: attached spaces, per-page host
//!   state, the notifier bus, and the injected platform invalidation hooks.
//! - [`AddressSpace`] is one guest address space, populated lazily from
//!   segment-granular connections established with
//!   [`AddressSpace::map_range`].
//! - Shadow spaces ([`AddressSpace::new_shadow`]) mirror translation
//!   structures a nested guest keeps in its parent's memory, and are torn
//!   down precisely when the memory they were built from changes.
//! - [`AddressSpace::protect_range`] write-protects guest ranges and arms
//!   notification, feeding both the [`Notifier`] bus and shadow teardown.
//!
//! Lock order, outermost first: the host fault lock, a host segment lock,
//! then a space's internal lock. A parent's child list lock is taken before
//! any child's internal lock and never inside the parent's internal lock.

extern crate alloc;

pub mod address;
pub mod entry;
pub mod error;
pub mod host;
pub mod notifier;
pub mod platform;
pub mod protect;
pub mod rmap;
pub mod shadow;
pub mod space;
pub mod table;

pub use address::{GuestAddress, HostAddress};
pub use error::{Error, Result};
pub use host::{FaultHandler, HostConfig, HostContext, PopulateOnFault};
pub use notifier::{Notifier, NotifierRegistry};
pub use platform::{CountingFlush, InvalidationOps, NoFlush};
pub use protect::{Notify, Protection};
pub use shadow::ParentTable;
pub use space::{AddressSpace, RootDescriptor};
pub use table::{Level, PAGE_SIZE, SEGMENT_SIZE};
