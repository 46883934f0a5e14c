//! Invalidation notifier bus.
//!
//! Consumers that cache translation results (instruction emulators, nested
//! paging helpers) register a [`Notifier`] with the host context and get a
//! callback whenever a notification-marked translation changes.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use crate::space::AddressSpace;

/// Callback interface for translation-change notifications.
///
/// `translation_changed` is invoked with the affected space and the guest
/// address range `[start, end]` whose translations are no longer valid.
///
/// Callbacks run with translation-table locks held: they must not call back
/// into the owning space or the host context, only record the event for
/// later processing.
pub trait Notifier: Send + Sync {
    fn translation_changed(&self, space: &AddressSpace, start: u64, end: u64);
}

/// Registry of translation-change notifiers.
///
/// Dispatch runs under the read side of the list lock and unregistration
/// takes the write side, so by the time `unregister` returns no callback on
/// the removed notifier is still in flight and its owner may free it.
pub struct NotifierRegistry {
    list: RwLock<Vec<Arc<dyn Notifier>>>,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self { list: RwLock::new(Vec::new()) }
    }

    pub fn register(&self, notifier: Arc<dyn Notifier>) {
        self.list.write().push(notifier);
    }

    /// Removes a notifier. On return, no in-flight callback on it remains.
    pub fn unregister(&self, notifier: &Arc<dyn Notifier>) {
        self.list.write().retain(|n| !Arc::ptr_eq(n, notifier));
    }

    /// Reports a changed range to every registered notifier, in
    /// registration order.
    pub(crate) fn notify(&self, space: &AddressSpace, start: u64, end: u64) {
        for notifier in self.list.read().iter() {
            notifier.translation_changed(space, start, end);
        }
    }
}

impl Default for NotifierRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostConfig, HostContext};
    use crate::platform::NoFlush;
    use spin::Mutex;

    pub(crate) struct RecordingNotifier {
        pub events: Mutex<Vec<(u64, u64)>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Arc<Self> {
            Arc::new(Self { events: Mutex::new(Vec::new()) })
        }
    }

    impl Notifier for RecordingNotifier {
        fn translation_changed(&self, _space: &AddressSpace, start: u64, end: u64) {
            self.events.lock().push((start, end));
        }
    }

    #[test]
    fn dispatch_reaches_registered_notifiers_in_order() {
        let host = HostContext::new(HostConfig::default(), Arc::new(NoFlush));
        let space = host.create_space(0).unwrap();

        let first = RecordingNotifier::new();
        let second = RecordingNotifier::new();
        host.notifiers().register(first.clone());
        host.notifiers().register(second.clone());

        host.notifiers().notify(&space, 0x1000, 0x1fff);
        assert_eq!(*first.events.lock(), vec![(0x1000, 0x1fff)]);
        assert_eq!(*second.events.lock(), vec![(0x1000, 0x1fff)]);
    }

    #[test]
    fn unregistered_notifier_sees_nothing() {
        let host = HostContext::new(HostConfig::default(), Arc::new(NoFlush));
        let space = host.create_space(0).unwrap();

        let notifier = RecordingNotifier::new();
        let handle: Arc<dyn Notifier> = notifier.clone();
        host.notifiers().register(handle.clone());
        host.notifiers().unregister(&handle);

        host.notifiers().notify(&space, 0, 0xfff);
        assert!(notifier.events.lock().is_empty());
    }

    #[test]
    fn unregister_waits_for_inflight_dispatch() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::thread;
        use std::time::Duration;

        struct SlowNotifier {
            running: AtomicBool,
        }

        impl Notifier for SlowNotifier {
            fn translation_changed(&self, _space: &AddressSpace, _start: u64, _end: u64) {
                self.running.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                self.running.store(false, Ordering::SeqCst);
            }
        }

        let host = HostContext::new(HostConfig::default(), Arc::new(NoFlush));
        let space = host.create_space(0).unwrap();
        let slow = Arc::new(SlowNotifier { running: AtomicBool::new(false) });
        let handle: Arc<dyn Notifier> = slow.clone();
        host.notifiers().register(handle.clone());

        let dispatcher = {
            let host = host.clone();
            thread::spawn(move || {
                let space = &host.spaces()[0];
                host.notifiers().notify(space, 0, 0xfff);
            })
        };
        let _ = space;

        // Wait for the callback to start, then unregister. The write lock
        // cannot be taken until the read-side dispatch finishes.
        while !slow.running.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        host.notifiers().unregister(&handle);
        assert!(!slow.running.load(Ordering::SeqCst));

        dispatcher.join().unwrap();
    }
}
