//! Ordered callback lists
//!
//! Callbacks run in registration order. Dispatch iterates a snapshot taken
//! when it starts and holds no lock while callbacks run, so a callback may
//! add or remove entries (itself included) without disturbing the dispatch
//! in progress. Changes take effect on the next dispatch.

use parking_lot::RwLock;

/// A hook callback. Identity is the function address.
pub type HookFn = fn();

fn same(a: HookFn, b: HookFn) -> bool {
    a as usize == b as usize
}

#[derive(Default)]
pub struct OrderedHookList {
    callbacks: RwLock<Vec<HookFn>>,
}

impl OrderedHookList {
    pub const fn new() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Append `callback`. Returns `false` if it is already registered.
    pub fn add(&self, callback: HookFn) -> bool {
        let mut callbacks = self.callbacks.write();
        if callbacks.iter().any(|&f| same(f, callback)) {
            return false;
        }
        callbacks.push(callback);
        true
    }

    /// Remove `callback`. Returns `false` if it was not registered.
    pub fn remove(&self, callback: HookFn) -> bool {
        let mut callbacks = self.callbacks.write();
        match callbacks.iter().position(|&f| same(f, callback)) {
            Some(index) => {
                callbacks.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, callback: HookFn) -> bool {
        self.callbacks.read().iter().any(|&f| same(f, callback))
    }

    pub fn len(&self) -> usize {
        self.callbacks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.read().is_empty()
    }

    pub fn clear(&self) {
        self.callbacks.write().clear();
    }

    /// Run every callback registered when the call starts, in order.
    /// Returns how many ran.
    pub fn invoke_all(&self) -> usize {
        let snapshot = self.callbacks.read().clone();
        for callback in &snapshot {
            callback();
        }
        snapshot.len()
    }
}

impl std::fmt::Debug for OrderedHookList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedHookList")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::LazyLock;

    #[test]
    fn test_fifo_order() {
        static ORDER: Mutex<Vec<u8>> = Mutex::new(Vec::new());
        fn a() {
            ORDER.lock().push(1);
        }
        fn b() {
            ORDER.lock().push(2);
        }
        fn c() {
            ORDER.lock().push(3);
        }

        let list = OrderedHookList::new();
        assert!(list.add(b));
        assert!(list.add(a));
        assert!(list.add(c));

        assert_eq!(list.invoke_all(), 3);
        assert_eq!(*ORDER.lock(), vec![2, 1, 3]);
    }

    #[test]
    fn test_duplicates_and_removal() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        fn a() {
            HITS.fetch_add(1, Ordering::SeqCst);
        }
        fn b() {
            HITS.fetch_add(10, Ordering::SeqCst);
        }

        let list = OrderedHookList::new();
        assert!(list.add(a));
        assert!(!list.add(a));
        assert_eq!(list.len(), 1);

        assert!(!list.remove(b));
        assert!(list.remove(a));
        assert!(!list.remove(a));
        assert!(list.is_empty());
        assert_eq!(list.invoke_all(), 0);
    }

    #[test]
    fn test_self_removal_during_dispatch() {
        static LIST: LazyLock<OrderedHookList> = LazyLock::new(OrderedHookList::new);
        static FIRST: AtomicUsize = AtomicUsize::new(0);
        static SECOND: AtomicUsize = AtomicUsize::new(0);

        fn once() {
            FIRST.fetch_add(1, Ordering::SeqCst);
            LIST.remove(once);
        }
        fn every() {
            SECOND.fetch_add(1, Ordering::SeqCst);
        }

        LIST.add(once);
        LIST.add(every);

        assert_eq!(LIST.invoke_all(), 2);
        assert_eq!(LIST.invoke_all(), 1);
        assert_eq!(FIRST.load(Ordering::SeqCst), 1);
        assert_eq!(SECOND.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_removing_later_sibling_during_dispatch() {
        static LIST: LazyLock<OrderedHookList> = LazyLock::new(OrderedHookList::new);
        static REMOVER: AtomicUsize = AtomicUsize::new(0);
        static VICTIM: AtomicUsize = AtomicUsize::new(0);
        static TAIL: AtomicUsize = AtomicUsize::new(0);

        fn remover() {
            REMOVER.fetch_add(1, Ordering::SeqCst);
            LIST.remove(victim);
        }
        fn victim() {
            VICTIM.fetch_add(1, Ordering::SeqCst);
        }
        fn tail() {
            TAIL.fetch_add(1, Ordering::SeqCst);
        }

        LIST.add(remover);
        LIST.add(victim);
        LIST.add(tail);

        // The dispatch already under way still reaches every sibling once
        assert_eq!(LIST.invoke_all(), 3);
        assert_eq!(REMOVER.load(Ordering::SeqCst), 1);
        assert_eq!(VICTIM.load(Ordering::SeqCst), 1);
        assert_eq!(TAIL.load(Ordering::SeqCst), 1);

        assert_eq!(LIST.invoke_all(), 2);
        assert_eq!(REMOVER.load(Ordering::SeqCst), 2);
        assert_eq!(VICTIM.load(Ordering::SeqCst), 1);
        assert_eq!(TAIL.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_removing_earlier_sibling_during_dispatch() {
        static LIST: LazyLock<OrderedHookList> = LazyLock::new(OrderedHookList::new);
        static HEAD: AtomicUsize = AtomicUsize::new(0);
        static REMOVER: AtomicUsize = AtomicUsize::new(0);
        static TAIL: AtomicUsize = AtomicUsize::new(0);

        fn head() {
            HEAD.fetch_add(1, Ordering::SeqCst);
        }
        fn remover() {
            REMOVER.fetch_add(1, Ordering::SeqCst);
            LIST.remove(head);
        }
        fn tail() {
            TAIL.fetch_add(1, Ordering::SeqCst);
        }

        LIST.add(head);
        LIST.add(remover);
        LIST.add(tail);

        // Shifting the entries left must not skip or repeat anyone
        assert_eq!(LIST.invoke_all(), 3);
        assert_eq!(HEAD.load(Ordering::SeqCst), 1);
        assert_eq!(REMOVER.load(Ordering::SeqCst), 1);
        assert_eq!(TAIL.load(Ordering::SeqCst), 1);

        assert_eq!(LIST.invoke_all(), 2);
        assert_eq!(HEAD.load(Ordering::SeqCst), 1);
        assert_eq!(REMOVER.load(Ordering::SeqCst), 2);
        assert_eq!(TAIL.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_addition_during_dispatch_runs_next_time() {
        static LIST: LazyLock<OrderedHookList> = LazyLock::new(OrderedHookList::new);
        static LATE: AtomicUsize = AtomicUsize::new(0);

        fn late() {
            LATE.fetch_add(1, Ordering::SeqCst);
        }
        fn adder() {
            LIST.add(late);
        }

        LIST.add(adder);
        assert_eq!(LIST.invoke_all(), 1);
        assert_eq!(LATE.load(Ordering::SeqCst), 0);

        assert_eq!(LIST.invoke_all(), 2);
        assert_eq!(LATE.load(Ordering::SeqCst), 1);
    }
}
