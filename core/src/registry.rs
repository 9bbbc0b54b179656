//! Weakly referenced observer collections.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// An insertion-ordered set of weakly held delegates.
///
/// Entries disappear once their referent is dropped. Notifiers iterate over a
/// [`snapshot`](Self::snapshot), so a delegate removed while an event is being
/// delivered only misses the following events.
pub struct DelegateRegistry<D: ?Sized> {
    entries: Mutex<Vec<Weak<D>>>,
}

impl<D: ?Sized> Default for DelegateRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: ?Sized> DelegateRegistry<D> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(vec![]),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Weak<D>>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|entry| entry.strong_count() > 0);
        entries
    }

    /// Adds the delegate. Returns `false` when it was already registered.
    pub fn register(&self, delegate: &Arc<D>) -> bool {
        let mut entries = self.entries();
        if entries.iter().any(|entry| same(entry, delegate)) {
            return false;
        }

        entries.push(Arc::downgrade(delegate));
        true
    }

    /// Removes the delegate. Returns `false` when it was not registered.
    pub fn deregister(&self, delegate: &Arc<D>) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|entry| !same(entry, delegate));

        entries.len() != before
    }

    pub fn contains(&self, delegate: &Arc<D>) -> bool {
        self.entries().iter().any(|entry| same(entry, delegate))
    }

    /// Live delegates in registration order.
    pub fn snapshot(&self) -> Vec<Arc<D>> {
        self.entries().iter().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn same<D: ?Sized>(entry: &Weak<D>, delegate: &Arc<D>) -> bool {
    std::ptr::addr_eq(entry.as_ptr(), Arc::as_ptr(delegate))
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Named: Send + Sync {
        fn name(&self) -> &str;
    }

    struct Delegate(&'static str);

    impl Named for Delegate {
        fn name(&self) -> &str {
            self.0
        }
    }

    fn names(registry: &DelegateRegistry<dyn Named>) -> Vec<String> {
        registry
            .snapshot()
            .iter()
            .map(|d| d.name().to_string())
            .collect()
    }

    #[test]
    fn test_register_keeps_insertion_order() {
        let registry = DelegateRegistry::<dyn Named>::new();
        let a: Arc<dyn Named> = Arc::new(Delegate("a"));
        let b: Arc<dyn Named> = Arc::new(Delegate("b"));

        assert!(registry.register(&a));
        assert!(registry.register(&b));
        assert!(!registry.register(&a));

        assert_eq!(vec!["a", "b"], names(&registry));
    }

    #[test]
    fn test_deregister() {
        let registry = DelegateRegistry::<dyn Named>::new();
        let a: Arc<dyn Named> = Arc::new(Delegate("a"));
        let b: Arc<dyn Named> = Arc::new(Delegate("b"));
        registry.register(&a);
        registry.register(&b);

        assert!(registry.deregister(&a));
        assert!(!registry.deregister(&a));
        assert!(!registry.contains(&a));
        assert_eq!(vec!["b"], names(&registry));
    }

    #[test]
    fn test_dropped_delegates_disappear() {
        let registry = DelegateRegistry::<dyn Named>::new();
        let a: Arc<dyn Named> = Arc::new(Delegate("a"));
        registry.register(&a);
        {
            let b: Arc<dyn Named> = Arc::new(Delegate("b"));
            registry.register(&b);
            assert_eq!(2, registry.len());
        }

        assert_eq!(vec!["a"], names(&registry));
        drop(a);
        assert!(registry.is_empty());
    }
}
