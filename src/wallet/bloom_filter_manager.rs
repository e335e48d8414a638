//! Bloom filter aggregation
//!
//! Collects filter elements from an ordered list of providers and publishes
//! the resulting filter. A filter is never changed in place: regeneration
//! builds a new one and swaps the shared `Arc` only when the contents differ.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::core::bloom::{BloomFilter, DEFAULT_FALSE_POSITIVE_RATE};

/// Source of bloom filter elements
pub trait BloomFilterProvider: Send + Sync {
    fn filter_elements(&self) -> Vec<Vec<u8>>;
}

/// Notified after the filter has been replaced
pub trait BloomFilterListener: Send + Sync {
    fn on_filter_updated(&self, filter: Arc<BloomFilter>);
}

pub struct BloomFilterManager {
    providers: RwLock<Vec<Arc<dyn BloomFilterProvider>>>,
    listeners: RwLock<Vec<Arc<dyn BloomFilterListener>>>,
    filter: RwLock<Option<Arc<BloomFilter>>>,
    /// Serializes regeneration so listeners see filters in build order
    regenerating: Mutex<()>,
    tweak: u32,
}

impl Default for BloomFilterManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BloomFilterManager {
    pub fn new() -> Self {
        Self::with_tweak(rand::random())
    }

    pub fn with_tweak(tweak: u32) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            filter: RwLock::new(None),
            regenerating: Mutex::new(()),
            tweak,
        }
    }

    pub fn add_provider(&self, provider: Arc<dyn BloomFilterProvider>) {
        self.providers.write().push(provider);
    }

    pub fn add_listener(&self, listener: Arc<dyn BloomFilterListener>) {
        self.listeners.write().push(listener);
    }

    /// Current filter, if any element was ever collected
    pub fn bloom_filter(&self) -> Option<Arc<BloomFilter>> {
        self.filter.read().clone()
    }

    /// Rebuild the filter and notify listeners when it changed
    pub fn regenerate_bloom_filter(&self) {
        let _guard = self.regenerating.lock();

        let providers = self.providers.read().clone();
        let elements: Vec<Vec<u8>> = providers.iter().flat_map(|p| p.filter_elements()).collect();
        if elements.is_empty() {
            return;
        }

        let filter = BloomFilter::with_elements(&elements, DEFAULT_FALSE_POSITIVE_RATE, self.tweak);
        if self.filter.read().as_deref() == Some(&filter) {
            return;
        }

        let filter = Arc::new(filter);
        *self.filter.write() = Some(filter.clone());
        log::debug!(
            "Bloom filter regenerated: {} elements, {} bytes",
            elements.len(),
            filter.size()
        );

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_filter_updated(filter.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Elements(Mutex<Vec<Vec<u8>>>);

    impl BloomFilterProvider for Elements {
        fn filter_elements(&self) -> Vec<Vec<u8>> {
            self.0.lock().clone()
        }
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl BloomFilterListener for Counter {
        fn on_filter_updated(&self, _filter: Arc<BloomFilter>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_regenerate_notifies_only_on_change() {
        let manager = BloomFilterManager::with_tweak(7);
        let provider = Arc::new(Elements(Mutex::new(vec![b"key-hash".to_vec()])));
        let counter = Arc::new(Counter::default());
        manager.add_provider(provider.clone());
        manager.add_listener(counter.clone());

        manager.regenerate_bloom_filter();
        manager.regenerate_bloom_filter();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        let first = manager.bloom_filter().unwrap();
        provider.0.lock().push(b"outpoint".to_vec());
        manager.regenerate_bloom_filter();

        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
        let second = manager.bloom_filter().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.contains(b"outpoint"));
        assert!(second.contains(b"key-hash"));
    }

    #[test]
    fn test_no_filter_without_elements() {
        let manager = BloomFilterManager::with_tweak(1);
        manager.add_provider(Arc::new(Elements(Mutex::new(Vec::new()))));
        manager.regenerate_bloom_filter();
        assert!(manager.bloom_filter().is_none());
    }
}
