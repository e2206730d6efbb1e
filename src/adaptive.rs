//! Live-updatable guard settings.
//!
//! Reads are lock-free through `ArcSwap`; writers replace the whole value.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Shared handle to a setting that may change while a guard is in use.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value; readers see it on their next `get`.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }
}

impl<T: Copy> DynamicConfig<T> {
    /// Copy out the current value.
    pub fn load(&self) -> T {
        **self.inner.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_observe_updates() {
        let setting = DynamicConfig::new(5u32);
        let view = setting.clone();
        assert_eq!(view.load(), 5);

        setting.set(9);
        assert_eq!(view.load(), 9);
        assert_eq!(*view.get(), 9);
    }
}
