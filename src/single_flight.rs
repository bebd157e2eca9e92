//! Per-key mutual exclusion
//!
//! Used to keep migration runs and backups single-flight per module: a
//! second caller for a held key is turned away instead of interleaving.

use dashmap::DashMap;
use std::sync::Arc;

/// Set of keys currently held by some operation
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    held: Arc<DashMap<String, ()>>,
}

impl SingleFlight {
    /// Create an empty guard set
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take `key`. Returns `None` if another holder has it.
    ///
    /// The key is released when the returned guard drops, which covers
    /// success, error and cancelled futures alike.
    pub fn try_acquire(&self, key: &str) -> Option<FlightGuard> {
        use dashmap::mapref::entry::Entry;

        match self.held.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(FlightGuard {
                    held: Arc::clone(&self.held),
                    key: key.to_string(),
                })
            }
        }
    }

    /// Whether `key` is currently held
    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains_key(key)
    }
}

/// Releases its key on drop
#[derive(Debug)]
pub struct FlightGuard {
    held: Arc<DashMap<String, ()>>,
    key: String,
}

impl FlightGuard {
    /// The held key
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.held.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_rejected() {
        let flights = SingleFlight::new();
        let guard = flights.try_acquire("vendas").unwrap();
        assert!(flights.try_acquire("vendas").is_none());
        assert!(flights.try_acquire("estoque").is_some());
        drop(guard);
        assert!(flights.try_acquire("vendas").is_some());
    }

    #[test]
    fn test_guard_released_on_drop() {
        let flights = SingleFlight::new();
        {
            let _guard = flights.try_acquire("vendas").unwrap();
            assert!(flights.is_held("vendas"));
        }
        assert!(!flights.is_held("vendas"));
    }
}
