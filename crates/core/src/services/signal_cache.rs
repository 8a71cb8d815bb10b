//! Advisory per-address signal cache.
//!
//! Holds the last processed signature/hash per monitored address so the
//! scanner can cheaply skip boundary overlaps between consecutive cycles.
//! Performance-oriented only: correctness rests on the ledger store's
//! unique transaction-hash constraint, never on this cache.

use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory last-processed-signature map, keyed by monitored-address key.
#[derive(Debug, Default)]
pub struct SignalCache {
    inner: RwLock<HashMap<String, String>>,
}

impl SignalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last signature recorded for an address, if any.
    pub fn last_processed(&self, key: &str) -> Option<String> {
        self.inner
            .read()
            .expect("signal cache lock poisoned")
            .get(key)
            .cloned()
    }

    /// Record the newest processed signature for an address.
    pub fn record(&self, key: &str, signature: &str) {
        self.inner
            .write()
            .expect("signal cache lock poisoned")
            .insert(key.to_string(), signature.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_replaces() {
        let cache = SignalCache::new();
        assert_eq!(cache.last_processed("sepolia:0xT:eth"), None);

        cache.record("sepolia:0xT:eth", "0xaa");
        assert_eq!(
            cache.last_processed("sepolia:0xT:eth").as_deref(),
            Some("0xaa")
        );

        cache.record("sepolia:0xT:eth", "0xbb");
        assert_eq!(
            cache.last_processed("sepolia:0xT:eth").as_deref(),
            Some("0xbb")
        );
    }
}
