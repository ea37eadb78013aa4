//! The daemon's key table.
//!
//! An append-only sequence of loaded private keys behind a single mutex.
//! A handle is the key's insertion index; handles are stable for the
//! daemon's lifetime and never reused. Key loads happen at handshake
//! frequency, so a coarse lock is both correct and fast enough.

use std::sync::Mutex;

use openssl::pkey::Private;
use openssl::rsa::Rsa;

/// Opaque identifier for a key held by the daemon.
///
/// Allocated by daemon arrival order; concurrent loads produce distinct but
/// non-deterministic handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHandle(pub(crate) u64);

impl KeyHandle {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

#[derive(Default)]
pub struct KeyRegistry {
    keys: Mutex<Vec<Rsa<Private>>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a key and return its handle.
    ///
    /// The registry's clone is a reference-count increment on the underlying
    /// RSA object, so the key persists for as long as the daemon holds it
    /// regardless of what the loader does with its own reference.
    pub fn register(&self, key: Rsa<Private>) -> KeyHandle {
        let mut keys = self.keys.lock().unwrap();
        keys.push(key);
        KeyHandle(keys.len() as u64 - 1)
    }

    /// Look up a key by raw handle. Out-of-range handles return `None`.
    pub fn get(&self, handle: u64) -> Option<Rsa<Private>> {
        let keys = self.keys.lock().unwrap();
        keys.get(handle as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn test_key() -> Rsa<Private> {
        let pem = include_bytes!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/data/rsa2048.pem"
        ));
        Rsa::private_key_from_pem(pem).unwrap()
    }

    #[test]
    fn handles_are_insertion_indices() {
        let reg = KeyRegistry::new();
        assert_eq!(reg.register(test_key()), KeyHandle(0));
        assert_eq!(reg.register(test_key()), KeyHandle(1));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn out_of_range_handle_is_none() {
        let reg = KeyRegistry::new();
        assert!(reg.get(0).is_none());
        reg.register(test_key());
        assert!(reg.get(0).is_some());
        assert!(reg.get(1).is_none());
        assert!(reg.get(u64::MAX).is_none());
    }

    #[test]
    fn concurrent_registration_issues_distinct_handles() {
        let reg = Arc::new(KeyRegistry::new());
        let key = test_key();

        let mut workers = Vec::new();
        for _ in 0..8 {
            let reg = reg.clone();
            let key = key.clone();
            workers.push(std::thread::spawn(move || reg.register(key)));
        }

        let mut handles: Vec<u64> = workers
            .into_iter()
            .map(|w| w.join().unwrap().as_u64())
            .collect();
        handles.sort_unstable();
        handles.dedup();
        assert_eq!(handles.len(), 8);
        for h in handles {
            assert!(reg.get(h).is_some());
        }
    }

    #[test]
    fn registered_key_survives_the_loader_reference() {
        let reg = KeyRegistry::new();
        let handle = {
            let key = test_key();
            reg.register(key)
            // the loader's reference drops here
        };
        let kept = reg.get(handle.as_u64()).unwrap();
        assert_eq!(kept.size(), 256);
    }
}
