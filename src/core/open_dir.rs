//! Open-entry index: in-flight writes per stripe
//!
//! Lives inside the stripe state, so every access happens under the stripe
//! mutex. At most one entry exists per key; a second writer for the same key
//! joins the existing entry.

use crate::core::key::CacheKey;
use ahash::AHashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Shared handle to an open entry.
pub type OpenEntryHandle = Arc<OpenDirEntry>;

/// An object currently being written to a stripe.
#[derive(Debug)]
pub struct OpenDirEntry {
    first_key: CacheKey,
    /// Requests currently working with this entry
    num_active: AtomicU32,
    /// Simultaneous writers allowed (reported to the write path)
    max_writers: u16,
}

impl OpenDirEntry {
    pub fn first_key(&self) -> &CacheKey {
        &self.first_key
    }

    pub fn num_active(&self) -> u32 {
        self.num_active.load(Ordering::Acquire)
    }

    pub fn max_writers(&self) -> u16 {
        self.max_writers
    }

    /// True when the active count is above the writer limit.
    pub fn over_writer_limit(&self) -> bool {
        self.num_active() > u32::from(self.max_writers)
    }
}

/// Keyed registry of open entries for one stripe.
#[derive(Debug)]
pub struct OpenDir {
    entries: AHashMap<CacheKey, OpenEntryHandle>,
    max_writers: u16,
}

impl OpenDir {
    pub fn new(max_writers: u16) -> Self {
        OpenDir {
            entries: AHashMap::new(),
            max_writers,
        }
    }

    /// Look up the entry for `key`, joining it if present.
    ///
    /// With `create_if_absent` a missing entry is created; otherwise `None`
    /// is returned for an unknown key.
    pub fn open_entry(&mut self, key: &CacheKey, create_if_absent: bool) -> Option<OpenEntryHandle> {
        if let Some(entry) = self.entries.get(key) {
            entry.num_active.fetch_add(1, Ordering::AcqRel);
            return Some(Arc::clone(entry));
        }
        if !create_if_absent {
            return None;
        }

        let entry = Arc::new(OpenDirEntry {
            first_key: *key,
            num_active: AtomicU32::new(1),
            max_writers: self.max_writers,
        });
        self.entries.insert(*key, Arc::clone(&entry));
        Some(entry)
    }

    /// Release one user of `handle`. The entry is removed when the last
    /// user leaves. Returns true if the entry was removed; closing a handle
    /// with no users left is a no-op.
    pub fn close_entry(&mut self, handle: &OpenEntryHandle) -> bool {
        let previous = handle
            .num_active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous != Ok(1) {
            return false;
        }
        match self.entries.get(handle.first_key()) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                self.entries.remove(handle.first_key());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<&OpenEntryHandle> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_once() {
        let mut dir = OpenDir::new(1);
        let key = CacheKey::hash(b"a");

        assert!(dir.open_entry(&key, false).is_none());

        let first = dir.open_entry(&key, true).unwrap();
        assert_eq!(first.num_active(), 1);
        assert!(!first.over_writer_limit());

        let second = dir.open_entry(&key, true).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.num_active(), 2);
        assert!(first.over_writer_limit());
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_close_removes_last_user() {
        let mut dir = OpenDir::new(2);
        let key = CacheKey::hash(b"b");

        let a = dir.open_entry(&key, true).unwrap();
        let b = dir.open_entry(&key, false).unwrap();

        assert!(!dir.close_entry(&a));
        assert!(dir.contains(&key));
        assert!(dir.close_entry(&b));
        assert!(dir.is_empty());
    }

    #[test]
    fn test_double_close_is_ignored() {
        let mut dir = OpenDir::new(1);
        let key = CacheKey::hash(b"twice");

        let entry = dir.open_entry(&key, true).unwrap();
        assert!(dir.close_entry(&entry));
        assert!(!dir.close_entry(&entry));
        assert_eq!(entry.num_active(), 0);

        // A fresh entry for the key is not affected by the stale handle.
        let fresh = dir.open_entry(&key, true).unwrap();
        assert!(!dir.close_entry(&entry));
        assert_eq!(fresh.num_active(), 1);
        assert!(dir.contains(&key));
    }

    #[test]
    fn test_distinct_keys() {
        let mut dir = OpenDir::new(1);
        dir.open_entry(&CacheKey::hash(b"x"), true);
        dir.open_entry(&CacheKey::hash(b"y"), true);
        assert_eq!(dir.len(), 2);
        assert_eq!(
            dir.get(&CacheKey::hash(b"x")).unwrap().first_key(),
            &CacheKey::hash(b"x")
        );
    }
}
