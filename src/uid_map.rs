//
// uid_map.rs
// Dicom-Sort-rs
//
// Run-wide UID remapping table shared by every worker behind a lock.
//

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::hashing::UidRoot;

/// Append-only original -> replacement UID table. One instance is shared (by reference) by all workers of a run,
/// so every file that carries the same original UID receives the same replacement.
#[derive(Debug, Default)]
pub struct UidMap {
    root: UidRoot,
    entries: RwLock<HashMap<String, String>>,
}

impl UidMap {
    pub fn new(root: UidRoot) -> Self {
        Self {
            root,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Replacement for `original`, generating and recording one on first sight.
    pub fn map(&self, original: &str) -> String {
        if let Some(existing) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(original)
        {
            return existing.clone();
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(original.to_string())
            .or_insert_with(|| self.root.derive(original))
            .clone()
    }

    pub fn get(&self, original: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(original)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn mapping_is_idempotent() {
        let map = UidMap::default();
        let first = map.map("1.2.3.4");
        let second = map.map("1.2.3.4");
        assert_eq!(first, second);
        assert_eq!(map.len(), 1);
        assert_ne!(first, map.map("1.2.3.5"));
    }

    #[test]
    fn concurrent_workers_agree_on_replacements() {
        let map = UidMap::default();
        let results: Vec<String> = (0..256)
            .into_par_iter()
            .map(|i| map.map(&format!("1.2.3.{}", i % 4)))
            .collect();

        assert_eq!(map.len(), 4);
        for (i, uid) in results.iter().enumerate() {
            assert_eq!(Some(uid.clone()), map.get(&format!("1.2.3.{}", i % 4)));
        }
    }
}
