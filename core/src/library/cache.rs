use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryCacheEntry {
    pub timestamp: SystemTime,
    pub has_header_files: bool,
    pub target_names: Vec<String>,
}

/// Staging cache keyed by library id, shared by every clone.
///
/// An entry is only handed out while the library's source directory has not
/// been modified after the entry's timestamp.
#[derive(Debug, Clone, Default)]
pub struct LibraryCache {
    entries: Arc<Mutex<HashMap<String, LibraryCacheEntry>>>,
}

impl LibraryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, id: &str, source_modified: SystemTime) -> Option<LibraryCacheEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(id)
            .filter(|entry| source_modified <= entry.timestamp)
            .cloned()
    }

    pub fn store(&self, id: impl Into<String>, entry: LibraryCacheEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(id.into(), entry);
    }

    /// Names from the last staging of `id`, whether or not still valid.
    pub fn target_names(&self, id: &str) -> Option<Vec<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(id).map(|entry| entry.target_names.clone())
    }
}
