//! Index administration.
//!
//! Resolves the active write index of a repository and performs the
//! completion side effects (refresh, alias swap). Only the completion
//! reactor mutates index administration state.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::info;

use crate::error::IndexingError;

/// Administration operations of the search index.
pub trait IndexAdmin: Send + Sync {
    /// Name of the index currently receiving writes for `repository`.
    fn write_index_name(&self, repository: &str) -> Result<String, IndexingError>;

    /// Make recent writes to the repository's write index searchable.
    fn refresh(&self, repository: &str) -> Result<(), IndexingError>;

    /// Point the repository's search alias at its write index.
    fn sync_search_alias(&self, repository: &str) -> Result<(), IndexingError>;
}

#[derive(Debug, Default)]
struct AdminState {
    write_indices: HashMap<String, String>,
    search_aliases: HashMap<String, String>,
    refreshes: HashMap<String, u64>,
}

/// In-memory index administration.
#[derive(Debug, Default)]
pub struct MemoryIndexAdmin {
    state: Mutex<AdminState>,
}

impl MemoryIndexAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the write index of a repository.
    pub fn with_write_index(self, repository: &str, index: &str) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state
                .write_indices
                .insert(repository.to_string(), index.to_string());
        }
        self
    }

    /// Index the repository's search alias points to.
    pub fn search_alias(&self, repository: &str) -> Option<String> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.search_aliases.get(repository).cloned())
    }

    /// Number of refreshes performed on a repository.
    pub fn refresh_count(&self, repository: &str) -> u64 {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.refreshes.get(repository).copied())
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, AdminState>, IndexingError> {
        self.state
            .lock()
            .map_err(|e| IndexingError::Admin(e.to_string()))
    }
}

impl IndexAdmin for MemoryIndexAdmin {
    fn write_index_name(&self, repository: &str) -> Result<String, IndexingError> {
        self.lock()?
            .write_indices
            .get(repository)
            .cloned()
            .ok_or_else(|| IndexingError::Admin(format!("no write index for {repository}")))
    }

    fn refresh(&self, repository: &str) -> Result<(), IndexingError> {
        let mut state = self.lock()?;
        if !state.write_indices.contains_key(repository) {
            return Err(IndexingError::Admin(format!("no index for {repository}")));
        }
        *state.refreshes.entry(repository.to_string()).or_default() += 1;
        info!(repository, "Refreshed index");
        Ok(())
    }

    fn sync_search_alias(&self, repository: &str) -> Result<(), IndexingError> {
        let mut state = self.lock()?;
        let index = state
            .write_indices
            .get(repository)
            .cloned()
            .ok_or_else(|| IndexingError::Admin(format!("no write index for {repository}")))?;
        info!(repository, index = %index, "Search alias now points to write index");
        state.search_aliases.insert(repository.to_string(), index);
        Ok(())
    }
}
