//! Document access.
//!
//! The document repository is external; the batch builder only needs to
//! resolve an id to its current content and version.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde_json::Value;

use crate::error::IndexingError;

/// Current content of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    /// Monotonic change counter of the document
    pub version: u64,
    pub source: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, version: u64, source: Value) -> Self {
        Self {
            id: id.into(),
            version,
            source,
        }
    }
}

/// Loads documents from a repository.
pub trait DocumentSource: Send + Sync {
    /// Load a document.
    ///
    /// `Ok(None)` means the id resolves to nothing (deleted or not visible);
    /// `Err` means the document exists but could not be read.
    fn load(&self, repository: &str, id: &str) -> Result<Option<Document>, IndexingError>;
}

#[derive(Debug, Default)]
struct SourceInner {
    documents: HashMap<(String, String), Document>,
    unreadable: HashSet<String>,
}

/// In-memory document repository.
#[derive(Debug, Default)]
pub struct MemoryDocumentSource {
    inner: RwLock<SourceInner>,
}

impl MemoryDocumentSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace a document.
    pub fn put(&self, repository: &str, document: Document) -> Result<(), IndexingError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| IndexingError::Document(e.to_string()))?;
        inner
            .documents
            .insert((repository.to_string(), document.id.clone()), document);
        Ok(())
    }

    /// Remove a document; later loads resolve to nothing.
    pub fn delete(&self, repository: &str, id: &str) -> Result<bool, IndexingError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| IndexingError::Document(e.to_string()))?;
        Ok(inner
            .documents
            .remove(&(repository.to_string(), id.to_string()))
            .is_some())
    }

    /// Make every load of `id` fail.
    pub fn mark_unreadable(&self, id: &str) -> Result<(), IndexingError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| IndexingError::Document(e.to_string()))?;
        inner.unreadable.insert(id.to_string());
        Ok(())
    }
}

impl DocumentSource for MemoryDocumentSource {
    fn load(&self, repository: &str, id: &str) -> Result<Option<Document>, IndexingError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| IndexingError::Document(e.to_string()))?;
        if inner.unreadable.contains(id) {
            return Err(IndexingError::Document(format!("cannot read {id}")));
        }
        Ok(inner
            .documents
            .get(&(repository.to_string(), id.to_string()))
            .cloned())
    }
}
