//! Bulk command type.
//!
//! A command is submitted once by the upstream command service and is
//! read-only for every pipeline stage.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameter overriding the target index name.
pub const INDEX_NAME_PARAM: &str = "indexName";

/// Parameter requesting an index refresh once the command completes.
pub const REFRESH_PARAM: &str = "refresh";

/// Parameter requesting the search alias to point at the write index on completion.
pub const UPDATE_ALIAS_PARAM: &str = "updateAlias";

/// A request to apply an action to a (possibly unbounded) set of documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkCommand {
    /// Command identifier (ULID string)
    pub id: String,

    /// Name of the action to apply, e.g. "index"
    pub action: String,

    /// Repository the documents live in
    pub repository: String,

    /// Selection query producing the document ids
    pub query: String,

    /// Action parameters
    #[serde(default)]
    pub params: HashMap<String, Value>,

    /// Submission time (milliseconds since epoch for JSON compatibility)
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub submitted_at: DateTime<Utc>,
}

impl BulkCommand {
    /// Create a command with a fresh ULID id and no parameters.
    pub fn new(
        action: impl Into<String>,
        repository: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            action: action.into(),
            repository: repository.into(),
            query: query.into(),
            params: HashMap::new(),
            submitted_at: Utc::now(),
        }
    }

    /// Set a parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Get a string parameter, if present and a string.
    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }

    /// Get a boolean parameter, defaulting to false.
    ///
    /// Accepts JSON booleans and the strings "true"/"false".
    pub fn param_bool(&self, name: &str) -> bool {
        match self.params.get(name) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// Explicit index name override.
    pub fn index_name(&self) -> Option<&str> {
        self.param_str(INDEX_NAME_PARAM).filter(|s| !s.is_empty())
    }

    /// Whether the index should be refreshed on completion.
    pub fn refresh_on_completion(&self) -> bool {
        self.param_bool(REFRESH_PARAM)
    }

    /// Whether the search alias should be updated on completion.
    pub fn update_alias(&self) -> bool {
        self.param_bool(UPDATE_ALIAS_PARAM)
    }
}
