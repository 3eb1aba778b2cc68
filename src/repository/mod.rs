use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::capability::Identity;
use crate::policy::Resource;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryOptions, MemoryRepository};
pub use postgres::PostgresRepository;

/// A row as the storage layer hands it over: column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

/// StoreError
///
/// Failures reported by the storage layer. Services translate these into domain
/// outcomes; nothing above the service layer inspects them.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A row-level policy rejected the operation.
    #[error("denied by row-level policy: {0}")]
    Denied(String),
    /// A uniqueness or reference constraint was violated.
    #[error("constraint conflict: {0}")]
    Conflict(String),
    /// The storage layer could not be reached or no connection was free in time.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Query
///
/// Equality filters and an optional limit for a select. Filter columns come from
/// code, never from request input, and are checked against the resource's column
/// whitelist by each backend.
#[derive(Debug, Clone, Default)]
pub struct Query {
    filters: Vec<(&'static str, Value)>,
    limit: Option<i64>,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: Uuid) -> Self {
        Self::all().eq("id", Value::String(id.to_string())).limit(1)
    }

    pub fn eq(mut self, column: &'static str, value: Value) -> Self {
        self.filters.push((column, value));
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn filters(&self) -> &[(&'static str, Value)] {
        &self.filters
    }

    pub fn max_rows(&self) -> Option<i64> {
        self.limit
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.filters
            .iter()
            .all(|(column, value)| row.get(*column) == Some(value))
    }
}

pub(crate) fn check_columns<'a>(
    resource: Resource,
    columns: impl IntoIterator<Item = &'a str>,
) -> Result<(), StoreError> {
    for column in columns {
        if !resource.has_column(column) {
            return Err(StoreError::Backend(format!(
                "unknown column {column} on {resource}"
            )));
        }
    }
    Ok(())
}

/// Session
///
/// One scoped storage session. It acts as the identity it was opened for and the
/// storage layer applies that identity's row-level policies to every row it reads
/// or writes. Work is committed only by `commit`; dropping an uncommitted session
/// discards its writes and returns its connection to the pool.
#[async_trait]
pub trait Session: Send {
    fn identity(&self) -> &Identity;

    /// Rows visible to the session's identity. Rows the policy hides are simply
    /// absent; a missing rule yields an empty result.
    async fn select(&mut self, resource: Resource, query: &Query) -> Result<Vec<Row>, StoreError>;

    /// Inserts a complete row. Rejected with `Denied` when no insert rule exists for
    /// the role or the new row fails the rule.
    async fn insert(&mut self, resource: Resource, row: Row) -> Result<Row, StoreError>;

    /// Applies `changes` to the row with `id`. `Ok(None)` when the row does not
    /// exist or the update rule hides it; `Denied` when the changed row would fail
    /// the rule.
    async fn update(
        &mut self,
        resource: Resource,
        id: Uuid,
        changes: Row,
    ) -> Result<Option<Row>, StoreError>;

    /// Deletes the row with `id`; `false` when nothing visible to the delete rule
    /// matched.
    async fn delete(&mut self, resource: Resource, id: Uuid) -> Result<bool, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;
}

/// Repository
///
/// Source of storage sessions. Implementations own the shared connection pool;
/// no method reaches storage without an identity.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn open(&self, identity: &Identity) -> Result<Box<dyn Session>, StoreError>;
}

/// RepositoryState
///
/// The concrete type used to share the persistence layer across the application state.
pub type RepositoryState = Arc<dyn Repository>;
