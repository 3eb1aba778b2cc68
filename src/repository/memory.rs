use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use super::{Query, Repository, Row, Session, StoreError, check_columns};
use crate::capability::Identity;
use crate::policy::{Operation, PolicySet, Resource, RowLookup};

type Tables = HashMap<Resource, Vec<Row>>;

/// MemoryOptions
///
/// Sizing of the simulated connection pool.
#[derive(Debug, Clone, Copy)]
pub struct MemoryOptions {
    pub max_connections: usize,
    pub acquire_timeout: Duration,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(3),
        }
    }
}

/// MemoryRepository
///
/// An in-process store that enforces the `PolicySet` itself, row by row, the same
/// way Postgres enforces the rendered policies. Used by the test suite and for
/// `STORAGE_URL=memory://` local runs.
///
/// Connections are modelled as semaphore permits: a session holds one permit for
/// its whole life and returns it on drop. Writes are buffered in the session and
/// only become visible on `commit`.
#[derive(Clone)]
pub struct MemoryRepository {
    inner: Arc<Inner>,
}

struct Inner {
    tables: RwLock<Tables>,
    policies: Arc<PolicySet>,
    pool: Arc<Semaphore>,
    max_connections: usize,
    acquire_timeout: Duration,
    outages: AtomicUsize,
    sessions_opened: AtomicUsize,
}

impl Inner {
    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

impl MemoryRepository {
    pub fn new(policies: Arc<PolicySet>, options: MemoryOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: RwLock::new(HashMap::new()),
                policies,
                pool: Arc::new(Semaphore::new(options.max_connections)),
                max_connections: options.max_connections,
                acquire_timeout: options.acquire_timeout,
                outages: AtomicUsize::new(0),
                sessions_opened: AtomicUsize::new(0),
            }),
        }
    }

    /// seed
    ///
    /// Writes a fixture row directly, outside any session and without policy checks,
    /// the way a migration or an operator would.
    pub fn seed(&self, resource: Resource, row: Row) {
        if let Ok(mut tables) = self.inner.tables.write() {
            tables.entry(resource).or_default().push(row);
        }
    }

    /// Unfiltered copy of every committed row of `resource`.
    pub fn rows(&self, resource: Resource) -> Vec<Row> {
        self.inner
            .read()
            .map(|tables| tables.get(&resource).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Makes the next `count` attempts to open a session fail as if the storage
    /// layer were unreachable.
    pub fn fail_next_opens(&self, count: usize) {
        self.inner.outages.store(count, Ordering::SeqCst);
    }

    pub fn sessions_opened(&self) -> usize {
        self.inner.sessions_opened.load(Ordering::SeqCst)
    }

    /// Connections currently free in the pool.
    pub fn idle_connections(&self) -> usize {
        self.inner.pool.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.inner.max_connections
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn open(&self, identity: &Identity) -> Result<Box<dyn Session>, StoreError> {
        let outage = self
            .inner
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if outage.is_ok() {
            return Err(StoreError::Unavailable(
                "memory store is simulating an outage".to_string(),
            ));
        }

        let permit = tokio::time::timeout(
            self.inner.acquire_timeout,
            self.inner.pool.clone().acquire_owned(),
        )
        .await
        .map_err(|_| StoreError::Unavailable("timed out waiting for a connection".to_string()))?
        .map_err(|_| StoreError::Unavailable("connection pool closed".to_string()))?;

        self.inner.sessions_opened.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemorySession {
            identity: identity.clone(),
            store: self.inner.clone(),
            pending: Vec::new(),
            _permit: permit,
        }))
    }
}

enum Write {
    Insert(Resource, Row),
    Update(Resource, Uuid, Row),
    Remove(Resource, Value),
}

struct MemorySession {
    identity: Identity,
    store: Arc<Inner>,
    pending: Vec<Write>,
    _permit: OwnedSemaphorePermit,
}

struct Snapshot<'a>(&'a Tables);

impl RowLookup for Snapshot<'_> {
    fn find(&self, resource: Resource, id: &Value) -> Option<Row> {
        find(self.0, resource, id).cloned()
    }
}

fn find<'a>(tables: &'a Tables, resource: Resource, id: &Value) -> Option<&'a Row> {
    tables
        .get(&resource)?
        .iter()
        .find(|row| row.get("id") == Some(id))
}

fn id_value(id: Uuid) -> Value {
    Value::String(id.to_string())
}

fn ordering_key(row: &Row, column: &str) -> Option<DateTime<FixedOffset>> {
    row.get(column)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
}

impl MemorySession {
    fn allows(&self, tables: &Tables, resource: Resource, operation: Operation, row: &Row) -> bool {
        self.store
            .policies
            .evaluate(resource, operation, &self.identity, row, &Snapshot(tables))
            .is_allowed()
    }

    fn has_rule(&self, resource: Resource, operation: Operation) -> bool {
        self.store
            .policies
            .rule(resource, operation, self.identity.role())
            .is_some()
    }

    /// Applies one buffered write against the latest committed rows. Updates merge
    /// only the columns they change and are checked again against the row as it is
    /// now, so sessions touching different columns of one row do not undo each other.
    fn apply(&self, tables: &mut Tables, write: Write) -> Result<(), StoreError> {
        match write {
            Write::Insert(resource, row) => {
                let id = row.get("id").cloned().unwrap_or(Value::Null);
                if find(tables, resource, &id).is_some() {
                    return Err(StoreError::Conflict(format!("duplicate id on {resource}")));
                }
                tables.entry(resource).or_default().push(row);
            }
            Write::Update(resource, id, changes) => {
                let key = id_value(id);
                let Some(current) = find(tables, resource, &key) else {
                    return Err(StoreError::Conflict(format!(
                        "{resource} row {id} was deleted before the update committed"
                    )));
                };
                if !self.allows(tables, resource, Operation::Update, current) {
                    return Err(StoreError::Denied(format!(
                        "{resource} row {id} is no longer updatable"
                    )));
                }
                let mut merged = current.clone();
                merged.extend(changes);
                if !self.allows(tables, resource, Operation::Update, &merged) {
                    return Err(StoreError::Denied(format!(
                        "updated row violates row-level security policy for {resource}"
                    )));
                }
                if let Some(slot) = tables
                    .get_mut(&resource)
                    .and_then(|rows| rows.iter_mut().find(|r| r.get("id") == Some(&key)))
                {
                    *slot = merged;
                }
            }
            Write::Remove(resource, id) => {
                if let Some(rows) = tables.get_mut(&resource) {
                    rows.retain(|r| r.get("id") != Some(&id));
                }
                for (child, column) in resource.dependents() {
                    if let Some(rows) = tables.get_mut(child) {
                        rows.retain(|r| r.get(*column) != Some(&id));
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Session for MemorySession {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn select(&mut self, resource: Resource, query: &Query) -> Result<Vec<Row>, StoreError> {
        check_columns(resource, query.filters().iter().map(|(column, _)| *column))?;

        let tables = self.store.read()?;
        let mut rows: Vec<Row> = tables
            .get(&resource)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.matches(row))
                    .filter(|row| self.allows(&tables, resource, Operation::Select, row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let column = resource.order_column();
        rows.sort_by(|a, b| ordering_key(b, column).cmp(&ordering_key(a, column)));
        if let Some(limit) = query.max_rows() {
            rows.truncate(usize::try_from(limit).unwrap_or(0));
        }
        Ok(rows)
    }

    async fn insert(&mut self, resource: Resource, row: Row) -> Result<Row, StoreError> {
        check_columns(resource, row.keys().map(String::as_str))?;
        let id = row
            .get("id")
            .cloned()
            .ok_or_else(|| StoreError::Backend(format!("insert into {resource} without id")))?;

        {
            let tables = self.store.read()?;
            if !self.has_rule(resource, Operation::Insert) {
                return Err(StoreError::Denied(format!(
                    "no insert policy on {resource} for role {}",
                    self.identity.role()
                )));
            }
            if !self.allows(&tables, resource, Operation::Insert, &row) {
                return Err(StoreError::Denied(format!(
                    "new row violates row-level security policy for {resource}"
                )));
            }
            if find(&tables, resource, &id).is_some() {
                return Err(StoreError::Conflict(format!("duplicate id on {resource}")));
            }
        }

        self.pending.push(Write::Insert(resource, row.clone()));
        Ok(row)
    }

    async fn update(
        &mut self,
        resource: Resource,
        id: Uuid,
        changes: Row,
    ) -> Result<Option<Row>, StoreError> {
        check_columns(resource, changes.keys().map(String::as_str))?;
        if changes.is_empty() || changes.contains_key("id") {
            return Err(StoreError::Backend(
                "an update must change at least one column and never the id".to_string(),
            ));
        }

        let updated = {
            let tables = self.store.read()?;
            let Some(current) = find(&tables, resource, &id_value(id)) else {
                return Ok(None);
            };
            if !self.allows(&tables, resource, Operation::Update, current) {
                return Ok(None);
            }

            let mut updated = current.clone();
            updated.extend(changes.clone());
            if !self.allows(&tables, resource, Operation::Update, &updated) {
                return Err(StoreError::Denied(format!(
                    "updated row violates row-level security policy for {resource}"
                )));
            }
            updated
        };

        self.pending.push(Write::Update(resource, id, changes));
        Ok(Some(updated))
    }

    async fn delete(&mut self, resource: Resource, id: Uuid) -> Result<bool, StoreError> {
        let id = id_value(id);
        let visible = {
            let tables = self.store.read()?;
            find(&tables, resource, &id)
                .is_some_and(|row| self.allows(&tables, resource, Operation::Delete, row))
        };

        if visible {
            self.pending.push(Write::Remove(resource, id));
        }
        Ok(visible)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let writes = std::mem::take(&mut self.pending);
        let mut tables = self
            .store
            .tables
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))?;

        // Staged on a copy so a failing write leaves the store untouched.
        let mut staged = tables.clone();
        for write in writes {
            self.apply(&mut staged, write)?;
        }
        *tables = staged;
        Ok(())
    }
}
