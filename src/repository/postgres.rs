use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row as _, Transaction, query_builder::QueryBuilder, types::Json};
use uuid::Uuid;

use super::{Query, Repository, Row, Session, StoreError, check_columns};
use crate::capability::Identity;
use crate::policy::Resource;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // insufficient_privilege, raised for row-level security violations
                Some("42501") => StoreError::Denied(db.message().to_string()),
                Some("23505") | Some("23503") => StoreError::Conflict(db.message().to_string()),
                Some(code) if code.starts_with("08") => StoreError::Unavailable(err.to_string()),
                _ => StoreError::Backend(err.to_string()),
            },
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => StoreError::Unavailable(err.to_string()),
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

/// PostgresRepository
///
/// The production repository. Policies live in the database as row-level security
/// policies (see `migrations/`); each session runs inside a transaction that has
/// switched to the caller's database role and published the caller's subject id
/// for `auth.uid()`, so Postgres itself filters and checks every row.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Creates a new repository instance using the initialized connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    /// open
    ///
    /// Begins a transaction on a pooled connection, then scopes it with
    /// `SET LOCAL ROLE` and a transaction-local `request.jwt.claim.sub` setting.
    /// Both reset when the transaction ends, so the connection goes back to the pool
    /// without any identity attached.
    async fn open(&self, identity: &Identity) -> Result<Box<dyn Session>, StoreError> {
        let mut tx = self.pool.begin().await?;

        // The role name comes from a closed enum, never from input.
        sqlx::query(&format!("SET LOCAL ROLE {}", identity.role().db_role()))
            .execute(&mut *tx)
            .await?;

        let subject = identity
            .subject_id()
            .map(|id| id.to_string())
            .unwrap_or_default();
        sqlx::query("SELECT set_config('request.jwt.claim.sub', $1, true)")
            .bind(subject)
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PgSession {
            identity: identity.clone(),
            tx: Some(tx),
        }))
    }
}

struct PgSession {
    identity: Identity,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgSession {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::Backend("session already committed".to_string()))
    }
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<Row, StoreError> {
    let Json(value) = row.try_get::<Json<Row>, _>("row")?;
    Ok(value)
}

/// Builds the select for `query`. Each filter compares the plain column against
/// the bound value cast through the table's own row type, so the comparison keeps
/// the column's type and can use its index.
fn select_query(resource: Resource, query: &Query) -> QueryBuilder<'static, Postgres> {
    let table = resource.qualified();
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT to_jsonb(t) AS row FROM ");
    builder.push(&table);
    builder.push(" AS t");

    for (idx, (column, value)) in query.filters().iter().enumerate() {
        builder.push(if idx == 0 { " WHERE " } else { " AND " });
        builder.push(format!("t.\"{column}\" = (jsonb_populate_record(NULL::{table}, "));
        let mut typed = Row::new();
        typed.insert(column.to_string(), value.clone());
        builder.push_bind(Json(Value::Object(typed)));
        builder.push(format!(")).\"{column}\""));
    }

    builder.push(format!(" ORDER BY t.\"{}\" DESC", resource.order_column()));
    if let Some(limit) = query.max_rows() {
        builder.push(" LIMIT ");
        builder.push_bind(limit);
    }
    builder
}

#[async_trait]
impl Session for PgSession {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    async fn select(&mut self, resource: Resource, query: &Query) -> Result<Vec<Row>, StoreError> {
        check_columns(resource, query.filters().iter().map(|(column, _)| *column))?;

        let mut builder = select_query(resource, query);
        let tx = self.tx()?;
        let rows = builder.build().fetch_all(&mut **tx).await?;
        rows.iter().map(decode).collect()
    }

    async fn insert(&mut self, resource: Resource, row: Row) -> Result<Row, StoreError> {
        check_columns(resource, row.keys().map(String::as_str))?;

        let table = resource.qualified();
        let sql = format!(
            "INSERT INTO {table} AS t SELECT * FROM jsonb_populate_record(NULL::{table}, $1) \
             RETURNING to_jsonb(t) AS row"
        );

        let tx = self.tx()?;
        let inserted = sqlx::query(&sql)
            .bind(Json(Value::Object(row)))
            .fetch_one(&mut **tx)
            .await?;
        decode(&inserted)
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

        let assignments = changes
            .keys()
            .map(|column| format!("\"{column}\" = r.\"{column}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let table = resource.qualified();
        let sql = format!(
            "UPDATE {table} AS t SET {assignments} \
             FROM jsonb_populate_record(NULL::{table}, $1) AS r \
             WHERE t.id = $2 RETURNING to_jsonb(t) AS row"
        );

        let tx = self.tx()?;
        let updated = sqlx::query(&sql)
            .bind(Json(Value::Object(changes)))
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        updated.as_ref().map(decode).transpose()
    }

    async fn delete(&mut self, resource: Resource, id: Uuid) -> Result<bool, StoreError> {
        let sql = format!("DELETE FROM {} AS t WHERE t.id = $1", resource.qualified());

        let tx = self.tx()?;
        let result = sqlx::query(&sql).bind(id).execute(&mut **tx).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }
}
