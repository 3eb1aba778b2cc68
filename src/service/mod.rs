//! Business operations. Every function takes the request's `Capability` and reaches
//! storage only through it; the storage layer then applies the caller's row-level
//! policies to each row the operation touches.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

use crate::capability::Capability;
use crate::error::{Failure, ServiceResult};
use crate::policy::Resource;
use crate::repository::{Query, Row};
use crate::retry;

pub mod comments;
pub mod projects;

pub(crate) fn to_row<T: Serialize>(value: &T) -> ServiceResult<Row> {
    match serde_json::to_value(value) {
        Ok(Value::Object(row)) => Ok(row),
        Ok(other) => Err(Failure::internal(format!("expected an object row, got {other}"))),
        Err(err) => Err(Failure::internal(format!("row encoding failed: {err}"))),
    }
}

pub(crate) fn from_row<T: DeserializeOwned>(row: Row) -> ServiceResult<T> {
    serde_json::from_value(Value::Object(row))
        .map_err(|err| Failure::internal(format!("row decoding failed: {err}")))
}

/// Subject id of an authenticated caller. Anonymous callers never write, so the
/// request stops here before any storage session is opened.
pub(crate) fn writer(cap: &Capability) -> ServiceResult<Uuid> {
    cap.identity()
        .subject_id()
        .ok_or_else(|| Failure::forbidden("anonymous callers cannot write"))
}

/// Runs one select in its own session, retried on transient unavailability.
pub(crate) async fn read(
    cap: &Capability,
    resource: Resource,
    query: &Query,
) -> ServiceResult<Vec<Row>> {
    let rows = retry::idempotent(cap.retry_policy(), move || async move {
        let mut session = cap.open().await?;
        session.select(resource, query).await
    })
    .await?;
    Ok(rows)
}

pub(crate) fn uuid_value(id: Uuid) -> Value {
    Value::String(id.to_string())
}
