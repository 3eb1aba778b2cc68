use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use super::{from_row, read, to_row, uuid_value, writer};
use crate::capability::Capability;
use crate::error::{Failure, ServiceResult};
use crate::models::{ListProjects, NewProject, Project, ProjectChanges};
use crate::policy::Resource;
use crate::repository::Query;

pub const DEFAULT_PAGE: i64 = 50;

/// list
///
/// Projects visible to the caller, newest first. `mine` narrows the listing to the
/// caller's own rows; an anonymous caller owns nothing and gets an empty page
/// without touching storage.
#[tracing::instrument(skip_all, fields(role = %cap.identity().role()))]
pub async fn list(cap: &Capability, params: ListProjects) -> ServiceResult<Vec<Project>> {
    let mut query = Query::all().limit(params.limit.unwrap_or(DEFAULT_PAGE));

    if params.mine.unwrap_or(false) {
        let Some(owner) = cap.identity().subject_id() else {
            return Ok(Vec::new());
        };
        query = query.eq("owner_id", uuid_value(owner));
    }

    read(cap, Resource::Projects, &query)
        .await?
        .into_iter()
        .map(from_row)
        .collect()
}

#[tracing::instrument(skip(cap), fields(role = %cap.identity().role()))]
pub async fn get(cap: &Capability, id: Uuid) -> ServiceResult<Project> {
    let row = read(cap, Resource::Projects, &Query::by_id(id))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Failure::not_found(format!("project {id} is not visible")))?;
    from_row(row)
}

/// create
///
/// Inserts a project owned by the caller. The owner comes from the capability; the
/// storage layer checks it again against the insert rule.
#[tracing::instrument(skip_all, fields(role = %cap.identity().role()))]
pub async fn create(cap: &Capability, input: NewProject) -> ServiceResult<Project> {
    let owner_id = writer(cap)?;

    let now = Utc::now();
    let project = Project {
        id: Uuid::new_v4(),
        owner_id,
        title: input.title,
        summary: input.summary,
        is_public: input.is_public.unwrap_or(false),
        created_at: now,
        updated_at: now,
    };

    let mut session = cap.open().await?;
    let row = session.insert(Resource::Projects, to_row(&project)?).await?;
    session.commit().await?;

    tracing::info!(project_id = %project.id, "project created");
    from_row(row)
}

/// update
///
/// Applies a partial update. Rows the caller may not update are reported exactly
/// like rows that do not exist.
#[tracing::instrument(skip(cap, changes), fields(role = %cap.identity().role()))]
pub async fn update(cap: &Capability, id: Uuid, changes: ProjectChanges) -> ServiceResult<Project> {
    writer(cap)?;

    let mut row = to_row(&changes)?;
    row.insert("updated_at".to_string(), json!(Utc::now()));

    let mut session = cap.open().await?;
    let updated = session
        .update(Resource::Projects, id, row)
        .await?
        .ok_or_else(|| Failure::not_found(format!("project {id} is not updatable")))?;
    session.commit().await?;

    from_row(updated)
}

#[tracing::instrument(skip(cap), fields(role = %cap.identity().role()))]
pub async fn delete(cap: &Capability, id: Uuid) -> ServiceResult<()> {
    writer(cap)?;

    let mut session = cap.open().await?;
    if !session.delete(Resource::Projects, id).await? {
        return Err(Failure::not_found(format!("project {id} is not deletable")));
    }
    session.commit().await?;
    Ok(())
}
