use chrono::Utc;
use uuid::Uuid;

use super::{from_row, to_row, uuid_value, writer};
use crate::capability::Capability;
use crate::error::{Failure, ServiceResult};
use crate::models::{Comment, NewComment};
use crate::policy::Resource;
use crate::repository::{Query, Row};
use crate::retry;

pub const THREAD_LIMIT: i64 = 200;

/// list_for_project
///
/// Comments of one project, newest first. A project the caller cannot see yields
/// `NotFound` rather than an empty thread, so existence is never revealed.
#[tracing::instrument(skip(cap), fields(role = %cap.identity().role()))]
pub async fn list_for_project(cap: &Capability, project_id: Uuid) -> ServiceResult<Vec<Comment>> {
    let thread: Option<Vec<Row>> = retry::idempotent(cap.retry_policy(), move || async move {
        let mut session = cap.open().await?;
        if session
            .select(Resource::Projects, &Query::by_id(project_id))
            .await?
            .is_empty()
        {
            return Ok(None);
        }
        let query = Query::all()
            .eq("project_id", uuid_value(project_id))
            .limit(THREAD_LIMIT);
        session.select(Resource::Comments, &query).await.map(Some)
    })
    .await?;

    thread
        .ok_or_else(|| Failure::not_found(format!("project {project_id} is not visible")))?
        .into_iter()
        .map(from_row)
        .collect()
}

/// add
///
/// Posts a comment as the caller on a project the caller can see.
#[tracing::instrument(skip(cap, input), fields(role = %cap.identity().role()))]
pub async fn add(cap: &Capability, project_id: Uuid, input: NewComment) -> ServiceResult<Comment> {
    let author_id = writer(cap)?;

    let mut session = cap.open().await?;
    if session
        .select(Resource::Projects, &Query::by_id(project_id))
        .await?
        .is_empty()
    {
        return Err(Failure::not_found(format!("project {project_id} is not visible")));
    }

    let comment = Comment {
        id: Uuid::new_v4(),
        project_id,
        author_id,
        body: input.body,
        created_at: Utc::now(),
    };
    let row = session.insert(Resource::Comments, to_row(&comment)?).await?;
    session.commit().await?;

    tracing::info!(comment_id = %comment.id, "comment added");
    from_row(row)
}

#[tracing::instrument(skip(cap), fields(role = %cap.identity().role()))]
pub async fn delete(cap: &Capability, id: Uuid) -> ServiceResult<()> {
    writer(cap)?;

    let mut session = cap.open().await?;
    if !session.delete(Resource::Comments, id).await? {
        return Err(Failure::not_found(format!("comment {id} is not deletable")));
    }
    session.commit().await?;
    Ok(())
}
