use crate::{
    capability::Capability,
    error::{Failure, ServiceResult},
    models::{
        self, Comment, LIST_PROJECTS, ListProjects, Me, NEW_COMMENT, NEW_PROJECT, NewComment,
        NewProject, PROJECT_CHANGES, Project, ProjectChanges,
    },
    service::{comments, projects},
    validation::Violations,
};
use axum::{
    Json,
    extract::{
        Path, Query,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::StatusCode,
};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

// Every handler runs the same four steps in order: the request is received, its
// path, query and body pass the validation gate, the service operation runs with
// the request's capability, and the outcome becomes the response. A validation
// failure ends the request before any service call.

// --- Input Gate Helpers ---

fn path_id(path: Result<Path<Uuid>, PathRejection>) -> ServiceResult<Uuid> {
    path.map(|Path(id)| id)
        .map_err(|_| Failure::validation(Violations::malformed("id", "id must be a uuid")))
}

fn body(body: Result<Json<Value>, JsonRejection>) -> ServiceResult<Value> {
    body.map(|Json(value)| value)
        .map_err(|rejection| Failure::validation(Violations::malformed("$", rejection.body_text())))
}

fn params(
    query: Result<Query<HashMap<String, String>>, QueryRejection>,
) -> ServiceResult<HashMap<String, String>> {
    query
        .map(|Query(params)| params)
        .map_err(|rejection| Failure::validation(Violations::malformed("$", rejection.body_text())))
}

// --- Handlers ---

/// health
///
/// Liveness probe. Needs no capability and touches no storage.
#[utoipa::path(get, path = "/health", responses((status = 200, description = "Service is up")))]
pub async fn health() -> &'static str {
    "ok"
}

/// get_me
///
/// Echoes the identity the request resolved to. Useful for checking how a token is
/// read without touching any data.
#[utoipa::path(
    get,
    path = "/me",
    responses((status = 200, description = "Resolved identity", body = Me))
)]
pub async fn get_me(cap: Capability) -> Json<Me> {
    let identity = cap.identity();
    Json(Me {
        role: identity.role().to_string(),
        subject_id: identity.subject_id(),
    })
}

/// list_projects
///
/// Lists the projects the caller can see. Anonymous callers see public projects;
/// authenticated callers also see their own private ones.
#[utoipa::path(
    get,
    path = "/projects",
    params(ListProjects),
    responses(
        (status = 200, description = "Visible projects", body = [Project]),
        (status = 400, description = "Invalid query", body = crate::error::ErrorBody)
    )
)]
pub async fn list_projects(
    cap: Capability,
    query: Result<Query<HashMap<String, String>>, QueryRejection>,
) -> ServiceResult<Json<Vec<models::Project>>> {
    let filter: ListProjects = LIST_PROJECTS.validate_params(&params(query)?)?;
    let projects = projects::list(&cap, filter).await?;
    Ok(Json(projects))
}

/// create_project
///
/// Creates a project owned by the caller. Anonymous callers get the same 404 as any
/// other refused operation, and nothing is written.
#[utoipa::path(
    post,
    path = "/projects",
    request_body = NewProject,
    responses(
        (status = 201, description = "Created", body = Project),
        (status = 400, description = "Invalid body", body = crate::error::ErrorBody),
        (status = 404, description = "Refused", body = crate::error::ErrorBody)
    )
)]
pub async fn create_project(
    cap: Capability,
    payload: Result<Json<Value>, JsonRejection>,
) -> ServiceResult<(StatusCode, Json<models::Project>)> {
    let input: NewProject = NEW_PROJECT.validate(&body(payload)?)?;
    let project = projects::create(&cap, input).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// get_project
#[utoipa::path(
    get,
    path = "/projects/{id}",
    params(("id" = Uuid, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Found", body = Project),
        (status = 404, description = "Not found or not visible", body = crate::error::ErrorBody)
    )
)]
pub async fn get_project(
    cap: Capability,
    id: Result<Path<Uuid>, PathRejection>,
) -> ServiceResult<Json<models::Project>> {
    let id = path_id(id)?;
    let project = projects::get(&cap, id).await?;
    Ok(Json(project))
}

/// update_project
///
/// Partially updates a project. Only the owner's update is accepted by the policy;
/// a row owned by someone else is reported as not found and left unchanged.
#[utoipa::path(
    patch,
    path = "/projects/{id}",
    params(("id" = Uuid, Path, description = "Project ID")),
    request_body = ProjectChanges,
    responses(
        (status = 200, description = "Updated", body = Project),
        (status = 400, description = "Invalid body", body = crate::error::ErrorBody),
        (status = 404, description = "Not found or not owned", body = crate::error::ErrorBody)
    )
)]
pub async fn update_project(
    cap: Capability,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ServiceResult<Json<models::Project>> {
    let id = path_id(id)?;
    let changes: ProjectChanges = PROJECT_CHANGES.validate(&body(payload)?)?;
    let project = projects::update(&cap, id, changes).await?;
    Ok(Json(project))
}

/// delete_project
#[utoipa::path(
    delete,
    path = "/projects/{id}",
    params(("id" = Uuid, Path, description = "Project ID")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Not found or not owned", body = crate::error::ErrorBody)
    )
)]
pub async fn delete_project(
    cap: Capability,
    id: Result<Path<Uuid>, PathRejection>,
) -> ServiceResult<StatusCode> {
    let id = path_id(id)?;
    projects::delete(&cap, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// list_comments
///
/// The comment thread of a project the caller can see.
#[utoipa::path(
    get,
    path = "/projects/{id}/comments",
    params(("id" = Uuid, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Comments", body = [Comment]),
        (status = 404, description = "Project not visible", body = crate::error::ErrorBody)
    )
)]
pub async fn list_comments(
    cap: Capability,
    id: Result<Path<Uuid>, PathRejection>,
) -> ServiceResult<Json<Vec<models::Comment>>> {
    let project_id = path_id(id)?;
    let thread = comments::list_for_project(&cap, project_id).await?;
    Ok(Json(thread))
}

/// add_comment
///
/// Posts a comment as the caller. The author is always the caller.
#[utoipa::path(
    post,
    path = "/projects/{id}/comments",
    params(("id" = Uuid, Path, description = "Project ID")),
    request_body = NewComment,
    responses(
        (status = 201, description = "Comment added", body = Comment),
        (status = 400, description = "Invalid body", body = crate::error::ErrorBody),
        (status = 404, description = "Refused or project not visible", body = crate::error::ErrorBody)
    )
)]
pub async fn add_comment(
    cap: Capability,
    id: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ServiceResult<(StatusCode, Json<models::Comment>)> {
    let project_id = path_id(id)?;
    let input: NewComment = NEW_COMMENT.validate(&body(payload)?)?;
    let comment = comments::add(&cap, project_id, input).await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

/// delete_comment
#[utoipa::path(
    delete,
    path = "/comments/{id}",
    params(("id" = Uuid, Path, description = "Comment ID")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Not found or not the author", body = crate::error::ErrorBody)
    )
)]
pub async fn delete_comment(
    cap: Capability,
    id: Result<Path<Uuid>, PathRejection>,
) -> ServiceResult<StatusCode> {
    let id = path_id(id)?;
    comments::delete(&cap, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
