use crate::{AppState, handlers};
use axum::{Router, routing::get};

/// Project Router Module
///
/// Reads are open to every role; the policies narrow what each caller sees.
/// Writes are refused for anonymous callers and checked against ownership by the
/// storage layer for everyone else.
pub fn project_routes() -> Router<AppState> {
    Router::new()
        // GET /projects?limit=...&mine=...
        // POST /projects
        .route(
            "/projects",
            get(handlers::list_projects).post(handlers::create_project),
        )
        // GET/PATCH/DELETE /projects/{id}
        // A project the caller may not touch answers exactly like a missing one.
        .route(
            "/projects/{id}",
            get(handlers::get_project)
                .patch(handlers::update_project)
                .delete(handlers::delete_project),
        )
}
