use crate::{AppState, handlers};
use axum::{
    Router,
    routing::{delete, get},
};

/// Comment Router Module
///
/// A thread is visible exactly when its project is. Comments cannot be edited,
/// only added and deleted by their author.
pub fn comment_routes() -> Router<AppState> {
    Router::new()
        // GET/POST /projects/{id}/comments
        .route(
            "/projects/{id}/comments",
            get(handlers::list_comments).post(handlers::add_comment),
        )
        // DELETE /comments/{id}
        .route("/comments/{id}", delete(handlers::delete_comment))
}
