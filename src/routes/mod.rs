//! Router Module Index
//!
//! Every route here sits behind the context injector (see `create_router`): each
//! handler receives the request's `Capability` and never a storage handle of its
//! own. There is no separate router for authenticated callers; what a caller may do
//! is decided per row by the policies, not by which router a path lives on.

use crate::AppState;
use axum::Router;

/// Project endpoints: listing, reading and owner-only changes.
pub mod projects;

/// Comment threads hanging off projects.
pub mod comments;

/// api_routes
///
/// All capability-bound routes, merged into one router.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/me", axum::routing::get(crate::handlers::get_me))
        .merge(projects::project_routes())
        .merge(comments::comment_routes())
}
