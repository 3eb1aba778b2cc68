use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};

use crate::{AppState, capability::Capability, error::Failure};

/// inject_capability
///
/// Middleware run on every API route. It resolves the caller's `Identity` from the
/// request credentials and binds a fresh `Capability` into the request extensions.
///
/// *Never aborts*: missing or unusable credentials resolve to `Identity::Anonymous`,
/// and the policies decide what an anonymous caller may do.
/// *Never rebinds*: a request that already carries a capability keeps it, so the
/// identity cannot change halfway through a request.
pub async fn inject_capability(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if request.extensions().get::<Capability>().is_none() {
        let identity = state.verifier.resolve(request.headers());

        let span = tracing::Span::current();
        span.record("role", tracing::field::display(identity.role()));
        if let Some(subject) = identity.subject_id() {
            span.record("subject", tracing::field::display(subject));
        }

        let capability = Capability::bind(identity, state.repo.clone(), state.config.retry);
        request.extensions_mut().insert(capability);
    }

    next.run(request).await
}

/// Capability Extractor Implementation
///
/// Takes the capability bound by `inject_capability` out of the request. Taking it
/// (rather than cloning) leaves one handle per request for one call chain. A route
/// mounted without the injector is a wiring bug and fails with `Internal`.
impl<S> FromRequestParts<S> for Capability
where
    S: Send + Sync,
{
    type Rejection = Failure;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.remove::<Capability>().ok_or_else(|| {
            Failure::internal("no capability bound to the request; is the context injector layered on this route?")
        })
    }
}
