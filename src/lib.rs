use axum::{
    Router,
    http::{HeaderName, HeaderValue, header},
    middleware,
    routing::get,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use thiserror::Error;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span};

// --- Module Structure ---

// Authorization pipeline, leaf first.
pub mod policy;
pub mod capability;
pub mod validation;
pub mod auth;
pub mod context;
pub mod service;
pub mod handlers;

// Supporting components.
pub mod config;
pub mod error;
pub mod migrations;
pub mod models;
pub mod repository;
pub mod retry;
pub mod routes;

// --- Public Re-exports ---

pub use auth::TokenVerifier;
pub use capability::{Capability, Identity, Role};
pub use config::AppConfig;
pub use error::{ErrorKind, Failure, ServiceResult};
pub use policy::PolicySet;
pub use repository::{MemoryOptions, MemoryRepository, PostgresRepository, RepositoryState};

use config::StorageBackend;

/// ApiDoc
///
/// Aggregates every `#[utoipa::path]` handler and `ToSchema` model into the OpenAPI
/// document served at `/api-docs/openapi.json`.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health, handlers::get_me, handlers::list_projects, handlers::create_project,
        handlers::get_project, handlers::update_project, handlers::delete_project,
        handlers::list_comments, handlers::add_comment, handlers::delete_comment
    ),
    components(
        schemas(
            models::Project, models::Comment, models::Me, models::NewProject,
            models::ProjectChanges, models::NewComment, error::ErrorBody,
            validation::Violation,
        )
    ),
    tags(
        (name = "rowgate", description = "Row-level authorized project API")
    )
)]
struct ApiDoc;

/// AppState
///
/// The single, immutable container shared by every request. It holds the storage
/// pool but no per-request state: capabilities are built per request by
/// `context::inject_capability` from the pieces here.
#[derive(Clone)]
pub struct AppState {
    /// Repository Layer: owns the connection pool. Only reached through a `Capability`.
    pub repo: RepositoryState,
    /// Configuration: the loaded, immutable environment configuration.
    pub config: AppConfig,
    /// Resolves request credentials into identities.
    pub verifier: TokenVerifier,
}

impl AppState {
    pub fn new(repo: RepositoryState, config: AppConfig) -> Self {
        let verifier = TokenVerifier::new(&config.storage_key);
        Self {
            repo,
            config,
            verifier,
        }
    }
}

/// StartupError
///
/// Everything that can stop the process before it serves its first request.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Policy(#[from] policy::PolicyError),
    #[error("migrations diverge from the policy set: {0}")]
    Layout(#[from] migrations::LayoutError),
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// build_state
///
/// Loads the policy set, checks the shipped migrations against it, and opens the
/// configured storage backend. For Postgres the migrations are applied only after
/// the layout check passed.
pub async fn build_state(config: AppConfig) -> Result<AppState, StartupError> {
    let policies = Arc::new(PolicySet::portal()?);
    migrations::verify_layout(&policies, &migrations::shipped_units())?;

    let repo: RepositoryState = match &config.storage {
        StorageBackend::Memory => {
            tracing::warn!("using the in-process store; data is lost on exit");
            Arc::new(MemoryRepository::new(
                policies,
                MemoryOptions {
                    max_connections: config.max_connections as usize,
                    acquire_timeout: config.acquire_timeout,
                },
            ))
        }
        StorageBackend::Postgres(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .acquire_timeout(config.acquire_timeout)
                .connect(url)
                .await?;
            migrations::MIGRATOR.run(&pool).await?;
            tracing::info!("migrations applied");
            Arc::new(PostgresRepository::new(pool))
        }
    };

    Ok(AppState::new(repo, config))
}

/// create_router
///
/// Assembles the routing structure. The API routes sit behind the context
/// injector; `/health` and the documentation do not touch storage and skip it.
pub fn create_router(state: AppState) -> Router {
    // 1. CORS Configuration
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    // Header name constant for Request Correlation.
    let x_request_id = HeaderName::from_static("x-request-id");

    // 2. Base Router Assembly
    let api = routes::api_routes().route_layer(middleware::from_fn_with_state(
        state.clone(),
        context::inject_capability,
    ));

    let base_router = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(handlers::health))
        .merge(api)
        .with_state(state);

    // 3. Observability, Correlation and Caching Layers
    base_router
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(trace_span_logger)
                        .on_response(
                            DefaultOnResponse::new()
                                .level(Level::INFO)
                                .latency_unit(tower_http::LatencyUnit::Millis),
                        ),
                )
                .layer(PropagateRequestIdLayer::new(x_request_id))
                // Responses depend on who is asking; no shared cache may keep them.
                .layer(SetResponseHeaderLayer::overriding(
                    header::CACHE_CONTROL,
                    HeaderValue::from_static("private, no-store"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::VARY,
                    HeaderValue::from_static("Authorization, Cookie"),
                )),
        )
        // 4. CORS Layer
        .layer(cors)
}

/// trace_span_logger
///
/// Builds the `http_request` span for every request, correlated by `x-request-id`.
/// `role` and `subject` are filled in once the context injector has resolved the
/// caller.
fn trace_span_logger(request: &axum::http::Request<axum::body::Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    tracing::info_span!(
        "http_request",
        method = ?request.method(),
        uri = ?request.uri(),
        req_id = %request_id,
        role = tracing::field::Empty,
        subject = tracing::field::Empty,
    )
}
