//! API routing: the operator HTTP surface described in SPEC_FULL section
//! 6, grounded on the teacher's `api/routes.rs` (OpenAPI doc assembly,
//! Swagger UI mount, request-id middleware, permissive CORS for local
//! development).

use axum::{middleware as axum_middleware, routing::get, Router};
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use super::handlers::{self, AppState};
use super::middleware;

/// OpenAPI documentation for the operator surface.
#[derive(OpenApi)]
#[openapi(
    paths(handlers::health, handlers::get_status, handlers::push_policy),
    components(schemas(
        handlers::HealthResponse,
        handlers::RegionStatusDto,
        handlers::PushPolicyRequest,
        handlers::PushPolicyResponse,
        handlers::ErrorResponse,
    )),
    tags(
        (name = "health", description = "Health check endpoint"),
        (name = "status", description = "Read-only per-level region telemetry and policy"),
        (name = "policy", description = "Operator policy push")
    ),
    info(
        title = "pwrctld control plane",
        version = "0.1.0",
        description = "Operator-facing status and policy-push surface for the hierarchical power/performance control plane",
    )
)]
struct ApiDoc;

/// Builds the router: health check, read-only status, policy push, and
/// the Swagger UI, wrapped with the request-id middleware and permissive
/// CORS (ambient/operator tooling, not part of the core control loop).
pub fn create_router(state: AppState) -> Router {
    let openapi = ApiDoc::openapi();

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/status", get(handlers::get_status))
        .route("/api/v1/policy", axum::routing::post(handlers::push_policy))
        .with_state(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi))
        .layer(axum_middleware::from_fn(middleware::request_id_middleware))
        .layer(CorsLayer::permissive())
}
