//! Operator HTTP surface (SPEC_FULL section 6): read-only status and a
//! policy-push endpoint, layered over the core control plane. Ambient
//! observability/control tooling, not part of the core control loop.

pub mod handlers;
pub mod middleware;
pub mod routes;

pub use handlers::AppState;
pub use routes::create_router;
