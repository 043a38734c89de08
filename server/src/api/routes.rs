//! HTTP router: the GraphQL endpoint plus a liveness probe.

use async_graphql_axum::GraphQL;
use axum::routing::get;
use axum::Router;

use super::schema::VoteSchema;

/// Build the router, mounting the schema at the configured path.
#[must_use]
pub fn build_router(schema: VoteSchema, graphql_path: &str) -> Router {
    Router::new()
        .route("/health", get(health))
        .route_service(graphql_path, GraphQL::new(schema))
}

async fn health() -> &'static str {
    "ok"
}
