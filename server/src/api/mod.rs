//! GraphQL API surface.

pub mod routes;
pub mod schema;

pub use routes::build_router;
pub use schema::{build_schema, VoteSchema};
