//! HTTP serving layer.
//!
//! Every batch route passes through the rate limit middleware before its
//! handler runs.

mod middleware;
mod routes;
mod server;

pub use middleware::rate_limit;
pub use routes::{router, AppState};
pub use server::HttpServer;
