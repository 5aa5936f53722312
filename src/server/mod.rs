//! HTTP surface: preview enqueue, status polling, and apply.

pub mod api;
pub mod router;

pub use api::{AppState, SharedState, api_router};
pub use router::{build_router, build_services, start_server};
