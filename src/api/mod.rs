//! HTTP surface for chat, similarity search and provider administration

pub mod handlers;
pub mod models;
pub mod routes;

pub use handlers::AppState;
pub use models::{error_codes, ApiError, ApiFailure, ApiResult};
pub use routes::build_router;
