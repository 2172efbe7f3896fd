//! HTTP API module.
//!
//! REST endpoints for project sandboxes and the terminal WebSocket.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
