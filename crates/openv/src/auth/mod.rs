//! Authentication module.
//!
//! Validates HS256 bearer tokens issued elsewhere. Only the tenant id
//! carried in `sub` is used.

mod claims;
mod config;
mod error;
mod middleware;

pub use claims::Claims;
pub use config::{AuthConfig, ConfigValidationError};
pub use error::AuthError;
pub use middleware::{AuthState, CurrentUser, auth_middleware, request_token};
