//! Gateway server implementation

pub mod auth;
pub mod handler;
mod router;
mod server;

pub use auth::{extract_token, session_middleware};
pub use router::{AppState, create_router, login_limiter};
pub use server::Gateway;
