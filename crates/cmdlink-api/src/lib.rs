//! HTTP surface for cmdlink.
//!
//! Provides:
//! - `POST /dispatch` direct trigger with optional bearer authentication
//! - `/health` and `/health/live` for the trigger process
//! - `/health` for the status consumer process
//! - Graceful shutdown on Ctrl+C/SIGTERM

pub mod auth;
pub mod handlers;
pub mod models;
pub mod server;
pub mod shutdown;

pub use auth::AuthState;
pub use models::{ApiResult, ErrorResponse};
pub use server::{ConsumerState, ServerState, create_consumer_router, create_router, serve};
pub use shutdown::shutdown_signal;
