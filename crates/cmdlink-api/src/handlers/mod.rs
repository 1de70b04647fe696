//! HTTP handlers.

pub mod basic;
pub mod dispatch;

pub use crate::server::{ConsumerState, ServerState};
