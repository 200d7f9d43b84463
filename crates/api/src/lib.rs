//! Reelkit API Library
//!
//! HTTP surface for the Reelkit billing service.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
