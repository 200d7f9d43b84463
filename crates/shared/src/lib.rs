//! Reelkit Shared Types and Utilities
//!
//! This crate contains types and utilities shared across the Reelkit platform.

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
