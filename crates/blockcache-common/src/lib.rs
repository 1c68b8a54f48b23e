//! Block cache common - shared types and utilities
//!
//! This crate provides the identifiers, error definitions and process-wide
//! configuration used by the buffer cache and its consumers.

pub mod config;
pub mod error;
pub mod types;

pub use config::CacheConfig;
pub use error::{Error, Result};
pub use types::*;
