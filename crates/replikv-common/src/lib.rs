//! replikv Common - Shared types and utilities
//!
//! This crate provides the identifiers, error definitions and configuration
//! used across all replikv components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
