//! # aumeta-core
//!
//! Core types, traits, and utilities for aumeta, the archival unit metadata
//! indexer.
//!
//! This crate provides the domain model and collaborator interfaces that the
//! storage and task crates depend on.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod metadata_util;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{is_transient_sqlx, Error, ExtractError, Result};
pub use models::*;
pub use traits::*;
