//! # aumeta-jobs
//!
//! Cooperative metadata indexing tasks for aumeta.
//!
//! This crate provides:
//! - The task lifecycle (START, stepping, FINISH) with cancellation
//! - Reindexing tasks that extract, validate and record an AU's metadata
//! - Removal tasks that delete an AU's recorded metadata
//! - The indexing manager that admits pending AUs and tracks task history
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use aumeta_jobs::{IndexerConfig, IndexingManager};
//! use aumeta_db::{Database, DbConfig};
//!
//! let db = Database::open(&DbConfig::from_env()).await?;
//!
//! // Resolver and catalog are supplied by the content repository
//! let manager = IndexingManager::new(db, resolver, catalog, IndexerConfig::from_env());
//! let handle = manager.start()?;
//!
//! // Listen for events
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! // Graceful shutdown
//! handle.shutdown().await?;
//! ```

pub mod config;
pub mod manager;
pub mod reindex;
pub mod removal;
pub mod spill;
pub mod task;
pub mod validator;

// Test doubles shared with integration tests in tests/.
pub mod test_support;

// Re-export core types
pub use aumeta_core::*;

pub use config::IndexerConfig;
pub use manager::{IndexerEvent, IndexerHandle, IndexingManager};
pub use reindex::{ReindexingTask, ReindexingTaskBuilder};
pub use removal::RemovalTask;
pub use spill::{SpillReader, SpillWriter};
pub use task::{SchedulableTask, TaskControl, TaskDriver, TaskEvent, TaskHandle, TaskSnapshot};
pub use validator::{validate, WarningLog};
