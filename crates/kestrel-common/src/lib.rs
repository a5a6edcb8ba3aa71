//! Kestrel common types, errors, and configuration.
//!
//! This crate provides shared definitions used by the buffer cache and the
//! index engine.

pub mod config;
pub mod error;
pub mod page;

pub use config::{IndexConfig, PoolKind, StorageConfig};
pub use error::{KestrelError, Result};
pub use page::{validate_page_size, PageId, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
