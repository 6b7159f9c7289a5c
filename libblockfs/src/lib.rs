//! Block-management core of an encrypted network filesystem.
//!
//! - `retrieval`: prioritized, deduplicated block fetching with a worker pool
//! - `cache`: the clean in-memory cache and the persistent disk block cache
//! - `sync`: dirty-block tracking and the per-folder sync engine
//! - `cadapter`: block server adapters

pub mod block;
pub mod cache;
pub mod cadapter;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod retrieval;
pub mod splitter;
pub mod sync;

pub use error::{BlockError, Result};
