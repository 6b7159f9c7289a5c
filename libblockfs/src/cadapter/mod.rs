//! Block server adapters (cAdapter)
//!
//! Submodules:
//! - `client`: the `BlockServer` interface and a retrying client wrapper
//! - `localfs`: block server backed by a local directory
//! - `memory`: in-process block server
pub mod client;
pub mod localfs;
pub mod memory;

pub use client::{BlockServer, BlockServerClient, RetryConfig};
pub use localfs::LocalFsBlockServer;
pub use memory::MemBlockServer;
