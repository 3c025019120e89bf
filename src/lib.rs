//! pkgcache - Multi-process safe disk cache for content packages
//!
//! Fetches packages from a repository once, stores them extracted or as a
//! single file under a shared cache root, and hands out shared read access
//! to any number of threads and processes.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod source;

pub use error::{CacheError, CacheResult};
