//! Nightly backup daemon library
//!
//! Archives one directory tree into a compressed tar stream once a day and
//! uploads it to object storage while the archive is being produced.

pub mod archive;
pub mod config;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod scheduler;
pub mod storage;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{BackupError, Result};
