//! File Agent Library
//!
//! Per-host agent that keeps project library directories in sync with a
//! controlling server: manifest diffing, chunked and remote uploads, archive
//! extraction, and backup-wrapped file mutations.

pub mod api;
pub mod backup;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod service;
pub mod sync;
pub mod transfer;
pub mod utils;
pub mod ws;

// Re-export commonly used types
pub use config::Config;
pub use service::FileMutationService;
pub use utils::errors::{AgentError, Result};
