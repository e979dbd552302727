//! Utility modules for the file agent.

pub mod errors;
pub mod logger;

pub use errors::{AgentError, Result};
