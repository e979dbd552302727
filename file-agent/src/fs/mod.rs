//! Filesystem helpers: path resolution, traversal and metadata.

pub mod metadata;
pub mod path;
pub mod walker;
