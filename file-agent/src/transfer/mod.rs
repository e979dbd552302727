//! Moving bytes into the agent: chunked uploads, remote downloads and archives.

pub mod archive;
pub mod progress;
pub mod remote;
pub mod shard;
