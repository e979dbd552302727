//! Content-addressed manifests and manifest diffing.

pub mod diff;
pub mod manifest;

pub use diff::{diff, DiffResult};
pub use manifest::{build_manifest, FileManifestEntry, Manifest, DIGEST_ALGORITHM};
