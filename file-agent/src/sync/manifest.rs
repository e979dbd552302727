//! Content manifests.
//!
//! A manifest maps every regular file under a directory to the SHA-256 of
//! its contents, keyed by `/`-separated relative path. The algorithm is part
//! of the wire contract with the controlling server: clients compute the
//! same digest locally and diff against ours.

use crate::fs::walker::walk_directory_with_callback;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Digest algorithm advertised to clients.
pub const DIGEST_ALGORITHM: &str = "sha256";

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Relative path → hex digest.
pub type Manifest = HashMap<String, String>;

/// One manifest entry as exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifestEntry {
    pub name: String,
    pub digest: String,
}

impl FileManifestEntry {
    pub fn new(name: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            digest: digest.into(),
        }
    }
}

/// Hash a file's contents, streaming in fixed-size reads.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash an in-memory buffer with the manifest algorithm.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Build the manifest of every regular file under `base_dir`.
pub fn build_manifest(base_dir: &Path) -> io::Result<Manifest> {
    let mut manifest = Manifest::new();
    let mut failure = None;

    walk_directory_with_callback(base_dir, |file| {
        if failure.is_some() {
            return;
        }
        match hash_file(&file.path) {
            Ok(digest) => {
                manifest.insert(file.relative_path.clone(), digest);
            }
            // A file removed between listing and hashing is simply not part of the tree
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => failure = Some(e),
        }
    })?;

    match failure {
        Some(e) => Err(e),
        None => Ok(manifest),
    }
}

/// Collapse wire entries into a manifest. Later duplicates win.
pub fn manifest_from_entries(entries: &[FileManifestEntry]) -> Manifest {
    entries
        .iter()
        .map(|e| (e.name.clone(), e.digest.clone()))
        .collect()
}
