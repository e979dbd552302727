//! Manifest comparison.
//!
//! `toSync` holds what the client has that we lack or hold differently;
//! `toDelete` holds what we have that the client does not know about.
//! Paths match exactly and case-sensitively. A rename shows up as one
//! entry in each list.

use super::manifest::{FileManifestEntry, Manifest};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult {
    pub to_sync: Vec<FileManifestEntry>,
    pub to_delete: Vec<FileManifestEntry>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.to_sync.is_empty() && self.to_delete.is_empty()
    }
}

/// Diff a client manifest against the server's. Both lists come out sorted by name.
pub fn diff(client: &Manifest, server: &Manifest) -> DiffResult {
    let mut to_sync: Vec<FileManifestEntry> = client
        .iter()
        .filter(|(name, digest)| server.get(*name) != Some(*digest))
        .map(|(name, digest)| FileManifestEntry::new(name.clone(), digest.clone()))
        .collect();

    let mut to_delete: Vec<FileManifestEntry> = server
        .iter()
        .filter(|(name, _)| !client.contains_key(*name))
        .map(|(name, digest)| FileManifestEntry::new(name.clone(), digest.clone()))
        .collect();

    to_sync.sort_by(|a, b| a.name.cmp(&b.name));
    to_delete.sort_by(|a, b| a.name.cmp(&b.name));

    DiffResult { to_sync, to_delete }
}
