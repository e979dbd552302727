//! Path resolution inside a project library.
//!
//! Every path the agent touches is built from a project root plus
//! caller-supplied relative segments. Resolution is purely lexical: the
//! result is normalized (`.` dropped, `..` popped) and must stay under the
//! root. Nothing is created and the filesystem is not consulted.

use crate::utils::errors::{AgentError, Result};
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Resolve `segments` under `root`.
///
/// Each segment may itself contain separators (`conf/app.yml`). Leading
/// slashes are treated as relative to the root, matching how the
/// controlling server sends "/" for the library itself.
pub fn resolve<S: AsRef<str>>(root: &Path, segments: &[S]) -> Result<PathBuf> {
    let mut result = root.to_path_buf();
    let base_depth = root.components().count();

    for segment in segments {
        let segment = segment.as_ref();
        if segment.contains('\0') {
            warn!("Path segment contains null byte: {:?}", segment);
            return Err(AgentError::InvalidPath(segment.to_string()));
        }

        let relative = segment.trim_start_matches(['/', '\\']);
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(name) => result.push(name),
                Component::CurDir => continue,
                Component::ParentDir => {
                    // Popping is only allowed while we stay below the root
                    if result.components().count() <= base_depth {
                        warn!("Path escapes project root: {:?}", segment);
                        return Err(AgentError::InvalidPath(segment.to_string()));
                    }
                    result.pop();
                }
                Component::RootDir | Component::Prefix(_) => {
                    warn!("Absolute component in relative path: {:?}", segment);
                    return Err(AgentError::InvalidPath(segment.to_string()));
                }
            }
        }
    }

    if !result.starts_with(root) {
        return Err(AgentError::InvalidPath(result.display().to_string()));
    }

    Ok(result)
}

/// Resolve a single directory entry name under `dir`.
///
/// Used for names that must not carry any path structure: rename targets,
/// created entries, session keys.
pub fn resolve_name(dir: &Path, name: &str) -> Result<PathBuf> {
    validate_name(name)?;
    Ok(dir.join(name))
}

/// Reject empty names, separators, `.`/`..` and control characters.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.chars().any(|c| c.is_control());
    if invalid {
        return Err(AgentError::InvalidPath(name.to_string()));
    }
    Ok(())
}

/// Relative path of `full` under `root`, always `/`-separated.
pub fn relative_slash_path(root: &Path, full: &Path) -> String {
    let Ok(relative) = full.strip_prefix(root) else {
        return String::new();
    };

    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
