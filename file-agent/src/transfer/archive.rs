//! Archive extraction into a project directory.
//!
//! Supports zip, plain tar, gzip'd tar and zstd'd tar. Only directories and
//! regular files are materialized; links, devices and entries that would
//! land outside the destination are skipped. A failure halfway leaves the
//! already-extracted entries in place.

use crate::utils::errors::{AgentError, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_MAGIC: &[u8] = b"PK\x05\x06";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];
const USTAR_OFFSET: usize = 257;
const USTAR_MAGIC: &[u8] = b"ustar";
/// Leading bytes needed to recognize any supported format.
pub const SNIFF_LEN: usize = USTAR_OFFSET + USTAR_MAGIC.len();

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
    TarZst,
}

impl ArchiveFormat {
    /// Format implied by a file name, if any.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar.zst") || lower.ends_with(".tzst") {
            Some(Self::TarZst)
        } else if lower.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }

    /// Format recognized from the leading bytes of a file.
    pub fn sniff(path: &Path) -> io::Result<Option<Self>> {
        let mut head = Vec::with_capacity(SNIFF_LEN);
        File::open(path)?
            .take(SNIFF_LEN as u64)
            .read_to_end(&mut head)?;

        let format = if head.starts_with(ZIP_MAGIC) || head.starts_with(ZIP_EMPTY_MAGIC) {
            Some(Self::Zip)
        } else if head.starts_with(GZIP_MAGIC) {
            Some(Self::TarGz)
        } else if head.starts_with(ZSTD_MAGIC) {
            Some(Self::TarZst)
        } else if head.get(USTAR_OFFSET..) == Some(USTAR_MAGIC) {
            Some(Self::Tar)
        } else {
            None
        };
        Ok(format)
    }

    /// Extension first, then content.
    pub fn detect(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if let Some(format) = Self::from_name(&name) {
            return Ok(format);
        }
        Self::sniff(path)?.ok_or(AgentError::UnsupportedFormat(name))
    }
}

/// Counters of one extraction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub files: usize,
    pub directories: usize,
    pub skipped: usize,
    pub bytes: u64,
}

/// Where an archive entry lands after stripping.
#[derive(Debug, PartialEq, Eq)]
enum EntryTarget {
    Relative(PathBuf),
    /// Nothing left after stripping
    Empty,
    /// Absolute or climbing out of the destination
    Unsafe,
}

fn strip_entry_path(raw: &Path, strip_components: usize) -> EntryTarget {
    let mut parts = Vec::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return EntryTarget::Unsafe;
            }
        }
    }
    if parts.len() <= strip_components {
        return EntryTarget::Empty;
    }
    EntryTarget::Relative(parts[strip_components..].iter().collect())
}

fn extraction_io(path: &Path, e: io::Error) -> AgentError {
    AgentError::Extraction(format!("{}: {}", path.display(), e))
}

/// Whether writing `outpath` stays under `root`, a canonical directory.
///
/// Symlinks already present in the tree are followed: the nearest existing
/// ancestor of the directory to create must resolve under `root`. A file
/// target must not itself be a symlink.
fn stays_inside(root: &Path, outpath: &Path, is_dir: bool) -> bool {
    let is_link = fs::symlink_metadata(outpath)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);
    if is_link && !is_dir {
        return false;
    }

    let mut existing = if is_dir { outpath } else { outpath.parent().unwrap_or(root) };
    while fs::symlink_metadata(existing).is_err() {
        match existing.parent() {
            Some(parent) => existing = parent,
            None => return false,
        }
    }
    fs::canonicalize(existing)
        .map(|resolved| resolved.starts_with(root))
        .unwrap_or(false)
}

/// Extract `archive` into `dest`, dropping the first `strip_components`
/// path segments of every entry.
pub fn extract(archive: &Path, dest: &Path, strip_components: usize) -> Result<ExtractReport> {
    let format = ArchiveFormat::detect(archive)?;
    fs::create_dir_all(dest).map_err(|e| extraction_io(dest, e))?;
    let dest = &fs::canonicalize(dest).map_err(|e| extraction_io(dest, e))?;

    info!(
        "Extracting {} ({:?}, strip {}) into {}",
        archive.display(),
        format,
        strip_components,
        dest.display()
    );

    let report = match format {
        ArchiveFormat::Zip => extract_zip(archive, dest, strip_components)?,
        ArchiveFormat::Tar => {
            extract_tar(BufReader::new(File::open(archive)?), dest, strip_components)?
        }
        ArchiveFormat::TarGz => extract_tar(
            GzDecoder::new(BufReader::new(File::open(archive)?)),
            dest,
            strip_components,
        )?,
        ArchiveFormat::TarZst => {
            let decoder = zstd::stream::read::Decoder::new(File::open(archive)?)
                .map_err(|e| AgentError::Extraction(format!("zstd stream: {}", e)))?;
            extract_tar(decoder, dest, strip_components)?
        }
    };

    info!(
        files = report.files,
        skipped = report.skipped,
        bytes = report.bytes,
        "Extraction finished"
    );
    Ok(report)
}

fn extract_zip(archive_path: &Path, dest: &Path, strip_components: usize) -> Result<ExtractReport> {
    let mut archive = zip::ZipArchive::new(File::open(archive_path)?)
        .map_err(|e| AgentError::Extraction(format!("Failed to read zip archive: {}", e)))?;
    let mut report = ExtractReport::default();

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| AgentError::Extraction(format!("Zip index error: {}", e)))?;
        let name = file.name().to_string();

        let relative = match strip_entry_path(Path::new(&name), strip_components) {
            EntryTarget::Relative(p) => p,
            EntryTarget::Empty => continue,
            EntryTarget::Unsafe => {
                warn!("Skipping unsafe archive entry: {}", name);
                report.skipped += 1;
                continue;
            }
        };
        let outpath = dest.join(relative);

        if matches!(file.unix_mode(), Some(mode) if mode & S_IFMT == S_IFLNK) {
            warn!("Skipping symlink archive entry: {}", name);
            report.skipped += 1;
            continue;
        }
        if !stays_inside(dest, &outpath, file.is_dir()) {
            warn!("Skipping archive entry that resolves outside {}: {}", dest.display(), name);
            report.skipped += 1;
            continue;
        }

        if file.is_dir() {
            fs::create_dir_all(&outpath).map_err(|e| extraction_io(&outpath, e))?;
            report.directories += 1;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent).map_err(|e| extraction_io(parent, e))?;
        }
        let mut outfile = File::create(&outpath).map_err(|e| extraction_io(&outpath, e))?;
        let written = io::copy(&mut file, &mut outfile).map_err(|e| extraction_io(&outpath, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = file.unix_mode() {
                let _ = fs::set_permissions(&outpath, fs::Permissions::from_mode(mode & 0o7777));
            }
        }

        debug!("Extracted {} ({} bytes)", name, written);
        report.files += 1;
        report.bytes += written;
    }

    Ok(report)
}

fn extract_tar<R: Read>(reader: R, dest: &Path, strip_components: usize) -> Result<ExtractReport> {
    let mut archive = tar::Archive::new(reader);
    archive.set_overwrite(true);
    let mut report = ExtractReport::default();

    let entries = archive
        .entries()
        .map_err(|e| AgentError::Extraction(format!("Failed to read tar archive: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| AgentError::Extraction(format!("Corrupt tar entry: {}", e)))?;
        let raw = entry
            .path()
            .map_err(|e| AgentError::Extraction(format!("Bad tar entry path: {}", e)))?
            .to_path_buf();
        let entry_type = entry.header().entry_type();

        let relative = match strip_entry_path(&raw, strip_components) {
            EntryTarget::Relative(p) => p,
            EntryTarget::Empty => continue,
            EntryTarget::Unsafe => {
                warn!("Skipping unsafe archive entry: {}", raw.display());
                report.skipped += 1;
                continue;
            }
        };
        let outpath = dest.join(relative);

        let writes = entry_type.is_dir() || entry_type.is_file();
        if writes && !stays_inside(dest, &outpath, entry_type.is_dir()) {
            warn!(
                "Skipping archive entry that resolves outside {}: {}",
                dest.display(),
                raw.display()
            );
            report.skipped += 1;
            continue;
        }

        if entry_type.is_dir() {
            fs::create_dir_all(&outpath).map_err(|e| extraction_io(&outpath, e))?;
            report.directories += 1;
        } else if entry_type.is_file() {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent).map_err(|e| extraction_io(parent, e))?;
            }
            entry
                .unpack(&outpath)
                .map_err(|e| AgentError::Extraction(format!("{}: {}", raw.display(), e)))?;
            report.files += 1;
            report.bytes += entry.header().size().unwrap_or(0);
        } else {
            // Links, devices and FIFOs never reach the project tree
            warn!("Skipping {:?} archive entry: {}", entry_type, raw.display());
            report.skipped += 1;
        }
    }

    Ok(report)
}
