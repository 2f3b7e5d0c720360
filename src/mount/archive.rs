//! Mount archives
//!
//! Deterministic, uncompressed tar archives of a local directory: entries are
//! sorted, timestamps and ownership normalized, and only the executable bit of
//! a file's mode survives. The same tree always produces the same bytes, so
//! the archive digest can be used to verify a transfer.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Builder, Header};
use walkdir::WalkDir;

use super::exclude::{ExcludeError, ExcludeRules};

/// Errors for archiving operations
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Exclude rules error: {0}")]
    ExcludeError(#[from] ExcludeError),

    #[error("Walk error: {0}")]
    WalkError(#[from] walkdir::Error),

    #[error("Path is not within archive root: {0}")]
    PathNotInRoot(PathBuf),

    #[error("Archive root is not a directory: {0}")]
    NotADirectory(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    File,
    Directory,
    Symlink,
}

#[derive(Debug)]
struct EntryInfo {
    kind: EntryKind,
    symlink_target: Option<PathBuf>,
}

/// What to leave out of an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveOptions {
    /// Extra glob patterns, relative to the archive root.
    pub excludes: Vec<String>,
    /// Leave out version-control metadata.
    pub exclude_vcs: bool,
    /// File with one exclude pattern per line.
    pub ignore_file: Option<PathBuf>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            excludes: Vec::new(),
            exclude_vcs: true,
            ignore_file: None,
        }
    }
}

impl ArchiveOptions {
    pub fn rules(&self) -> Result<ExcludeRules, ExcludeError> {
        let mut rules = ExcludeRules::new()?;
        if !self.exclude_vcs {
            rules = rules.without_vcs()?;
        }
        if let Some(ref ignore) = self.ignore_file {
            rules = rules.with_ignore_file(ignore)?;
        }
        let extra: Vec<&str> = self.excludes.iter().map(String::as_str).collect();
        rules.with_patterns(&extra)
    }
}

/// Result of writing an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Number of entries (files, directories, symlinks).
    pub entries: usize,
    /// Archive size in bytes.
    pub bytes: u64,
    /// Hex SHA-256 of the archive bytes.
    pub sha256: String,
}

/// Builds tar archives of a directory
#[derive(Debug, Clone)]
pub struct Archiver {
    /// Root directory to archive
    root: PathBuf,
    /// Exclusion rules
    exclude: ExcludeRules,
}

impl Archiver {
    /// Archiver for `root` with the default exclusions.
    pub fn new(root: PathBuf) -> Result<Self, ArchiveError> {
        Ok(Self {
            root,
            exclude: ExcludeRules::new()?,
        })
    }

    /// Archiver for `root` configured by `options`.
    pub fn with_options(root: PathBuf, options: &ArchiveOptions) -> Result<Self, ArchiveError> {
        Ok(Self {
            root,
            exclude: options.rules()?,
        })
    }

    /// Replace the exclusion rules
    pub fn with_rules(mut self, rules: ExcludeRules) -> Self {
        self.exclude = rules;
        self
    }

    /// Collect all entries to include, pruning excluded directories
    fn collect_entries(&self) -> Result<BTreeMap<PathBuf, EntryInfo>, ArchiveError> {
        if !self.root.is_dir() {
            return Err(ArchiveError::NotADirectory(self.root.clone()));
        }

        let mut entries = BTreeMap::new();
        let root = &self.root;
        let exclude = &self.exclude;

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
            .into_iter()
            .filter_entry(|entry| match entry.path().strip_prefix(root) {
                Ok(rel) => rel.as_os_str().is_empty() || !exclude.is_excluded(rel),
                Err(_) => false,
            });

        for entry in walker {
            let entry = entry?;
            let path = entry.path();

            let rel_path = path
                .strip_prefix(root)
                .map_err(|_| ArchiveError::PathNotInRoot(path.to_path_buf()))?;

            // Skip root itself
            if rel_path.as_os_str().is_empty() {
                continue;
            }

            let file_type = entry.file_type();
            let info = if file_type.is_symlink() {
                EntryInfo {
                    kind: EntryKind::Symlink,
                    symlink_target: Some(fs::read_link(path)?),
                }
            } else if file_type.is_dir() {
                EntryInfo {
                    kind: EntryKind::Directory,
                    symlink_target: None,
                }
            } else {
                EntryInfo {
                    kind: EntryKind::File,
                    symlink_target: None,
                }
            };

            entries.insert(rel_path.to_path_buf(), info);
        }

        Ok(entries)
    }

    /// Write the archive bytes into `writer`.
    pub fn write_archive<W: Write>(&self, writer: W) -> Result<usize, ArchiveError> {
        let entries = self.collect_entries()?;
        let mut builder = Builder::new(writer);

        for (rel_path, info) in &entries {
            let full_path = self.root.join(rel_path);
            let mut header = Header::new_gnu();
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);

            match info.kind {
                EntryKind::File => {
                    let mut contents = Vec::new();
                    File::open(&full_path)?.read_to_end(&mut contents)?;

                    header.set_path(rel_path)?;
                    header.set_size(contents.len() as u64);
                    header.set_mode(if is_executable(&full_path) { 0o755 } else { 0o644 });
                    header.set_cksum();
                    builder.append(&header, contents.as_slice())?;
                }
                EntryKind::Directory => {
                    header.set_path(format!("{}/", rel_path.display()))?;
                    header.set_size(0);
                    header.set_mode(0o755);
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_cksum();
                    builder.append(&header, &[] as &[u8])?;
                }
                EntryKind::Symlink => {
                    header.set_path(rel_path)?;
                    header.set_size(0);
                    header.set_mode(0o777);
                    header.set_entry_type(tar::EntryType::Symlink);
                    if let Some(ref target) = info.symlink_target {
                        header.set_link_name(target)?;
                    }
                    header.set_cksum();
                    builder.append(&header, &[] as &[u8])?;
                }
            }
        }

        builder.into_inner()?.flush()?;
        Ok(entries.len())
    }

    /// Write the archive to `dest`, creating parent directories.
    pub fn write_to(&self, dest: &Path) -> Result<ArchiveSummary, ArchiveError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut buffer = Vec::new();
        let entries = self.write_archive(&mut buffer)?;
        fs::write(dest, &buffer)?;

        let sha256 = hex::encode(Sha256::digest(&buffer));
        tracing::debug!(
            root = %self.root.display(),
            dest = %dest.display(),
            entries,
            bytes = buffer.len(),
            %sha256,
            "archive written"
        );

        Ok(ArchiveSummary {
            entries,
            bytes: buffer.len() as u64,
            sha256,
        })
    }
}

/// Hex SHA-256 of a file on disk.
pub fn file_sha256(path: &Path) -> Result<String, io::Error> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}
