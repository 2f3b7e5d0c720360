//! Mounts
//!
//! A mount describes how code or data gets from the submitting machine to
//! the execution host and how it is exposed to a container there. Each mount
//! contributes up to four pieces to a launch:
//!
//! 1. [`Mount::upload`]: a local transfer, run once per launcher
//! 2. [`Mount::unpack_script`]: host preparation, run once per host
//! 3. [`Mount::transfer_script`] / [`Mount::final_sync_script`]: host-side
//!    syncs before and after the workload
//! 4. [`Mount::bind`]: how a container sees it
//!
//! Variants: [`ObjectStoreMount`] (archive through S3/GCS), [`DirectMount`]
//! (archive straight to the host), [`HostOutputMount`] (host directory synced
//! out), [`BindMount`] (pre-existing paths).

pub mod archive;
mod bind;
mod direct;
pub mod exclude;
mod host_output;
mod object_store;

pub use archive::{ArchiveError, ArchiveOptions, ArchiveSummary, Archiver};
pub use bind::BindMount;
pub use direct::DirectMount;
pub use exclude::{ExcludeError, ExcludeRules};
pub use host_output::{HostOutputMount, OutputSync};
pub use object_store::{ObjectStoreMount, StoreProvider};

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigurationError, TransferError};
use crate::host::{AgentClient, SshTarget};
use crate::shell::CommandRunner;

/// Identity of a mount instance, used to de-duplicate uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountId(Uuid);

impl MountId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a container runtime binds a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BindKind {
    /// `--mount type=bind,source=..,target=..`
    Bind,
    /// `-v source:target`
    Volume,
}

/// A host path exposed inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    pub source: String,
    pub target: String,
    pub kind: BindKind,
}

impl BindSpec {
    /// The `docker run` flag for this bind.
    pub fn docker_flag(&self) -> String {
        match self.kind {
            BindKind::Bind => format!("--mount type=bind,source={},target={}", self.source, self.target),
            BindKind::Volume => format!("-v {}:{}", self.source, self.target),
        }
    }
}

/// Where a direct transfer is headed.
#[derive(Debug, Clone)]
pub enum TransferTarget {
    Ssh(SshTarget),
    Agent(AgentClient),
}

/// What a mount may use to transfer itself.
#[derive(Clone, Copy)]
pub struct TransferContext<'a> {
    pub shell: &'a dyn CommandRunner,
    pub target: Option<&'a TransferTarget>,
}

impl<'a> TransferContext<'a> {
    pub fn new(shell: &'a dyn CommandRunner) -> Self {
        Self { shell, target: None }
    }

    pub fn with_target(mut self, target: Option<&'a TransferTarget>) -> Self {
        self.target = target;
        self
    }
}

pub trait Mount: fmt::Debug + Send + Sync {
    fn id(&self) -> MountId;

    /// Path on the execution host.
    fn host_path(&self) -> String;

    /// Path as seen from inside a container.
    fn container_path(&self) -> String;

    /// Whether the runner adds this mount to the search-path variable.
    fn on_search_path(&self) -> bool;

    /// Move local content toward the host. Runs on the submitting machine.
    fn upload(&self, _ctx: &TransferContext<'_>) -> Result<(), TransferError> {
        Ok(())
    }

    /// Prepare the host: download, extract, start sync loops.
    fn unpack_script(&self) -> Option<String> {
        None
    }

    /// Host-side transfer run after unpacking, before the runners.
    fn transfer_script(&self) -> Option<String> {
        None
    }

    /// Host-side flush run after the runners finish.
    fn final_sync_script(&self) -> Option<String> {
        None
    }

    fn bind(&self) -> Option<BindSpec> {
        Some(BindSpec {
            source: self.host_path(),
            target: self.container_path(),
            kind: BindKind::Bind,
        })
    }
}

/// Remembers which mounts have been uploaded so each transfers once.
#[derive(Debug, Default)]
pub struct UploadRegistry {
    uploaded: HashSet<MountId>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upload `mount` unless it already was. Returns whether a transfer ran.
    ///
    /// A failed upload is not recorded, so the next plan retries it.
    pub fn upload(&mut self, mount: &dyn Mount, ctx: &TransferContext<'_>) -> Result<bool, TransferError> {
        let id = mount.id();
        if self.uploaded.contains(&id) {
            tracing::debug!(mount = %id, "mount already uploaded, skipping");
            return Ok(false);
        }
        mount.upload(ctx)?;
        self.uploaded.insert(id);
        tracing::info!(mount = %id, host_path = %mount.host_path(), "mount uploaded");
        Ok(true)
    }

    pub fn contains(&self, id: MountId) -> bool {
        self.uploaded.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.uploaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uploaded.is_empty()
    }
}

/// Directory local archives are staged in.
pub fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("remlaunch")
}

pub(crate) fn absolutize(path: &Path) -> Result<PathBuf, ConfigurationError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })
}

pub(crate) fn require_absolute(field: &'static str, value: &str) -> Result<(), ConfigurationError> {
    if value.starts_with('/') {
        Ok(())
    } else {
        Err(ConfigurationError::NotAbsolute {
            field,
            value: value.to_string(),
        })
    }
}

/// `dirname` of a remote path, falling back to `/`.
pub(crate) fn remote_parent(path: &str) -> &str {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

/// `basename` of a remote path.
pub(crate) fn remote_file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit_once('/')
        .map(|(_, name)| name)
        .unwrap_or(path)
}
