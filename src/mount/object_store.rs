//! Archive through an object store.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::archive::{ArchiveOptions, Archiver};
use super::{
    absolutize, default_staging_dir, remote_parent, require_absolute, BindKind, BindSpec, Mount,
    MountId, TransferContext,
};
use crate::error::{ConfigurationError, TransferError};
use crate::shell::{quote, ShellCommand};

/// Object store flavour, chosen by the CLI it is driven with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreProvider {
    /// Amazon S3 through `aws s3`.
    S3,
    /// Google Cloud Storage through `gsutil`.
    Gcs,
}

impl StoreProvider {
    pub fn name(self) -> &'static str {
        match self {
            Self::S3 => "s3",
            Self::Gcs => "gcs",
        }
    }

    /// Copy one object or file.
    pub fn copy(self, from: &str, to: &str) -> String {
        match self {
            Self::S3 => format!("aws s3 cp {} {}", from, to),
            Self::Gcs => format!("gsutil cp {} {}", from, to),
        }
    }

    /// Copy a directory tree or prefix.
    pub fn copy_recursive(self, from: &str, to: &str) -> String {
        match self {
            Self::S3 => format!("aws s3 cp --recursive {} {}", from, to),
            Self::Gcs => format!("gsutil -m cp -r {} {}", from, to),
        }
    }
}

/// Archives a local directory (or takes a single file), uploads it under a
/// prefix, and has the host download and extract it before the workload runs.
///
/// The archive name is a fresh UUID per instance unless a stable name is
/// given, so concurrent launches never overwrite each other's code.
#[derive(Debug, Clone)]
pub struct ObjectStoreMount {
    id: MountId,
    provider: StoreProvider,
    prefix: String,
    local_path: PathBuf,
    name: String,
    host_path: Option<String>,
    container_path: Option<String>,
    remote_tar: Option<String>,
    search_path: bool,
    archive: ArchiveOptions,
    acl: Option<String>,
    region: Option<String>,
    no_sign_request: bool,
    staging_dir: PathBuf,
}

impl ObjectStoreMount {
    /// `prefix` includes the scheme and bucket, e.g. `s3://bucket/code`.
    pub fn new(
        provider: StoreProvider,
        prefix: impl Into<String>,
        local_path: impl AsRef<Path>,
    ) -> Result<Self, ConfigurationError> {
        let prefix = prefix.into().trim_end_matches('/').to_string();
        if prefix.is_empty() {
            return Err(ConfigurationError::Empty("object store prefix"));
        }
        Ok(Self {
            id: MountId::new(),
            provider,
            prefix,
            local_path: absolutize(local_path.as_ref())?,
            name: Uuid::new_v4().to_string(),
            host_path: None,
            container_path: None,
            remote_tar: None,
            search_path: false,
            archive: ArchiveOptions::default(),
            acl: None,
            region: None,
            no_sign_request: false,
            staging_dir: default_staging_dir(),
        })
    }

    /// Stable archive name (without `.tar`).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_host_path(mut self, host_path: impl Into<String>) -> Result<Self, ConfigurationError> {
        let host_path = host_path.into();
        require_absolute("host_path", &host_path)?;
        self.host_path = Some(host_path);
        Ok(self)
    }

    pub fn with_container_path(mut self, container_path: impl Into<String>) -> Result<Self, ConfigurationError> {
        let container_path = container_path.into();
        require_absolute("container_path", &container_path)?;
        self.container_path = Some(container_path);
        Ok(self)
    }

    /// Where the host stores the downloaded archive.
    pub fn with_remote_tar(mut self, remote_tar: impl Into<String>) -> Self {
        self.remote_tar = Some(remote_tar.into());
        self
    }

    pub fn with_search_path(mut self, search_path: bool) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn with_archive_options(mut self, archive: ArchiveOptions) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_staging_dir(mut self, staging_dir: PathBuf) -> Self {
        self.staging_dir = staging_dir;
        self
    }

    /// Canned ACL applied on upload.
    pub fn with_acl(mut self, acl: impl Into<String>) -> Self {
        self.acl = Some(acl.into());
        self
    }

    /// S3 region for the upload.
    pub fn with_region(mut self, region: impl Into<String>) -> Result<Self, ConfigurationError> {
        if self.provider != StoreProvider::S3 {
            return Err(ConfigurationError::Unsupported {
                backend: "gcs mount",
                feature: "region",
            });
        }
        self.region = Some(region.into());
        Ok(self)
    }

    /// Download anonymously on the host (public S3 buckets).
    pub fn with_no_sign_request(mut self, no_sign_request: bool) -> Result<Self, ConfigurationError> {
        if no_sign_request && self.provider != StoreProvider::S3 {
            return Err(ConfigurationError::Unsupported {
                backend: "gcs mount",
                feature: "no_sign_request",
            });
        }
        self.no_sign_request = no_sign_request;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_directory(&self) -> bool {
        self.local_path.is_dir()
    }

    fn tar_name(&self) -> String {
        format!("{}.tar", self.name)
    }

    /// Local staging path of the archive.
    pub fn local_tar(&self) -> PathBuf {
        self.staging_dir.join(self.tar_name())
    }

    fn local_file_name(&self) -> String {
        self.local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }

    /// Object URL the content is uploaded to.
    pub fn object_url(&self) -> String {
        if self.is_directory() {
            format!("{}/{}", self.prefix, self.tar_name())
        } else {
            format!("{}/{}", self.prefix, self.local_file_name())
        }
    }

    fn remote_tar(&self) -> String {
        self.remote_tar
            .clone()
            .unwrap_or_else(|| format!("/tmp/{}", self.tar_name()))
    }

    fn upload_flags(&self) -> String {
        let mut flags = String::new();
        if let Some(ref acl) = self.acl {
            match self.provider {
                StoreProvider::S3 => flags.push_str(&format!(" --acl {}", quote(acl))),
                StoreProvider::Gcs => flags.push_str(&format!(" -a {}", quote(acl))),
            }
        }
        if let Some(ref region) = self.region {
            flags.push_str(&format!(" --region {}", quote(region)));
        }
        flags
    }

    fn download_flags(&self) -> &'static str {
        if self.no_sign_request {
            " --no-sign-request"
        } else {
            ""
        }
    }
}

impl Mount for ObjectStoreMount {
    fn id(&self) -> MountId {
        self.id
    }

    fn host_path(&self) -> String {
        self.host_path
            .clone()
            .unwrap_or_else(|| format!("/tmp/{}", self.name))
    }

    fn container_path(&self) -> String {
        self.container_path
            .clone()
            .unwrap_or_else(|| self.local_path.display().to_string())
    }

    fn on_search_path(&self) -> bool {
        self.search_path
    }

    fn upload(&self, ctx: &TransferContext<'_>) -> Result<(), TransferError> {
        let source = if self.is_directory() {
            let local_tar = self.local_tar();
            let summary = Archiver::with_options(self.local_path.clone(), &self.archive)
                .and_then(|archiver| archiver.write_to(&local_tar))
                .map_err(|source| TransferError::Archive {
                    path: self.local_path.clone(),
                    source,
                })?;
            tracing::info!(
                local = %self.local_path.display(),
                archive = %local_tar.display(),
                bytes = summary.bytes,
                "mount archived"
            );
            local_tar
        } else {
            self.local_path.clone()
        };

        let copy = format!(
            "{}{}",
            self.provider
                .copy(&quote(&source.display().to_string()), &self.object_url()),
            self.upload_flags()
        );
        ctx.shell.run_checked(&ShellCommand::new(copy))?;
        Ok(())
    }

    fn unpack_script(&self) -> Option<String> {
        let host_path = self.host_path();
        let script = if self.is_directory() {
            let remote_tar = self.remote_tar();
            format!(
                "{}{}\nmkdir -p {}\ntar -xf {} -C {}",
                self.provider.copy(&self.object_url(), &remote_tar),
                self.download_flags(),
                host_path,
                remote_tar,
                host_path
            )
        } else {
            format!(
                "mkdir -p {}\n{}{}",
                remote_parent(&host_path),
                self.provider.copy(&self.object_url(), &host_path),
                self.download_flags()
            )
        };
        Some(script)
    }

    fn bind(&self) -> Option<BindSpec> {
        Some(BindSpec {
            source: self.host_path(),
            target: self.container_path(),
            kind: BindKind::Bind,
        })
    }
}
