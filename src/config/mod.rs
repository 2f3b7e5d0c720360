//! Launch files
//!
//! A launch file is TOML describing one launch: the backend (`[launcher]`),
//! script options (`[launch]`), one runner (`[runner]` plus `[context]`) and
//! its mounts (`[[mount]]`). An optional defaults file is layered underneath
//! with [`merge::deep_merge`].
//!
//! ```toml
//! [launcher]
//! type = "ssh"
//! target = { host = "10.0.0.5", pem = "~/.ssh/id.pem" }
//!
//! [runner]
//! type = "container"
//! image = "python:3.12"
//!
//! [[mount]]
//! type = "direct"
//! local_path = "."
//! container_path = "/code"
//! search_path = true
//! ```
//!
//! Relative local paths resolve against the launch file's directory.

pub mod merge;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::ConfigurationError;
use crate::launcher::{Backend, LaunchConfig, LaunchOptions};
use crate::mount::{
    ArchiveOptions, BindKind, BindMount, DirectMount, HostOutputMount, Mount, ObjectStoreMount,
    OutputSync, StoreProvider,
};
use crate::runner::{ExecutionContext, Runner, RunnerKind};

pub use merge::{deep_merge, merge_layers};

/// Parsed launch file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchFile {
    pub launcher: Backend,
    #[serde(default)]
    pub launch: LaunchOptions,
    pub runner: RunnerKind,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default, rename = "mount")]
    pub mounts: Vec<MountSection>,
    /// Directory relative local paths resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
    /// SHA-256 of the launch file bytes, for provenance in logs.
    #[serde(skip)]
    pub digest: Option<String>,
}

/// `[context]`: how every invocation of the runner is set up.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextSection {
    pub work_dir: Option<String>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    pub startup: Option<String>,
    pub search_path_var: Option<String>,
    pub entry_command: Option<String>,
    /// Runner setup, run once before the workload.
    pub setup: Option<String>,
    /// Runner post, run once after the workload.
    pub post: Option<String>,
}

impl ContextSection {
    fn execution_context(&self) -> ExecutionContext {
        let mut context = ExecutionContext::new();
        if let Some(ref work_dir) = self.work_dir {
            context = context.with_work_dir(work_dir.clone());
        }
        for (key, value) in &self.envs {
            context = context.with_env(key.clone(), value.clone());
        }
        if let Some(ref startup) = self.startup {
            context = context.with_startup(startup.clone());
        }
        if let Some(ref var) = self.search_path_var {
            context = context.with_search_path_var(var.clone());
        }
        if let Some(ref entry) = self.entry_command {
            context = context.with_entry_command(entry.clone());
        }
        context
    }
}

fn default_exclude_vcs() -> bool {
    true
}

/// Archive excludes of a `[[mount]]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveSection {
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default = "default_exclude_vcs")]
    pub exclude_vcs: bool,
    pub ignore_file: Option<PathBuf>,
}

impl Default for ArchiveSection {
    fn default() -> Self {
        Self {
            excludes: Vec::new(),
            exclude_vcs: true,
            ignore_file: None,
        }
    }
}

impl ArchiveSection {
    fn options(&self, base_dir: &Path) -> ArchiveOptions {
        ArchiveOptions {
            excludes: self.excludes.clone(),
            exclude_vcs: self.exclude_vcs,
            ignore_file: self.ignore_file.as_deref().map(|p| resolve(base_dir, p)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MountSection {
    ObjectStore(ObjectStoreSection),
    Direct(DirectSection),
    HostOutput(HostOutputSection),
    Bind(BindSection),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectStoreSection {
    pub provider: StoreProvider,
    pub prefix: String,
    pub local_path: PathBuf,
    pub name: Option<String>,
    pub host_path: Option<String>,
    pub container_path: Option<String>,
    pub remote_tar: Option<String>,
    #[serde(default)]
    pub search_path: bool,
    #[serde(default)]
    pub archive: ArchiveSection,
    pub acl: Option<String>,
    pub region: Option<String>,
    #[serde(default)]
    pub no_sign_request: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectSection {
    pub local_path: PathBuf,
    pub name: Option<String>,
    pub host_path: Option<String>,
    pub container_path: Option<String>,
    pub remote_tar: Option<String>,
    #[serde(default)]
    pub search_path: bool,
    #[serde(default)]
    pub archive: ArchiveSection,
}

fn default_sync_interval() -> u32 {
    15
}

fn default_watch_preemption() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncSection {
    pub provider: StoreProvider,
    pub prefix: String,
    #[serde(default = "default_sync_interval")]
    pub interval: u32,
    #[serde(default = "default_watch_preemption")]
    pub watch_preemption: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostOutputSection {
    pub container_path: String,
    pub host_path: Option<String>,
    pub sync: Option<SyncSection>,
    pub local_mirror: Option<PathBuf>,
    #[serde(default)]
    pub search_path: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindSection {
    pub host_path: String,
    pub container_path: String,
    pub kind: Option<BindKind>,
    #[serde(default)]
    pub search_path: bool,
}

impl MountSection {
    /// Build the mount, resolving local paths against `base_dir`.
    pub fn build(&self, base_dir: &Path) -> Result<Arc<dyn Mount>, ConfigurationError> {
        Ok(match self {
            Self::ObjectStore(section) => {
                let mut mount = ObjectStoreMount::new(
                    section.provider,
                    section.prefix.clone(),
                    resolve(base_dir, &section.local_path),
                )?
                .with_search_path(section.search_path)
                .with_archive_options(section.archive.options(base_dir))
                .with_no_sign_request(section.no_sign_request)?;
                if let Some(ref name) = section.name {
                    mount = mount.with_name(name.clone());
                }
                if let Some(ref host_path) = section.host_path {
                    mount = mount.with_host_path(host_path.clone())?;
                }
                if let Some(ref container_path) = section.container_path {
                    mount = mount.with_container_path(container_path.clone())?;
                }
                if let Some(ref remote_tar) = section.remote_tar {
                    mount = mount.with_remote_tar(remote_tar.clone());
                }
                if let Some(ref acl) = section.acl {
                    mount = mount.with_acl(acl.clone());
                }
                if let Some(ref region) = section.region {
                    mount = mount.with_region(region.clone())?;
                }
                Arc::new(mount)
            }
            Self::Direct(section) => {
                let mut mount = DirectMount::new(resolve(base_dir, &section.local_path))?
                    .with_search_path(section.search_path)
                    .with_archive_options(section.archive.options(base_dir));
                if let Some(ref name) = section.name {
                    mount = mount.with_name(name.clone());
                }
                if let Some(ref host_path) = section.host_path {
                    mount = mount.with_host_path(host_path.clone())?;
                }
                if let Some(ref container_path) = section.container_path {
                    mount = mount.with_container_path(container_path.clone())?;
                }
                if let Some(ref remote_tar) = section.remote_tar {
                    mount = mount.with_remote_tar(remote_tar.clone())?;
                }
                Arc::new(mount)
            }
            Self::HostOutput(section) => {
                let mut mount = HostOutputMount::new(section.container_path.clone())?
                    .with_search_path(section.search_path);
                if let Some(ref host_path) = section.host_path {
                    mount = mount.with_host_path(host_path.clone())?;
                }
                if let Some(ref sync) = section.sync {
                    mount = mount.with_sync(OutputSync {
                        provider: sync.provider,
                        prefix: sync.prefix.clone(),
                        interval: sync.interval,
                        watch_preemption: sync.watch_preemption,
                    })?;
                }
                if let Some(ref local) = section.local_mirror {
                    mount = mount.with_local_mirror(resolve(base_dir, local))?;
                }
                Arc::new(mount)
            }
            Self::Bind(section) => {
                let mut mount = BindMount::new(section.host_path.clone(), section.container_path.clone())?
                    .with_search_path(section.search_path);
                if let Some(kind) = section.kind {
                    mount = mount.with_kind(kind);
                }
                Arc::new(mount)
            }
        })
    }
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn read_layer(path: &Path) -> Result<(toml::Value, String), ConfigurationError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let digest = hex::encode(Sha256::digest(text.as_bytes()));
    let table: toml::Table = toml::from_str(&text)?;
    Ok((toml::Value::Table(table), digest))
}

impl LaunchFile {
    /// Parse launch file text; relative paths resolve against `base_dir`.
    pub fn parse(text: &str, base_dir: impl Into<PathBuf>) -> Result<Self, ConfigurationError> {
        let mut file: Self = toml::from_str(text)?;
        file.base_dir = base_dir.into();
        file.validate()?;
        Ok(file)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        Self::load_with_defaults(None, path)
    }

    /// Load `path` on top of an optional defaults file. A defaults path that
    /// does not exist is skipped.
    pub fn load_with_defaults(defaults: Option<&Path>, path: &Path) -> Result<Self, ConfigurationError> {
        let mut layers = Vec::new();
        if let Some(defaults) = defaults.filter(|p| p.exists()) {
            let (value, digest) = read_layer(defaults)?;
            tracing::debug!(path = %defaults.display(), %digest, "defaults layer loaded");
            layers.push(value);
        }
        let (value, digest) = read_layer(path)?;
        layers.push(value);

        let mut file: Self = merge_layers(layers).try_into()?;
        file.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tracing::debug!(path = %path.display(), %digest, "launch file loaded");
        file.digest = Some(digest);
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        self.launch_config().validate()
    }

    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig::new(self.launcher.clone()).with_options(self.launch.clone())
    }

    pub fn mounts(&self) -> Result<Vec<Arc<dyn Mount>>, ConfigurationError> {
        self.mounts.iter().map(|m| m.build(&self.base_dir)).collect()
    }

    /// The configured runner with its context, setup, post and mounts.
    /// Build it with a payload before queueing.
    pub fn runner(&self) -> Result<Runner, ConfigurationError> {
        let mut runner = Runner::new(self.runner.clone())?
            .with_context(self.context.execution_context())
            .with_mounts(self.mounts()?);
        if let Some(ref setup) = self.context.setup {
            runner = runner.with_setup(setup.clone());
        }
        if let Some(ref post) = self.context.post {
            runner = runner.with_post(post.clone());
        }
        Ok(runner)
    }
}
