//! Host output directory, optionally synced to an object store.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::object_store::StoreProvider;
use super::{absolutize, require_absolute, BindKind, BindSpec, Mount, MountId, TransferContext};
use crate::error::{ConfigurationError, TransferError};
use crate::script::templates::{background_loop, spot_watcher};
use crate::shell::{quote, ShellCommand};

/// Periodic upload of the host directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSync {
    pub provider: StoreProvider,
    /// Destination prefix, e.g. `s3://bucket/runs/exp-1`.
    pub prefix: String,
    /// Seconds between uploads; `0` loops without pausing.
    pub interval: u32,
    /// Flush once more when the spot instance is marked for termination.
    pub watch_preemption: bool,
}

impl OutputSync {
    pub fn new(provider: StoreProvider, prefix: impl Into<String>) -> Self {
        Self {
            provider,
            prefix: prefix.into(),
            interval: 15,
            watch_preemption: true,
        }
    }

    fn upload_command(&self, host_path: &str) -> String {
        self.provider.copy_recursive(host_path, &self.prefix)
    }
}

/// A directory created on the host and bound into the container, typically
/// for logs and checkpoints. Nothing is transferred in.
///
/// With [`OutputSync`] the directory is uploaded on an interval while the job
/// runs, once when a spot termination notice arrives, and once after the
/// runners finish. With a local mirror, the submitting machine downloads the
/// prefix on the same interval.
#[derive(Debug, Clone)]
pub struct HostOutputMount {
    id: MountId,
    host_path: String,
    container_path: String,
    sync: Option<OutputSync>,
    local_mirror: Option<PathBuf>,
    search_path: bool,
}

impl HostOutputMount {
    pub fn new(container_path: impl Into<String>) -> Result<Self, ConfigurationError> {
        let container_path = container_path.into();
        require_absolute("container_path", &container_path)?;
        Ok(Self {
            id: MountId::new(),
            host_path: format!("/tmp/remlaunch-mounts/{}", Uuid::new_v4()),
            container_path,
            sync: None,
            local_mirror: None,
            search_path: false,
        })
    }

    pub fn with_host_path(mut self, host_path: impl Into<String>) -> Result<Self, ConfigurationError> {
        let host_path = host_path.into();
        require_absolute("host_path", &host_path)?;
        self.host_path = host_path;
        Ok(self)
    }

    pub fn with_sync(mut self, sync: OutputSync) -> Result<Self, ConfigurationError> {
        if sync.prefix.trim().is_empty() {
            return Err(ConfigurationError::Empty("output sync prefix"));
        }
        self.sync = Some(sync);
        Ok(self)
    }

    /// Mirror the synced prefix into `local` on the submitting machine.
    pub fn with_local_mirror(mut self, local: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        if self.sync.is_none() {
            return Err(ConfigurationError::Invalid(
                "a local mirror needs an output sync prefix to download from".to_string(),
            ));
        }
        self.local_mirror = Some(absolutize(local.as_ref())?);
        Ok(self)
    }

    pub fn with_search_path(mut self, search_path: bool) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn sync(&self) -> Option<&OutputSync> {
        self.sync.as_ref()
    }
}

impl Mount for HostOutputMount {
    fn id(&self) -> MountId {
        self.id
    }

    fn host_path(&self) -> String {
        self.host_path.clone()
    }

    fn container_path(&self) -> String {
        self.container_path.clone()
    }

    fn on_search_path(&self) -> bool {
        self.search_path
    }

    /// Starts the local mirror loop, if any, detached from this process.
    fn upload(&self, ctx: &TransferContext<'_>) -> Result<(), TransferError> {
        let (Some(sync), Some(local)) = (self.sync.as_ref(), self.local_mirror.as_ref()) else {
            return Ok(());
        };
        let local = quote(&local.display().to_string());
        let download = format!(
            "{} || echo 'nothing under {} yet'",
            sync.provider.copy_recursive(&sync.prefix, &local),
            sync.prefix
        );
        let script = format!(
            "mkdir -p {}\n{}",
            local,
            background_loop("downloading", &download, sync.interval)
        );
        ctx.shell.run_checked(&ShellCommand::new(script).detached())?;
        tracing::info!(prefix = %sync.prefix, local = %local, "local mirror started");
        Ok(())
    }

    fn unpack_script(&self) -> Option<String> {
        let mut script = format!(
            "echo 'making output directory {host}'\nmkdir -p {host}",
            host = self.host_path
        );
        if let Some(ref sync) = self.sync {
            let upload = sync.upload_command(&self.host_path);
            script.push('\n');
            script.push_str(&background_loop("uploading", &upload, sync.interval));
            if sync.watch_preemption {
                script.push('\n');
                script.push_str(&spot_watcher(&upload));
            }
        }
        Some(script)
    }

    fn transfer_script(&self) -> Option<String> {
        self.sync
            .as_ref()
            .map(|sync| sync.upload_command(&self.host_path))
    }

    fn final_sync_script(&self) -> Option<String> {
        self.sync
            .as_ref()
            .map(|sync| format!("echo 'final sync of {}'\n{}", self.host_path, sync.upload_command(&self.host_path)))
    }

    fn bind(&self) -> Option<BindSpec> {
        Some(BindSpec {
            source: self.host_path.clone(),
            target: self.container_path.clone(),
            kind: BindKind::Volume,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingShell;
    use crate::script::templates::SPOT_TERMINATION_URL;

    fn synced() -> HostOutputMount {
        HostOutputMount::new("/outputs")
            .unwrap()
            .with_host_path("/home/ubuntu/outputs")
            .unwrap()
            .with_sync(OutputSync::new(StoreProvider::S3, "s3://b/runs/1"))
            .unwrap()
    }

    #[test]
    fn test_paths_must_be_absolute() {
        assert!(matches!(
            HostOutputMount::new("outputs"),
            Err(ConfigurationError::NotAbsolute { field: "container_path", .. })
        ));
        assert!(HostOutputMount::new("/outputs")
            .unwrap()
            .with_host_path("~/outputs")
            .is_err());
    }

    #[test]
    fn test_unsynced_mount_only_creates_directory() {
        let mount = HostOutputMount::new("/outputs")
            .unwrap()
            .with_host_path("/data/out")
            .unwrap();
        assert_eq!(
            mount.unpack_script().unwrap(),
            "echo 'making output directory /data/out'\nmkdir -p /data/out"
        );
        assert!(mount.transfer_script().is_none());
        assert!(mount.final_sync_script().is_none());
    }

    #[test]
    fn test_synced_mount_loops_and_watches_preemption() {
        let mount = synced();
        let unpack = mount.unpack_script().unwrap();
        assert!(unpack.contains("aws s3 cp --recursive /home/ubuntu/outputs s3://b/runs/1\n    sleep 15"));
        assert!(unpack.contains(SPOT_TERMINATION_URL));
        assert_eq!(
            mount.final_sync_script().unwrap(),
            "echo 'final sync of /home/ubuntu/outputs'\naws s3 cp --recursive /home/ubuntu/outputs s3://b/runs/1"
        );
        assert_eq!(
            mount.bind().unwrap().docker_flag(),
            "-v /home/ubuntu/outputs:/outputs"
        );
    }

    #[test]
    fn test_preemption_watch_can_be_disabled() {
        let mut sync = OutputSync::new(StoreProvider::Gcs, "gs://b/runs");
        sync.watch_preemption = false;
        let mount = HostOutputMount::new("/outputs").unwrap().with_sync(sync).unwrap();
        assert!(!mount.unpack_script().unwrap().contains(SPOT_TERMINATION_URL));
    }

    #[test]
    fn test_local_mirror_runs_detached() {
        let local = tempfile::TempDir::new().unwrap();
        let mount = synced().with_local_mirror(local.path()).unwrap();
        let shell = RecordingShell::new();
        mount.upload(&TransferContext::new(&shell)).unwrap();

        let calls = shell.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].detach);
        assert!(calls[0].script.contains("aws s3 cp --recursive s3://b/runs/1"));
    }

    #[test]
    fn test_local_mirror_needs_sync() {
        assert!(HostOutputMount::new("/outputs")
            .unwrap()
            .with_local_mirror("/tmp/mirror")
            .is_err());
    }
}
