//! Archive pushed straight to the execution host.

use std::path::{Path, PathBuf};

use remlaunch_protocol::{ExecReply, ExecResult};
use uuid::Uuid;

use super::archive::{file_sha256, ArchiveOptions, Archiver};
use super::{
    absolutize, default_staging_dir, remote_file_name, remote_parent, require_absolute, BindKind,
    BindSpec, Mount, MountId, TransferContext, TransferTarget,
};
use crate::error::{ConfigurationError, TransferError, TransportError};
use crate::host::{AgentClient, SshTarget};
use crate::shell::{quote, ShellCommand};

/// Archives a local directory and copies it to the host over SSH (`rsync`) or
/// through an exec agent, skipping the copy when an archive with the same
/// name is already there.
///
/// Give it a stable name to make repeated launches reuse both the local and
/// the remote archive.
#[derive(Debug, Clone)]
pub struct DirectMount {
    id: MountId,
    local_path: PathBuf,
    name: String,
    host_path: Option<String>,
    container_path: Option<String>,
    remote_tar: Option<String>,
    search_path: bool,
    archive: ArchiveOptions,
    staging_dir: PathBuf,
}

impl DirectMount {
    pub fn new(local_path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        Ok(Self {
            id: MountId::new(),
            local_path: absolutize(local_path.as_ref())?,
            name: Uuid::new_v4().to_string(),
            host_path: None,
            container_path: None,
            remote_tar: None,
            search_path: false,
            archive: ArchiveOptions::default(),
            staging_dir: default_staging_dir(),
        })
    }

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

    pub fn with_remote_tar(mut self, remote_tar: impl Into<String>) -> Result<Self, ConfigurationError> {
        let remote_tar = remote_tar.into();
        require_absolute("remote_tar", &remote_tar)?;
        self.remote_tar = Some(remote_tar);
        Ok(self)
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

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_tar(&self) -> PathBuf {
        self.staging_dir.join(format!("{}.tar", self.name))
    }

    pub fn remote_tar(&self) -> String {
        self.remote_tar
            .clone()
            .unwrap_or_else(|| format!("/tmp/{}.tar", self.name))
    }

    /// Build the local archive unless one with this name is already staged.
    fn ensure_local_archive(&self) -> Result<PathBuf, TransferError> {
        let local_tar = self.local_tar();
        if local_tar.exists() {
            tracing::info!(archive = %local_tar.display(), "local archive already exists, reusing");
            return Ok(local_tar);
        }
        Archiver::with_options(self.local_path.clone(), &self.archive)
            .and_then(|archiver| archiver.write_to(&local_tar))
            .map_err(|source| TransferError::Archive {
                path: self.local_path.clone(),
                source,
            })?;
        Ok(local_tar)
    }

    fn ssh_transfer_script(&self, ssh: &SshTarget, local_tar: &Path) -> String {
        let remote_tar = self.remote_tar();
        format!(
            "if {}; then\n    echo 'remote archive {} already exists'\nelse\n    {} && {}\nfi",
            ssh.ssh(&format!("test -f {}", remote_tar)),
            remote_tar,
            ssh.ssh(&format!("mkdir -p {}", remote_parent(&remote_tar))),
            ssh.rsync(&local_tar.display().to_string(), &remote_tar)
        )
    }

    fn upload_via_agent(&self, client: &AgentClient, local_tar: &Path) -> Result<(), TransferError> {
        let remote_tar = self.remote_tar();
        let parent = remote_parent(&remote_tar);
        let file_name = remote_file_name(&remote_tar);

        let listing = finished(client.execute(&format!("ls {} | grep -x {}", quote(parent), quote(file_name)), None)?)?;
        if listing.stdout.lines().any(|line| line == file_name) {
            tracing::info!(remote = %remote_tar, "remote archive already exists, skipping upload");
            return Ok(());
        }

        let mkdir = finished(client.execute(&format!("mkdir -p {}", quote(parent)), None)?)?;
        if !mkdir.success() {
            return Err(TransportError::Protocol(format!(
                "mkdir -p {} failed: {}",
                parent, mkdir.stderr
            ))
            .into());
        }

        client.upload_file(local_tar, &remote_tar)?;

        let expected = file_sha256(local_tar)?;
        let digest = finished(client.execute(&format!("sha256sum {}", quote(&remote_tar)), None)?)?;
        if !digest.stdout.starts_with(&expected) {
            return Err(TransferError::Unverified {
                artifact: remote_tar,
            });
        }
        tracing::info!(remote = %remote_tar, sha256 = %expected, "archive uploaded to agent");
        Ok(())
    }
}

fn finished(reply: ExecReply) -> Result<ExecResult, TransferError> {
    match reply {
        ExecReply::Finished(result) => Ok(result),
        ExecReply::TimedOut(t) => Err(TransportError::Protocol(format!(
            "agent command timed out after {}s",
            t.timeout
        ))
        .into()),
    }
}

impl Mount for DirectMount {
    fn id(&self) -> MountId {
        self.id
    }

    fn host_path(&self) -> String {
        self.host_path
            .clone()
            .unwrap_or_else(|| format!("/tmp/{}", self.name))
    }

    fn container_path(&self) -> String {
        self.container_path.clone().unwrap_or_else(|| self.host_path())
    }

    fn on_search_path(&self) -> bool {
        self.search_path
    }

    fn upload(&self, ctx: &TransferContext<'_>) -> Result<(), TransferError> {
        let target = ctx.target.ok_or_else(|| {
            ConfigurationError::Invalid(
                "direct mount needs an SSH host or exec agent to transfer to".to_string(),
            )
        })?;

        let local_tar = self.ensure_local_archive()?;
        match target {
            TransferTarget::Ssh(ssh) => {
                let script = self.ssh_transfer_script(ssh, &local_tar);
                ctx.shell.run_checked(&ShellCommand::new(script))?;
            }
            TransferTarget::Agent(client) => self.upload_via_agent(client, &local_tar)?,
        }
        Ok(())
    }

    fn unpack_script(&self) -> Option<String> {
        let host_path = self.host_path();
        Some(format!(
            "mkdir -p {}\ntar -xf {} -C {}",
            host_path,
            self.remote_tar(),
            host_path
        ))
    }

    fn bind(&self) -> Option<BindSpec> {
        Some(BindSpec {
            source: self.host_path(),
            target: self.container_path(),
            kind: BindKind::Volume,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingShell;
    use std::fs;
    use tempfile::TempDir;

    fn mount(code: &TempDir, staging: &TempDir) -> DirectMount {
        DirectMount::new(code.path())
            .unwrap()
            .with_name("code")
            .with_host_path("/home/ubuntu/code")
            .unwrap()
            .with_staging_dir(staging.path().to_path_buf())
    }

    fn code_dir() -> TempDir {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("train.py"), "pass\n").unwrap();
        temp
    }

    #[test]
    fn test_ssh_upload_is_guarded_by_existence_check() {
        let code = code_dir();
        let staging = TempDir::new().unwrap();
        let mount = mount(&code, &staging);
        let target = TransferTarget::Ssh(SshTarget::new("box"));
        let shell = RecordingShell::new();

        mount
            .upload(&TransferContext::new(&shell).with_target(Some(&target)))
            .unwrap();

        let scripts = shell.scripts();
        assert_eq!(scripts.len(), 1);
        let script = &scripts[0];
        assert!(script.starts_with("if ssh "));
        assert!(script.contains("'test -f /tmp/code.tar'"));
        assert!(script.contains("'mkdir -p /tmp'"));
        assert!(script.contains("rsync -az -e 'ssh -o StrictHostKeyChecking=no'"));
        assert!(script.contains("ubuntu@box:/tmp/code.tar"));
        assert!(staging.path().join("code.tar").exists());
    }

    #[test]
    fn test_existing_local_archive_is_reused() {
        let code = code_dir();
        let staging = TempDir::new().unwrap();
        fs::write(staging.path().join("code.tar"), "stale but reused").unwrap();
        let mount = mount(&code, &staging);
        let target = TransferTarget::Ssh(SshTarget::new("box"));
        let shell = RecordingShell::new();

        mount
            .upload(&TransferContext::new(&shell).with_target(Some(&target)))
            .unwrap();
        assert_eq!(
            fs::read_to_string(staging.path().join("code.tar")).unwrap(),
            "stale but reused"
        );
    }

    #[test]
    fn test_upload_requires_target() {
        let code = code_dir();
        let staging = TempDir::new().unwrap();
        let shell = RecordingShell::new();
        let err = mount(&code, &staging)
            .upload(&TransferContext::new(&shell))
            .unwrap_err();
        assert!(matches!(err, TransferError::Configuration(_)));
    }

    #[test]
    fn test_unpack_and_bind() {
        let code = code_dir();
        let staging = TempDir::new().unwrap();
        let mount = mount(&code, &staging);
        assert_eq!(
            mount.unpack_script().unwrap(),
            "mkdir -p /home/ubuntu/code\ntar -xf /tmp/code.tar -C /home/ubuntu/code"
        );
        assert_eq!(
            mount.bind().unwrap().docker_flag(),
            "-v /home/ubuntu/code:/home/ubuntu/code"
        );
    }
}
