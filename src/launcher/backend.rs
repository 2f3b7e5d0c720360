//! Backend selection and launch options.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::ConfigurationError;
use crate::host::{RemoteExec, SshTarget};

/// AWS and GCE limit instance tags to this many characters.
pub const MAX_INSTANCE_NAME: usize = 128;

/// Where launch scripts run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Backend {
    Local(LocalBackend),
    Ssh(SshBackend),
    Scheduler(SchedulerBackend),
    Ec2(Ec2Backend),
    Gce(GceBackend),
    Kube(KubeBackend),
    Agent(AgentBackend),
}

impl Backend {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Ssh(_) => "ssh",
            Self::Scheduler(_) => "scheduler",
            Self::Ec2(_) => "ec2",
            Self::Gce(_) => "gce",
            Self::Kube(_) => "kube",
            Self::Agent(_) => "agent",
        }
    }

    /// Each plan gets a fresh instance that unpacks its own mounts.
    pub fn is_cloud(&self) -> bool {
        matches!(self, Self::Ec2(_) | Self::Gce(_))
    }

    /// One long-lived host that is unpacked once and reused.
    pub fn has_persistent_host(&self) -> bool {
        matches!(
            self,
            Self::Local(_) | Self::Ssh(_) | Self::Scheduler(_) | Self::Agent(_)
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalBackend {
    /// Return once the script is started instead of waiting for it.
    #[serde(default)]
    pub detach: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshBackend {
    pub target: SshTarget,
    #[serde(default)]
    pub exec: RemoteExec,
    /// Copy the script to the host with `scp` and run the file, instead of
    /// piping it into `bash -s`.
    #[serde(default)]
    pub upload_script: bool,
    #[serde(default)]
    pub detach: bool,
}

impl SshBackend {
    pub fn new(target: SshTarget) -> Self {
        Self {
            target,
            exec: RemoteExec::default(),
            upload_script: false,
            detach: false,
        }
    }
}

/// A Slurm login node, reached over SSH or used directly when this machine
/// is the login node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerBackend {
    #[serde(default)]
    pub login: Option<SshTarget>,
    #[serde(default = "RemoteExec::unprivileged")]
    pub exec: RemoteExec,
}

impl Default for SchedulerBackend {
    fn default() -> Self {
        Self {
            login: None,
            exec: RemoteExec::unprivileged(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ec2Backend {
    #[serde(default)]
    pub region: Option<String>,
    pub image_id: String,
    pub instance_type: String,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub security_group: Option<String>,
    /// Request a spot instance at this maximum hourly price.
    #[serde(default)]
    pub spot_price: Option<f64>,
    #[serde(default)]
    pub iam_instance_profile_arn: Option<String>,
    #[serde(default)]
    pub availability_zone: Option<String>,
    /// Instance tags; snake_case keys are sent as CamelCase.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub dry_run: bool,
}

impl Ec2Backend {
    pub fn new(image_id: impl Into<String>, instance_type: impl Into<String>) -> Self {
        Self {
            region: None,
            image_id: image_id.into(),
            instance_type: instance_type.into(),
            key_name: None,
            security_group: None,
            spot_price: None,
            iam_instance_profile_arn: None,
            availability_zone: None,
            tags: BTreeMap::new(),
            dry_run: false,
        }
    }
}

fn default_image_project() -> String {
    "deeplearning-platform-release".to_string()
}

fn default_image_family() -> String {
    "pytorch-latest-gpu".to_string()
}

fn default_accelerator_count() -> u32 {
    1
}

fn default_boot_size() -> u32 {
    60
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GceBackend {
    pub project_id: String,
    pub zone: String,
    pub instance_type: String,
    /// Explicit boot image; the image family is used when unset.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default = "default_image_project")]
    pub image_project: String,
    #[serde(default = "default_image_family")]
    pub image_family: String,
    #[serde(default)]
    pub accelerator_type: Option<String>,
    #[serde(default = "default_accelerator_count")]
    pub accelerator_count: u32,
    #[serde(default)]
    pub preemptible: bool,
    /// Boot disk size in GB.
    #[serde(default = "default_boot_size")]
    pub boot_size: u32,
    /// Extra instance metadata.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl GceBackend {
    pub fn new(
        project_id: impl Into<String>,
        zone: impl Into<String>,
        instance_type: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            zone: zone.into(),
            instance_type: instance_type.into(),
            image: None,
            image_project: default_image_project(),
            image_family: default_image_family(),
            accelerator_type: None,
            accelerator_count: default_accelerator_count(),
            preemptible: false,
            boot_size: default_boot_size(),
            tags: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KubeBackend {
    /// Namespace for jobs that do not set their own.
    #[serde(default)]
    pub namespace: Option<String>,
}

fn default_script_path() -> String {
    ".remlaunch/launch.sh".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentBackend {
    /// Agent root URL, e.g. `http://10.0.0.5:8092`.
    pub url: String,
    /// Where the launch script is written, relative to the agent's file root.
    #[serde(default = "default_script_path")]
    pub script_path: String,
    /// Seconds to wait for a command before getting the timeout sentinel.
    #[serde(default)]
    pub timeout: Option<f64>,
}

impl AgentBackend {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            script_path: default_script_path(),
            timeout: None,
        }
    }
}

fn default_launch_dir() -> String {
    "~/remlaunch-launch".to_string()
}

/// Options that shape every launch script, whatever the backend.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchOptions {
    /// Host directory for `launch.log` and `launch.err.log`.
    #[serde(default = "default_launch_dir")]
    pub launch_dir: String,
    /// Runs first, before logging is set up.
    #[serde(default)]
    pub root_config: Option<String>,
    /// Runs after logging is set up, before mounts are unpacked.
    #[serde(default)]
    pub setup: Option<String>,
    /// Shut the cloud instance down once the workload is done.
    #[serde(default)]
    pub terminate_after: bool,
    /// Seconds to wait before terminating, and after unpacking a host.
    #[serde(default)]
    pub delay: Option<u32>,
    /// Instance name tag.
    #[serde(default)]
    pub instance_name: Option<String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            launch_dir: default_launch_dir(),
            root_config: None,
            setup: None,
            terminate_after: false,
            delay: None,
            instance_name: None,
        }
    }
}

/// A backend plus the options its scripts are composed with.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchConfig {
    pub backend: Backend,
    pub options: LaunchOptions,
}

impl LaunchConfig {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            options: LaunchOptions::default(),
        }
    }

    pub fn with_options(mut self, options: LaunchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if let Some(ref name) = self.options.instance_name {
            let len = name.chars().count();
            if len > MAX_INSTANCE_NAME {
                return Err(ConfigurationError::NameTooLong {
                    len,
                    max: MAX_INSTANCE_NAME,
                });
            }
        }
        if self.options.terminate_after && !self.backend.is_cloud() {
            return Err(ConfigurationError::Unsupported {
                backend: self.backend.label(),
                feature: "terminate_after",
            });
        }
        if self.options.launch_dir.trim().is_empty() {
            return Err(ConfigurationError::Empty("launch_dir"));
        }
        if let Backend::Agent(ref agent) = self.backend {
            if agent.timeout.is_some_and(|t| !t.is_finite() || t < 0.0) {
                return Err(ConfigurationError::Invalid(
                    "agent timeout must be a non-negative number of seconds".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_instance_name_is_rejected() {
        let config = LaunchConfig::new(Backend::Ec2(Ec2Backend::new("ami-1", "t3.micro"))).with_options(
            LaunchOptions {
                instance_name: Some("x".repeat(129)),
                ..LaunchOptions::default()
            },
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::NameTooLong { len: 129, max: 128 })
        ));
    }

    #[test]
    fn test_terminate_after_needs_a_cloud_backend() {
        let options = LaunchOptions {
            terminate_after: true,
            ..LaunchOptions::default()
        };
        let local = LaunchConfig::new(Backend::Local(LocalBackend::default())).with_options(options.clone());
        assert!(matches!(
            local.validate(),
            Err(ConfigurationError::Unsupported { backend: "local", .. })
        ));

        let gce = LaunchConfig::new(Backend::Gce(GceBackend::new("proj", "us-east1-b", "n1-standard-4")))
            .with_options(options);
        assert!(gce.validate().is_ok());
    }

    #[test]
    fn test_backend_is_tagged_by_type() {
        let backend: Backend = toml::from_str(
            r#"
            type = "ssh"
            upload_script = true
            target = { host = "10.0.0.5", pem = "~/.ssh/id.pem" }
            "#,
        )
        .unwrap();
        match backend {
            Backend::Ssh(ssh) => {
                assert!(ssh.upload_script);
                assert_eq!(ssh.target.user, "ubuntu");
                assert!(ssh.exec.sudo);
            }
            other => panic!("unexpected backend {:?}", other),
        }

        let scheduler: Backend = toml::from_str("type = \"scheduler\"").unwrap();
        assert_eq!(scheduler, Backend::Scheduler(SchedulerBackend::default()));
    }
}
