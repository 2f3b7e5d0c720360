//! SSH command lines.
//!
//! Nothing here talks to the network: the builders produce `ssh`, `scp` and
//! `rsync` invocations that are run through a
//! [`CommandRunner`](crate::shell::CommandRunner).

use serde::{Deserialize, Serialize};

use crate::shell::quote;

fn default_user() -> String {
    "ubuntu".to_string()
}

fn default_connect_timeout() -> u32 {
    30
}

/// An SSH-reachable host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshTarget {
    /// Hostname or IP address.
    pub host: String,
    /// Login user.
    #[serde(default = "default_user")]
    pub user: String,
    /// SSH port; ssh's default when unset.
    #[serde(default)]
    pub port: Option<u16>,
    /// Private key file.
    #[serde(default)]
    pub pem: Option<String>,
    /// Login password, fed through `sshpass`.
    #[serde(default)]
    pub password: Option<String>,
    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u32,
}

/// How the launch script is run once it reaches the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteExec {
    /// Run under `sudo -n -s`.
    #[serde(default = "RemoteExec::default_sudo")]
    pub sudo: bool,
    /// Switch to this user profile first (`su - profile`).
    #[serde(default)]
    pub profile: Option<String>,
    /// The profile switch prompts for a password on stdin.
    #[serde(default)]
    pub require_password: bool,
}

impl RemoteExec {
    fn default_sudo() -> bool {
        true
    }

    /// Run as the login user, without `sudo`.
    pub fn unprivileged() -> Self {
        Self {
            sudo: false,
            ..Self::default()
        }
    }
}

impl Default for RemoteExec {
    fn default() -> Self {
        Self {
            sudo: true,
            profile: None,
            require_password: false,
        }
    }
}

impl SshTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: default_user(),
            port: None,
            pem: None,
            password: None,
            connect_timeout: default_connect_timeout(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_pem(mut self, pem: impl Into<String>) -> Self {
        self.pem = Some(pem.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// `user@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options shared by every ssh invocation.
    fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout),
        ];

        // A password prompt needs a tty.
        if self.password.is_none() {
            args.push("-T".to_string());
        }

        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }

        if let Some(ref pem) = self.pem {
            args.push("-i".to_string());
            args.push(quote(pem));
        }

        args
    }

    fn with_sshpass(&self, command: String) -> String {
        match self.password {
            Some(ref password) => format!("sshpass -p {} {}", quote(password), command),
            None => command,
        }
    }

    /// Run `remote_command` on the host.
    pub fn ssh(&self, remote_command: &str) -> String {
        let command = format!(
            "ssh {} {} {}",
            self.ssh_args().join(" "),
            self.destination(),
            quote(remote_command)
        );
        self.with_sshpass(command)
    }

    /// Copy a local file into `remote_dir`.
    pub fn scp(&self, local: &str, remote_dir: &str) -> String {
        let mut args = vec!["-o StrictHostKeyChecking=no".to_string()];
        if let Some(port) = self.port {
            args.push(format!("-P {}", port));
        }
        if let Some(ref pem) = self.pem {
            args.push(format!("-i {}", quote(pem)));
        }
        let command = format!(
            "scp {} {} {}:{}",
            args.join(" "),
            quote(local),
            self.destination(),
            remote_dir
        );
        self.with_sshpass(command)
    }

    /// Copy a local file to `remote` with rsync over ssh.
    pub fn rsync(&self, local: &str, remote: &str) -> String {
        let mut transport = vec!["ssh".to_string(), "-o StrictHostKeyChecking=no".to_string()];
        if let Some(port) = self.port {
            transport.push(format!("-p {}", port));
        }
        if let Some(ref pem) = self.pem {
            transport.push(format!("-i {}", pem));
        }
        let command = format!(
            "rsync -az -e {} {} {}:{}",
            quote(&transport.join(" ")),
            quote(local),
            self.destination(),
            remote
        );
        self.with_sshpass(command)
    }

    /// Remote command that runs a launch script: read from stdin when
    /// `script_path` is `None` (pipe mode), else the uploaded file.
    pub fn launch_command(&self, exec: &RemoteExec, script_path: Option<&str>) -> String {
        let sudo = if exec.sudo { "sudo -n -s " } else { "" };
        let target = script_path.unwrap_or("-s");
        let run = format!("{}bash {}", sudo, target);
        let remote = match exec.profile {
            Some(ref profile) => format!(
                "sudo {}su - {}; {}",
                if exec.require_password { "-kS " } else { "" },
                profile,
                run
            ),
            None => run,
        };
        self.ssh(&remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_command_shape() {
        let target = SshTarget::new("10.0.0.5").with_port(2222).with_pem("~/.ssh/id.pem");
        let cmd = target.ssh("mkdir -p /tmp/x");
        assert_eq!(
            cmd,
            "ssh -o StrictHostKeyChecking=no -o ConnectTimeout=30 -T -p 2222 -i ~/.ssh/id.pem ubuntu@10.0.0.5 'mkdir -p /tmp/x'"
        );
    }

    #[test]
    fn test_password_uses_sshpass_and_tty() {
        let target = SshTarget::new("box").with_user("me").with_password("s3cret");
        let cmd = target.ssh("true");
        assert!(cmd.starts_with("sshpass -p s3cret ssh "));
        assert!(!cmd.contains(" -T "));
    }

    #[test]
    fn test_rsync_and_scp() {
        let target = SshTarget::new("box").with_port(22);
        assert_eq!(
            target.rsync("/tmp/a.tar", "/tmp/remote/a.tar"),
            "rsync -az -e 'ssh -o StrictHostKeyChecking=no -p 22' /tmp/a.tar ubuntu@box:/tmp/remote/a.tar"
        );
        assert_eq!(
            target.scp("/tmp/launch.sh", "/home/ubuntu/launch"),
            "scp -o StrictHostKeyChecking=no -P 22 /tmp/launch.sh ubuntu@box:/home/ubuntu/launch"
        );
    }

    #[test]
    fn test_launch_command_modes() {
        let target = SshTarget::new("box");
        let pipe = target.launch_command(&RemoteExec::default(), None);
        assert!(pipe.ends_with("ubuntu@box 'sudo -n -s bash -s'"));

        let exec = RemoteExec {
            sudo: false,
            profile: Some("ml".to_string()),
            require_password: true,
        };
        let upload = target.launch_command(&exec, Some("/home/ubuntu/launch/run.sh"));
        assert!(upload.ends_with("'sudo -kS su - ml; bash /home/ubuntu/launch/run.sh'"));
    }
}
