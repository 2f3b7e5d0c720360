//! Launchers
//!
//! A [`Launcher`] drives one backend. Runners are queued with
//! [`Launcher::add_runner`]; [`Launcher::plan_instance`] uploads their mounts
//! and turns the whole queue into one [`Plan`]; [`Launcher::execute`]
//! submits every accumulated plan.
//!
//! ```text
//! Empty --add_runner--> Planning --plan_instance--> Planned --execute--> Executed
//!                          ^                                                |
//!                          +------------------- add_runner -----------------+
//! ```
//!
//! The upload registry and the host-unpacked flag live as long as the
//! launcher, so a mount is transferred once and a persistent host is
//! unpacked once however many plans follow.

pub mod backend;
pub mod cloud;
pub mod compose;

pub use backend::{
    AgentBackend, Backend, Ec2Backend, GceBackend, KubeBackend, LaunchConfig, LaunchOptions,
    LocalBackend, SchedulerBackend, SshBackend,
};
pub use cloud::{CliCloudApi, CloudApi, Ec2Request, GceRequest, InstanceRequest};

use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::sync::Arc;

use remlaunch_protocol::ExecReply;

use crate::error::{ConfigurationError, LaunchError};
use crate::host::{AgentClient, RemoteExec, SshTarget};
use crate::mount::{Mount, TransferContext, TransferTarget, UploadRegistry};
use crate::runner::{Job, Runner, RunnerKind};
use crate::shell::{quote, CommandOutput, CommandRunner, LocalShell, ShellCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherState {
    /// Nothing queued or planned yet.
    Empty,
    /// Runners are queued.
    Planning,
    /// The queue was turned into a plan that has not been submitted.
    Planned,
    /// Plans were submitted.
    Executed,
}

/// A submission-ready unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    /// A launch script, with the configuration its first runner was queued
    /// under.
    Script { script: String, config: LaunchConfig },
    Job(Job),
}

/// What a backend handed back for one submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// A script that ran to completion on this machine or over SSH.
    Completed(CommandOutput),
    /// A script left running in the background.
    Detached { pid: Option<u32> },
    /// Instance id or spot request id.
    Instance(String),
    /// Output of `kubectl apply`.
    Applied(String),
    /// Reply of the agent that ran the script.
    Agent(ExecReply),
}

impl fmt::Display for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed(output) => match output.status {
                Some(code) => write!(f, "completed with exit code {}", code),
                None => write!(f, "completed, killed by a signal"),
            },
            Self::Detached { pid: Some(pid) } => write!(f, "detached as pid {}", pid),
            Self::Detached { pid: None } => write!(f, "detached"),
            Self::Instance(id) => write!(f, "instance {}", id),
            Self::Applied(output) => write!(f, "{}", output.trim_end()),
            Self::Agent(ExecReply::Finished(result)) => {
                write!(f, "agent finished with exit code {}", result.exit_code)
            }
            Self::Agent(ExecReply::TimedOut(sentinel)) => {
                write!(f, "agent timed out after {}s, still running", sentinel.timeout)
            }
        }
    }
}

pub struct Launcher {
    config: LaunchConfig,
    shell: Arc<dyn CommandRunner>,
    cloud: Option<Arc<dyn CloudApi>>,
    target: Option<TransferTarget>,
    queue: Vec<Runner>,
    plans: Vec<Plan>,
    uploads: UploadRegistry,
    host_unpacked: bool,
    state: LauncherState,
}

impl fmt::Debug for Launcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Launcher")
            .field("backend", &self.config.backend.label())
            .field("queued", &self.queue.len())
            .field("plans", &self.plans.len())
            .field("host_unpacked", &self.host_unpacked)
            .field("state", &self.state)
            .finish()
    }
}

impl Launcher {
    pub fn new(config: LaunchConfig) -> Result<Self, LaunchError> {
        config.validate()?;
        let target = match config.backend {
            Backend::Ssh(ref ssh) => Some(TransferTarget::Ssh(ssh.target.clone())),
            Backend::Scheduler(SchedulerBackend {
                login: Some(ref login),
                ..
            }) => Some(TransferTarget::Ssh(login.clone())),
            Backend::Agent(ref agent) => Some(TransferTarget::Agent(AgentClient::new(agent.url.clone())?)),
            _ => None,
        };
        Ok(Self {
            config,
            shell: Arc::new(LocalShell::new()),
            cloud: None,
            target,
            queue: Vec::new(),
            plans: Vec::new(),
            uploads: UploadRegistry::new(),
            host_unpacked: false,
            state: LauncherState::Empty,
        })
    }

    /// Run local commands through `shell` instead of `bash`.
    pub fn with_shell(mut self, shell: Arc<dyn CommandRunner>) -> Self {
        self.shell = shell;
        self
    }

    /// Submit cloud requests through `cloud` instead of the CLIs.
    pub fn with_cloud(mut self, cloud: Arc<dyn CloudApi>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Replace the launch options. Runners already queued keep the
    /// configuration they were queued under.
    pub fn set_options(&mut self, options: LaunchOptions) -> Result<(), ConfigurationError> {
        let config = LaunchConfig {
            backend: self.config.backend.clone(),
            options,
        };
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn state(&self) -> LauncherState {
        self.state
    }

    pub fn queued(&self) -> &[Runner] {
        &self.queue
    }

    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }

    pub fn uploads(&self) -> &UploadRegistry {
        &self.uploads
    }

    pub fn host_unpacked(&self) -> bool {
        self.host_unpacked
    }

    /// Queue `runner`, recording the current configuration on it.
    pub fn add_runner(&mut self, mut runner: Runner) {
        runner.set_launch_config(self.config.clone());
        tracing::debug!(
            backend = self.config.backend.label(),
            runner = runner.kind().label(),
            "runner queued"
        );
        self.queue.push(runner);
        self.state = LauncherState::Planning;
    }

    fn upload_mounts(&mut self, mounts: &[Arc<dyn Mount>]) -> Result<(), LaunchError> {
        let ctx = TransferContext::new(self.shell.as_ref()).with_target(self.target.as_ref());
        for mount in mounts {
            self.uploads.upload(mount.as_ref(), &ctx)?;
        }
        Ok(())
    }

    /// Turn the queue into one plan.
    ///
    /// Mounts are uploaded first. The queue is cleared on success and left
    /// intact when an upload or composition step fails.
    pub fn plan_instance(&mut self) -> Result<(), LaunchError> {
        if self.queue.is_empty() {
            tracing::warn!("plan_instance called with no queued runners");
            return Ok(());
        }
        let runners = std::mem::take(&mut self.queue);
        match self.plan_runners(&runners) {
            Ok(()) => {
                self.state = LauncherState::Planned;
                Ok(())
            }
            Err(err) => {
                self.queue = runners;
                Err(err)
            }
        }
    }

    fn plan_runners(&mut self, runners: &[Runner]) -> Result<(), LaunchError> {
        let mounts = collect_mounts(runners);
        self.upload_mounts(&mounts)?;

        if let Backend::Kube(ref kube) = self.config.backend {
            let mut jobs = Vec::with_capacity(runners.len());
            for runner in runners {
                if !matches!(runner.kind(), RunnerKind::KubeJob(_)) {
                    return Err(ConfigurationError::Unsupported {
                        backend: "kube",
                        feature: "script runners",
                    }
                    .into());
                }
                let mut job = runner.job().cloned().ok_or_else(|| {
                    ConfigurationError::Invalid("kube-job runner was queued before build".to_string())
                })?;
                if job.metadata.namespace.is_none() {
                    job.metadata.namespace = kube.namespace.clone();
                }
                tracing::debug!(job = job.name(), "job planned");
                jobs.push(Plan::Job(job));
            }
            self.plans.extend(jobs);
            return Ok(());
        }

        for runner in runners {
            if matches!(runner.kind(), RunnerKind::KubeJob(_)) {
                return Err(ConfigurationError::Unsupported {
                    backend: self.config.backend.label(),
                    feature: "kube-job runners",
                }
                .into());
            }
            if !runner.is_built() {
                return Err(ConfigurationError::Invalid(
                    "runner was queued before build".to_string(),
                )
                .into());
            }
        }

        let config = runners
            .first()
            .and_then(Runner::launch_config)
            .cloned()
            .unwrap_or_else(|| self.config.clone());
        let unpack = config.backend.is_cloud() || !self.host_unpacked;
        let script = compose::launch_script(runners, &mounts, unpack, &config)?;
        if !config.backend.is_cloud() {
            self.host_unpacked = true;
        }

        tracing::debug!(%script, "launch script planned");
        self.plans.push(Plan::Script { script, config });
        Ok(())
    }

    /// Plan whatever is queued, then submit every plan.
    ///
    /// Plans are consumed even when a submission fails, so a failed batch is
    /// never submitted twice.
    pub fn execute(&mut self) -> Result<Vec<Submission>, LaunchError> {
        if !self.queue.is_empty() {
            self.plan_instance()?;
        }
        let plans = std::mem::take(&mut self.plans);
        if plans.is_empty() {
            tracing::warn!("execute called with nothing to submit");
            return Ok(Vec::new());
        }

        let submissions = match self.config.backend {
            Backend::Ec2(_) | Backend::Gce(_) => self.submit_instances(&plans)?,
            Backend::Kube(_) => vec![self.apply_jobs(&plans)?],
            _ => plans
                .iter()
                .map(|plan| self.submit_script(plan))
                .collect::<Result<Vec<_>, _>>()?,
        };

        for submission in &submissions {
            tracing::info!(backend = self.config.backend.label(), %submission, "submitted");
        }
        self.state = LauncherState::Executed;
        Ok(submissions)
    }

    fn submit_instances(&self, plans: &[Plan]) -> Result<Vec<Submission>, LaunchError> {
        let mut requests = Vec::with_capacity(plans.len());
        for plan in plans {
            let Plan::Script { script, config } = plan else {
                return Err(unexpected_job(&self.config.backend).into());
            };
            let request = match config.backend {
                Backend::Ec2(ref ec2) => {
                    InstanceRequest::Ec2(Ec2Request::new(ec2, &config.options, script))
                }
                Backend::Gce(ref gce) => {
                    InstanceRequest::Gce(GceRequest::new(gce, &config.options, script))
                }
                ref other => {
                    return Err(ConfigurationError::Unsupported {
                        backend: other.label(),
                        feature: "instance requests",
                    }
                    .into())
                }
            };
            requests.push(request);
        }

        let cloud = self
            .cloud
            .clone()
            .unwrap_or_else(|| Arc::new(CliCloudApi::new(self.shell.clone())));
        let ids = cloud.submit(&requests)?;
        Ok(ids.into_iter().map(Submission::Instance).collect())
    }

    fn apply_jobs(&self, plans: &[Plan]) -> Result<Submission, LaunchError> {
        let mut jobs = Vec::with_capacity(plans.len());
        for plan in plans {
            match plan {
                Plan::Job(job) => jobs.push(job.clone()),
                Plan::Script { .. } => {
                    return Err(ConfigurationError::Unsupported {
                        backend: "kube",
                        feature: "launch scripts",
                    }
                    .into())
                }
            }
        }

        let manifest = compose::jobs_yaml(&jobs)?;
        let mut file = tempfile::Builder::new()
            .prefix("remlaunch-")
            .suffix("-kube.yaml")
            .tempfile()?;
        file.write_all(manifest.as_bytes())?;
        file.flush()?;
        tracing::debug!(path = %file.path().display(), jobs = jobs.len(), "applying job manifest");

        let command = format!("kubectl apply -f {}", quote(&file.path().display().to_string()));
        let output = self
            .shell
            .run_checked(&ShellCommand::new(command).captured())?;
        Ok(Submission::Applied(output.stdout))
    }

    fn submit_script(&self, plan: &Plan) -> Result<Submission, LaunchError> {
        let Plan::Script { script, config } = plan else {
            return Err(unexpected_job(&self.config.backend).into());
        };

        match config.backend {
            Backend::Local(ref local) => {
                let command = ShellCommand::new(script.clone());
                if local.detach {
                    run_detached(self.shell.as_ref(), command.detached())
                } else {
                    Ok(Submission::Completed(self.shell.run(&command)?))
                }
            }
            Backend::Ssh(ref ssh) => {
                let command = if ssh.upload_script {
                    self.uploaded_script_command(&ssh.target, &ssh.exec, script)?
                } else {
                    piped_command(&ssh.target, &ssh.exec, script)
                };
                if ssh.detach {
                    run_detached(self.shell.as_ref(), command.detached())
                } else {
                    Ok(Submission::Completed(self.shell.run(&command)?))
                }
            }
            Backend::Scheduler(ref scheduler) => {
                let command = match scheduler.login {
                    Some(ref login) => piped_command(login, &scheduler.exec, script),
                    None => ShellCommand::new(script.clone()),
                };
                Ok(Submission::Completed(self.shell.run(&command)?))
            }
            Backend::Agent(ref agent) => {
                let client = self.agent_client()?;
                client.put_bytes(&agent.script_path, script.clone().into_bytes())?;
                let reply = client.execute(&format!("bash {}", quote(&agent.script_path)), agent.timeout)?;
                Ok(Submission::Agent(reply))
            }
            ref other => Err(ConfigurationError::Unsupported {
                backend: other.label(),
                feature: "launch scripts",
            }
            .into()),
        }
    }

    /// Copy `script` to the host's `/tmp` and return the command that runs it.
    fn uploaded_script_command(
        &self,
        target: &SshTarget,
        exec: &RemoteExec,
        script: &str,
    ) -> Result<ShellCommand, LaunchError> {
        let mut file = tempfile::Builder::new()
            .prefix("remlaunch-")
            .suffix(".sh")
            .tempfile()?;
        file.write_all(script.as_bytes())?;
        file.flush()?;

        let local = file.path().display().to_string();
        let remote = format!("/tmp/{}", crate::mount::remote_file_name(&local));
        self.shell
            .run_checked(&ShellCommand::new(target.scp(&local, "/tmp/")).captured())?;

        let mut command = ShellCommand::new(target.launch_command(exec, Some(&remote)));
        if let Some(password) = profile_password(target, exec) {
            command = command.with_stdin(password);
        }
        Ok(command)
    }

    fn agent_client(&self) -> Result<&AgentClient, LaunchError> {
        match self.target {
            Some(TransferTarget::Agent(ref client)) => Ok(client),
            _ => Err(ConfigurationError::Invalid("no agent configured".to_string()).into()),
        }
    }

    /// Unpack the mounts of every queued runner on a persistent host, once.
    ///
    /// Returns whether anything ran. Cloud and kube backends unpack inside
    /// each instance or job, so this is a no-op for them.
    pub fn setup_host(&mut self) -> Result<bool, LaunchError> {
        if self.host_unpacked || !self.config.backend.has_persistent_host() {
            return Ok(false);
        }
        let mounts = collect_mounts(&self.queue);
        self.upload_mounts(&mounts)?;

        if let Backend::Agent(ref agent) = self.config.backend {
            let scripts: Vec<String> = mounts.iter().filter_map(|m| m.unpack_script()).collect();
            if !scripts.is_empty() {
                let replies = self.agent_client()?.map(&scripts, agent.timeout)?;
                for reply in replies {
                    match reply {
                        ExecReply::Finished(result) if !result.success() => tracing::warn!(
                            exit_code = result.exit_code,
                            stderr = %result.stderr,
                            "unpack script failed on agent"
                        ),
                        ExecReply::TimedOut(sentinel) => tracing::warn!(
                            timeout = sentinel.timeout,
                            "unpack script still running on agent"
                        ),
                        ExecReply::Finished(_) => {}
                    }
                }
            }
        } else {
            let script = compose::host_unpack_script(&mounts, &self.config.options);
            let command = match self.config.backend {
                Backend::Ssh(ref ssh) => piped_command(&ssh.target, &ssh.exec, &script),
                Backend::Scheduler(SchedulerBackend {
                    login: Some(ref login),
                    ref exec,
                }) => piped_command(login, exec, &script),
                _ => ShellCommand::new(script),
            };
            self.shell.run_checked(&command.captured())?;
        }

        self.host_unpacked = true;
        tracing::info!(backend = self.config.backend.label(), mounts = mounts.len(), "host unpacked");
        Ok(true)
    }
}

/// Mounts of `runners` in first-seen order, each once.
fn collect_mounts(runners: &[Runner]) -> Vec<Arc<dyn Mount>> {
    let mut seen = HashSet::new();
    runners
        .iter()
        .flat_map(|runner| runner.mounts().iter())
        .filter(|mount| seen.insert(mount.id()))
        .cloned()
        .collect()
}

fn profile_password(target: &SshTarget, exec: &RemoteExec) -> Option<String> {
    if exec.profile.is_some() && exec.require_password {
        target.password.as_ref().map(|password| format!("{}\n", password))
    } else {
        None
    }
}

/// Pipe `script` into `bash -s` on the host.
fn piped_command(target: &SshTarget, exec: &RemoteExec, script: &str) -> ShellCommand {
    let mut stdin = profile_password(target, exec).unwrap_or_default();
    stdin.push_str(script);
    stdin.push('\n');
    ShellCommand::new(target.launch_command(exec, None)).with_stdin(stdin)
}

fn run_detached(shell: &dyn CommandRunner, command: ShellCommand) -> Result<Submission, LaunchError> {
    let output = shell.run(&command)?;
    Ok(Submission::Detached { pid: output.pid })
}

fn unexpected_job(backend: &Backend) -> ConfigurationError {
    ConfigurationError::Unsupported {
        backend: backend.label(),
        feature: "job specs",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{RecordingCloudApi, RecordingShell};
    use crate::mount::BindMount;
    use crate::payload::Payload;
    use crate::runner::{KubeJobRunner, ShellRunner};

    fn shell_runner() -> Runner {
        let mut runner = Runner::new(RunnerKind::Shell(ShellRunner::default())).unwrap();
        runner.build(&Payload::new("echo").with_arg("hi"));
        runner
    }

    fn local(shell: Arc<RecordingShell>) -> Launcher {
        Launcher::new(LaunchConfig::new(Backend::Local(LocalBackend::default())))
            .unwrap()
            .with_shell(shell)
    }

    #[test]
    fn test_state_transitions() {
        let shell = Arc::new(RecordingShell::new());
        let mut launcher = local(shell);
        assert_eq!(launcher.state(), LauncherState::Empty);

        launcher.add_runner(shell_runner());
        assert_eq!(launcher.state(), LauncherState::Planning);
        assert!(launcher.queued()[0].launch_config().is_some());

        launcher.plan_instance().unwrap();
        assert_eq!(launcher.state(), LauncherState::Planned);
        assert!(launcher.queued().is_empty());
        assert_eq!(launcher.plans().len(), 1);

        let submissions = launcher.execute().unwrap();
        assert_eq!(submissions.len(), 1);
        assert_eq!(launcher.state(), LauncherState::Executed);
        assert!(launcher.plans().is_empty());

        launcher.add_runner(shell_runner());
        assert_eq!(launcher.state(), LauncherState::Planning);
    }

    #[test]
    fn test_unbuilt_runner_keeps_queue() {
        let mut launcher = local(Arc::new(RecordingShell::new()));
        launcher.add_runner(Runner::new(RunnerKind::Shell(ShellRunner::default())).unwrap());
        assert!(launcher.plan_instance().is_err());
        assert_eq!(launcher.queued().len(), 1);
    }

    #[test]
    fn test_snapshot_survives_option_changes() {
        let mut launcher = local(Arc::new(RecordingShell::new()));
        launcher.add_runner(shell_runner());
        launcher
            .set_options(LaunchOptions {
                launch_dir: "/tmp/second".to_string(),
                ..LaunchOptions::default()
            })
            .unwrap();
        launcher.plan_instance().unwrap();

        match &launcher.plans()[0] {
            Plan::Script { script, .. } => {
                assert!(script.contains("mkdir -p ~/remlaunch-launch"));
                assert!(!script.contains("/tmp/second"));
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_cloud_plans_are_submitted_in_one_batch() {
        let cloud = Arc::new(RecordingCloudApi::new());
        let mut launcher = Launcher::new(LaunchConfig::new(Backend::Ec2(Ec2Backend::new("ami-1", "t3.micro"))))
            .unwrap()
            .with_shell(Arc::new(RecordingShell::new()))
            .with_cloud(cloud.clone());

        launcher.add_runner(shell_runner());
        launcher.plan_instance().unwrap();
        launcher.add_runner(shell_runner());
        let submissions = launcher.execute().unwrap();

        assert_eq!(
            submissions,
            [
                Submission::Instance("mock-instance-0".to_string()),
                Submission::Instance("mock-instance-1".to_string())
            ]
        );
        assert_eq!(cloud.batches(), 1);
        assert_eq!(cloud.requests().len(), 2);
    }

    #[test]
    fn test_kube_jobs_are_applied_together() {
        let shell = Arc::new(RecordingShell::new().respond("kubectl apply", CommandOutput::ok("job.batch/a created\n")));
        let mut launcher = Launcher::new(LaunchConfig::new(Backend::Kube(KubeBackend {
            namespace: Some("research".to_string()),
        })))
        .unwrap()
        .with_shell(shell.clone());

        for name in ["a", "b"] {
            let mut runner =
                Runner::new(RunnerKind::KubeJob(KubeJobRunner::new("img").with_name(name))).unwrap();
            runner.build(&Payload::new("echo"));
            launcher.add_runner(runner);
            launcher.plan_instance().unwrap();
        }
        match &launcher.plans()[1] {
            Plan::Job(job) => assert_eq!(job.metadata.namespace.as_deref(), Some("research")),
            other => panic!("unexpected plan {:?}", other),
        }

        let submissions = launcher.execute().unwrap();
        assert_eq!(submissions, [Submission::Applied("job.batch/a created\n".to_string())]);
        assert_eq!(shell.count_matching("kubectl apply -f"), 1);
    }

    #[test]
    fn test_kube_backend_rejects_script_runners() {
        let mut launcher = Launcher::new(LaunchConfig::new(Backend::Kube(KubeBackend::default())))
            .unwrap()
            .with_shell(Arc::new(RecordingShell::new()));
        launcher.add_runner(shell_runner());
        assert!(matches!(
            launcher.plan_instance(),
            Err(LaunchError::Configuration(ConfigurationError::Unsupported { .. }))
        ));
    }

    #[test]
    fn test_ssh_pipe_mode_feeds_script_on_stdin() {
        let shell = Arc::new(RecordingShell::new());
        let mut launcher = Launcher::new(LaunchConfig::new(Backend::Ssh(SshBackend::new(SshTarget::new("box")))))
            .unwrap()
            .with_shell(shell.clone());
        launcher.add_runner(shell_runner());
        launcher.execute().unwrap();

        let calls = shell.calls();
        let launch = calls.last().unwrap();
        assert!(launch.script.starts_with("ssh "));
        assert!(launch.script.ends_with("'sudo -n -s bash -s'"));
        assert!(launch.stdin.as_deref().unwrap().contains("remlaunch-entry"));
    }

    #[test]
    fn test_ssh_upload_mode_copies_then_runs_file() {
        let shell = Arc::new(RecordingShell::new());
        let mut backend = SshBackend::new(SshTarget::new("box"));
        backend.upload_script = true;
        backend.exec = RemoteExec::unprivileged();
        let mut launcher = Launcher::new(LaunchConfig::new(Backend::Ssh(backend)))
            .unwrap()
            .with_shell(shell.clone());
        launcher.add_runner(shell_runner());
        launcher.execute().unwrap();

        let scripts = shell.scripts();
        assert!(scripts[0].starts_with("scp "));
        assert!(scripts[1].contains("bash /tmp/remlaunch-"));
    }

    #[test]
    fn test_setup_host_runs_once() {
        let shell = Arc::new(RecordingShell::new());
        let mut launcher = Launcher::new(LaunchConfig::new(Backend::Ssh(SshBackend::new(SshTarget::new("box")))))
            .unwrap()
            .with_shell(shell.clone());
        let mount = Arc::new(BindMount::new("/srv/data", "/data").unwrap());
        launcher.add_runner(shell_runner().with_mount(mount));

        assert!(launcher.setup_host().unwrap());
        assert!(!launcher.setup_host().unwrap());
        assert_eq!(shell.calls().len(), 1);
        assert!(launcher.host_unpacked());

        launcher.plan_instance().unwrap();
        match &launcher.plans()[0] {
            Plan::Script { script, .. } => assert!(!script.contains("# [unpack]")),
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_setup_host_is_noop_for_cloud() {
        let mut launcher = Launcher::new(LaunchConfig::new(Backend::Gce(GceBackend::new("p", "z", "t"))))
            .unwrap()
            .with_shell(Arc::new(RecordingShell::new()));
        assert!(!launcher.setup_host().unwrap());
    }
}
