//! Runners
//!
//! A [`Runner`] wraps payload invocations for one kind of execution
//! environment. [`Runner::build`] composes the invocation of a payload;
//! [`Runner::chain`] adds another that runs alongside it, joined by a barrier
//! that waits on their pids. The launcher then collects each runner's setup,
//! run and post scripts, or for [`RunnerKind::KubeJob`] the finished [`Job`].

mod container;
pub mod kube;
mod scheduler;
mod shell;

pub use container::ContainerRunner;
pub use kube::{Job, KubeJobRunner};
pub use scheduler::SlurmRunner;
pub use shell::ShellRunner;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ConfigurationError;
use crate::launcher::LaunchConfig;
use crate::mount::{BindSpec, Mount};
use crate::payload::Payload;
use crate::shell::{join_background, quote};
use crate::{DEFAULT_ENTRY_COMMAND, PAYLOAD_ENV};

/// Where and how an invocation runs on the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Shell expression to `cd` into before the entry point.
    pub work_dir: Option<String>,
    /// Environment for the runner's process.
    pub envs: BTreeMap<String, String>,
    /// Snippet run on the worker before anything else.
    pub startup: Option<String>,
    /// Variable that search-path mounts are appended to.
    pub search_path_var: String,
    pub entry_command: String,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            work_dir: None,
            envs: BTreeMap::new(),
            startup: None,
            search_path_var: "PATH".to_string(),
            entry_command: DEFAULT_ENTRY_COMMAND.to_string(),
        }
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<String>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    pub fn with_startup(mut self, startup: impl Into<String>) -> Self {
        self.startup = Some(startup.into());
        self
    }

    pub fn with_search_path_var(mut self, var: impl Into<String>) -> Self {
        self.search_path_var = var.into();
        self
    }

    pub fn with_entry_command(mut self, entry_command: impl Into<String>) -> Self {
        self.entry_command = entry_command.into();
        self
    }

    /// `K=V ` assignments to prefix a command with. Empty when there are
    /// no variables.
    pub(crate) fn env_prefix(&self) -> String {
        self.envs
            .iter()
            .map(|(key, value)| format!("{}={} ", key, quote(value)))
            .collect()
    }
}

/// The execution environment a runner targets.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RunnerKind {
    Shell(ShellRunner),
    Container(ContainerRunner),
    Scheduler(SlurmRunner),
    KubeJob(KubeJobRunner),
}

impl RunnerKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Shell(_) => "shell",
            Self::Container(_) => "container",
            Self::Scheduler(_) => "scheduler",
            Self::KubeJob(_) => "kube-job",
        }
    }

    /// Whether invocations see mounts at their container paths.
    pub fn is_containerized(&self) -> bool {
        matches!(self, Self::Container(_) | Self::KubeJob(_))
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            Self::Shell(_) => Ok(()),
            Self::Container(container) => container.validate(),
            Self::Scheduler(slurm) => slurm.validate(),
            Self::KubeJob(kube) => kube.validate(),
        }
    }
}

/// Default container and job name: `remlaunch-job-HHMMSS-xxxxxx`.
pub fn job_name() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("remlaunch-job-{}-{}", Utc::now().format("%H%M%S"), &suffix[..6])
}

#[derive(Debug, Clone)]
pub struct Runner {
    kind: RunnerKind,
    context: ExecutionContext,
    setup: Option<String>,
    post: Option<String>,
    mounts: Vec<Arc<dyn Mount>>,
    /// Invocations of the current unit: the whole run script, or the last
    /// container of a job.
    invocations: Vec<String>,
    job: Option<Job>,
    launch_config: Option<LaunchConfig>,
}

impl Runner {
    pub fn new(kind: RunnerKind) -> Result<Self, ConfigurationError> {
        kind.validate()?;
        Ok(Self {
            kind,
            context: ExecutionContext::default(),
            setup: None,
            post: None,
            mounts: Vec::new(),
            invocations: Vec::new(),
            job: None,
            launch_config: None,
        })
    }

    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    /// Script run on the host before the workload.
    pub fn with_setup(mut self, setup: impl Into<String>) -> Self {
        self.setup = Some(setup.into());
        self
    }

    /// Script run on the host after the workload.
    pub fn with_post(mut self, post: impl Into<String>) -> Self {
        self.post = Some(post.into());
        self
    }

    pub fn with_mount(mut self, mount: Arc<dyn Mount>) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_mounts(mut self, mounts: impl IntoIterator<Item = Arc<dyn Mount>>) -> Self {
        self.mounts.extend(mounts);
        self
    }

    pub fn kind(&self) -> &RunnerKind {
        &self.kind
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn mounts(&self) -> &[Arc<dyn Mount>] {
        &self.mounts
    }

    /// Launch configuration captured when the runner was queued.
    pub fn launch_config(&self) -> Option<&LaunchConfig> {
        self.launch_config.as_ref()
    }

    pub(crate) fn set_launch_config(&mut self, config: LaunchConfig) {
        self.launch_config = Some(config);
    }

    pub fn is_built(&self) -> bool {
        !self.invocations.is_empty()
    }

    fn search_paths(&self) -> Vec<String> {
        let containerized = self.kind.is_containerized();
        self.mounts
            .iter()
            .filter(|mount| mount.on_search_path())
            .map(|mount| {
                if containerized {
                    mount.container_path()
                } else {
                    mount.host_path()
                }
            })
            .collect()
    }

    fn binds(&self) -> Vec<BindSpec> {
        self.mounts.iter().filter_map(|mount| mount.bind()).collect()
    }

    /// The worker-side commands that run one payload.
    pub fn invocation(&self, payload: &Payload) -> String {
        let mut lines = vec![r#"echo "Running on worker $(hostname)" 1>&2"#.to_string()];

        if let Some(ref startup) = self.context.startup {
            if !startup.trim().is_empty() {
                lines.push(startup.trim().to_string());
            }
        }
        if let Some(ref work_dir) = self.context.work_dir {
            lines.push(format!("cd {}", work_dir));
        }

        let paths = self.search_paths();
        if !paths.is_empty() {
            let var = &self.context.search_path_var;
            lines.push(format!("export {var}=${var}:{}", paths.join(":")));
        }

        lines.push(format!(
            "{}={} {}",
            PAYLOAD_ENV,
            payload.encode(),
            self.context.entry_command
        ));
        lines.join("\n")
    }

    /// Compose the invocation of `payload`, replacing anything built before.
    ///
    /// For a kube job this adds a new container to the job instead.
    pub fn build(&mut self, payload: &Payload) -> &mut Self {
        let invocation = self.invocation(payload);
        tracing::debug!(runner = self.kind.label(), function = %payload.function, "built invocation");
        self.invocations = vec![invocation];

        if let RunnerKind::KubeJob(ref kube) = self.kind {
            let binds = self.binds();
            let job = self
                .job
                .get_or_insert_with(|| kube.job_template(&binds));
            let container = kube.container(job.container_count(), &self.context, &binds, &self.invocations[0]);
            job.push_container(container);
        }
        self
    }

    /// Run `payload` alongside what is already built, waiting for both.
    ///
    /// Chaining onto an unbuilt runner is the same as [`Runner::build`].
    pub fn chain(&mut self, payload: &Payload) -> &mut Self {
        if !self.is_built() {
            return self.build(payload);
        }
        let invocation = self.invocation(payload);
        tracing::debug!(runner = self.kind.label(), function = %payload.function, "chained invocation");
        self.invocations.push(invocation);

        let main = self.main_script();
        if let Some(ref mut job) = self.job {
            job.set_last_command(main);
        }
        self
    }

    /// All invocations of the current unit, backgrounded and joined.
    pub fn main_script(&self) -> String {
        join_background(&self.invocations)
    }

    pub fn setup_script(&self) -> Option<String> {
        let user = self.setup.as_deref().map(str::trim).filter(|s| !s.is_empty());
        match self.kind {
            RunnerKind::Scheduler(_) => {
                let mut script = SlurmRunner::login_announce().to_string();
                if let Some(user) = user {
                    script.push('\n');
                    script.push_str(user);
                }
                Some(script)
            }
            _ => user.map(str::to_string),
        }
    }

    /// Host command that runs the built invocations. `None` before
    /// [`Runner::build`] and for kube jobs, which are submitted as specs.
    pub fn run_script(&self) -> Option<String> {
        if !self.is_built() {
            return None;
        }
        let main = self.main_script();
        match self.kind {
            RunnerKind::Shell(ref shell) => Some(shell.run_script(&main, &self.context)),
            RunnerKind::Container(ref container) => {
                Some(container.run_script(&main, &self.context, &self.binds()))
            }
            RunnerKind::Scheduler(ref slurm) => Some(slurm.run_script(&main, &self.context)),
            RunnerKind::KubeJob(_) => None,
        }
    }

    pub fn post_script(&self) -> Option<String> {
        self.post
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    /// The job spec of a kube-job runner, once built.
    pub fn job(&self) -> Option<&Job> {
        self.job.as_ref()
    }
}
