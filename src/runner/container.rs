use std::collections::BTreeMap;

use serde::Deserialize;

use super::{job_name, ExecutionContext};
use crate::error::ConfigurationError;
use crate::mount::BindSpec;
use crate::shell::quote;

fn default_docker() -> String {
    "docker".to_string()
}

/// Runs invocations inside a fresh `docker run` container on the host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerRunner {
    pub image: String,
    /// Container name. A running container of the same name is killed and
    /// removed first.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_docker")]
    pub docker_cmd: String,
    /// Value for `--gpus`; also turns on the `nvidia-smi` smoke test.
    #[serde(default)]
    pub gpus: Option<String>,
    #[serde(default)]
    pub ipc: Option<String>,
    #[serde(default)]
    pub net: Option<String>,
    /// Working directory inside the container (`--workdir`).
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub tty: bool,
    /// Extra `--key=value` options for `docker run`.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(skip, default = "job_name")]
    generated_name: String,
}

impl ContainerRunner {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: None,
            docker_cmd: default_docker(),
            gpus: None,
            ipc: None,
            net: None,
            workdir: None,
            tty: false,
            options: BTreeMap::new(),
            generated_name: job_name(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_gpus(mut self, gpus: impl Into<String>) -> Self {
        self.gpus = Some(gpus.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn container_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.generated_name)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigurationError> {
        if self.image.trim().is_empty() {
            return Err(ConfigurationError::Empty("container image"));
        }
        Ok(())
    }

    fn run_options(&self) -> Vec<String> {
        let mut options = Vec::new();
        let named = [
            ("gpus", &self.gpus),
            ("ipc", &self.ipc),
            ("net", &self.net),
            ("workdir", &self.workdir),
        ];
        for (key, value) in named {
            if let Some(value) = value {
                options.push(format!("--{}={}", key, quote(value)));
            }
        }
        for (key, value) in &self.options {
            options.push(format!("--{}={}", key.replace('_', "-"), quote(value)));
        }
        options
    }

    pub(crate) fn run_script(&self, main: &str, context: &ExecutionContext, binds: &[BindSpec]) -> String {
        let docker = &self.docker_cmd;
        let name = quote(self.container_name());
        let options = self.run_options();
        let mut lines = Vec::new();

        if self.name.is_some() {
            lines.push("echo -ne 'kill running instances '".to_string());
            lines.push(format!("{docker} kill {name}"));
            lines.push("echo -ne 'remove existing container '".to_string());
            lines.push(format!("{docker} rm {name}"));
        }

        if self.gpus.is_some() {
            lines.push("echo 'Testing nvidia-smi inside docker'".to_string());
            lines.push(format!(
                "{docker} run --rm {} {} nvidia-smi",
                options.join(" "),
                self.image
            ));
        }

        lines.push(format!("echo 'running {} on' `hostname`", self.image));

        let mut run = vec![
            docker.clone(),
            "run".to_string(),
            if self.tty { "-it" } else { "-i" }.to_string(),
        ];
        run.extend(
            context
                .envs
                .iter()
                .map(|(key, value)| format!("--env {}", quote(&format!("{}={}", key, value)))),
        );
        run.extend(options);
        run.extend(binds.iter().map(BindSpec::docker_flag));
        run.push(format!("--name {}", name));
        run.push(self.image.clone());
        run.push(format!("/bin/bash -c {}", quote(main)));
        lines.push(run.join(" "));

        lines.join("\n")
    }
}
