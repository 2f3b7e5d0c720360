//! Kubernetes `batch/v1` Job specs.
//!
//! Only the subset of the Job schema the launcher fills in is modelled.
//! Specs are serialized with `serde_yaml` and handed to `kubectl apply`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{job_name, ExecutionContext};
use crate::error::ConfigurationError;
use crate::mount::BindSpec;

const GPU_RESOURCE: &str = "nvidia.com/gpu";
const GPU_PRODUCT_LABEL: &str = "nvidia.com/gpu.product";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: JobSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub template: PodTemplate,
    pub backoff_limit: u32,
    pub ttl_seconds_after_finished: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodTemplate {
    pub spec: PodSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    pub containers: Vec<Container>,
    pub restart_policy: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<NamedRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub host_path: HostPathSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostPathSource {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    pub image: String,
    pub image_pull_policy: String,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    pub resources: Resources,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub requests: BTreeMap<String, String>,
    pub limits: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Affinity {
    pub node_affinity: NodeAffinity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAffinity {
    pub required_during_scheduling_ignored_during_execution: NodeSelector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelector {
    pub node_selector_terms: Vec<NodeSelectorTerm>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorTerm {
    pub match_expressions: Vec<MatchExpression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchExpression {
    pub key: String,
    pub operator: String,
    pub values: Vec<String>,
}

impl Job {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn containers(&self) -> &[Container] {
        &self.spec.template.spec.containers
    }

    pub(crate) fn container_count(&self) -> usize {
        self.spec.template.spec.containers.len()
    }

    pub(crate) fn push_container(&mut self, container: Container) {
        self.spec.template.spec.containers.push(container);
    }

    /// Replace the script the last container runs.
    pub(crate) fn set_last_command(&mut self, script: String) {
        if let Some(container) = self.spec.template.spec.containers.last_mut() {
            container.command = bash_command(script);
        }
    }
}

fn bash_command(script: String) -> Vec<String> {
    vec!["/bin/bash".to_string(), "-c".to_string(), script]
}

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_cpu() -> String {
    "50m".to_string()
}

fn default_mem() -> String {
    "50Mi".to_string()
}

fn default_restart_policy() -> String {
    "Never".to_string()
}

fn default_backoff_limit() -> u32 {
    1
}

fn default_ttl() -> u32 {
    3600
}

/// Packs invocations into a Kubernetes Job, one container per
/// [`Runner::build`](super::Runner::build).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KubeJobRunner {
    pub image: String,
    #[serde(default = "default_pull_policy")]
    pub image_pull_policy: String,
    #[serde(default)]
    pub image_pull_secret: Option<String>,
    /// Job and container name.
    #[serde(default = "job_name")]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "default_cpu")]
    pub cpu: String,
    #[serde(default = "default_mem")]
    pub mem: String,
    /// Defaults to `cpu`.
    #[serde(default)]
    pub cpu_limit: Option<String>,
    /// Defaults to `mem`.
    #[serde(default)]
    pub mem_limit: Option<String>,
    #[serde(default)]
    pub gpu: u32,
    /// Defaults to `gpu`.
    #[serde(default)]
    pub gpu_limit: Option<u32>,
    /// Restrict scheduling to nodes with these GPU products.
    #[serde(default)]
    pub gpu_types: Vec<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default = "default_restart_policy")]
    pub restart_policy: String,
    #[serde(default = "default_backoff_limit")]
    pub backoff_limit: u32,
    #[serde(default = "default_ttl")]
    pub ttl_seconds_after_finished: u32,
}

impl KubeJobRunner {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            image_pull_policy: default_pull_policy(),
            image_pull_secret: None,
            name: job_name(),
            namespace: None,
            cpu: default_cpu(),
            mem: default_mem(),
            cpu_limit: None,
            mem_limit: None,
            gpu: 0,
            gpu_limit: None,
            gpu_types: Vec::new(),
            workdir: None,
            restart_policy: default_restart_policy(),
            backoff_limit: default_backoff_limit(),
            ttl_seconds_after_finished: default_ttl(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_gpu(mut self, gpu: u32) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn with_gpu_types(mut self, gpu_types: Vec<String>) -> Self {
        self.gpu_types = gpu_types;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigurationError> {
        if self.image.trim().is_empty() {
            return Err(ConfigurationError::Empty("container image"));
        }
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::Empty("job name"));
        }
        Ok(())
    }

    fn resources(&self) -> Resources {
        let mut requests = BTreeMap::from([
            ("cpu".to_string(), self.cpu.clone()),
            ("memory".to_string(), self.mem.clone()),
        ]);
        let mut limits = BTreeMap::from([
            ("cpu".to_string(), self.cpu_limit.clone().unwrap_or_else(|| self.cpu.clone())),
            ("memory".to_string(), self.mem_limit.clone().unwrap_or_else(|| self.mem.clone())),
        ]);
        let gpu_limit = self.gpu_limit.unwrap_or(self.gpu);
        if self.gpu > 0 {
            requests.insert(GPU_RESOURCE.to_string(), self.gpu.to_string());
        }
        if gpu_limit > 0 {
            limits.insert(GPU_RESOURCE.to_string(), gpu_limit.to_string());
        }
        Resources { requests, limits }
    }

    fn affinity(&self) -> Option<Affinity> {
        if self.gpu_types.is_empty() {
            return None;
        }
        Some(Affinity {
            node_affinity: NodeAffinity {
                required_during_scheduling_ignored_during_execution: NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: vec![MatchExpression {
                            key: GPU_PRODUCT_LABEL.to_string(),
                            operator: "In".to_string(),
                            values: self.gpu_types.clone(),
                        }],
                    }],
                },
            },
        })
    }

    /// An empty job with volumes for `binds`.
    pub(crate) fn job_template(&self, binds: &[BindSpec]) -> Job {
        let volumes = binds
            .iter()
            .enumerate()
            .map(|(i, bind)| Volume {
                name: volume_name(i),
                host_path: HostPathSource {
                    path: bind.source.clone(),
                },
            })
            .collect();

        Job {
            api_version: "batch/v1".to_string(),
            kind: "Job".to_string(),
            metadata: ObjectMeta {
                name: self.name.clone(),
                namespace: self.namespace.clone(),
            },
            spec: JobSpec {
                template: PodTemplate {
                    spec: PodSpec {
                        volumes,
                        containers: Vec::new(),
                        restart_policy: self.restart_policy.clone(),
                        image_pull_secrets: self
                            .image_pull_secret
                            .iter()
                            .map(|name| NamedRef { name: name.clone() })
                            .collect(),
                        affinity: self.affinity(),
                    },
                },
                backoff_limit: self.backoff_limit,
                ttl_seconds_after_finished: self.ttl_seconds_after_finished,
            },
        }
    }

    /// The `index`th container of the job, running `script`.
    pub(crate) fn container(
        &self,
        index: usize,
        context: &ExecutionContext,
        binds: &[BindSpec],
        script: &str,
    ) -> Container {
        let name = if index == 0 {
            self.name.clone()
        } else {
            format!("{}-{}", self.name, index)
        };
        Container {
            name,
            image: self.image.clone(),
            image_pull_policy: self.image_pull_policy.clone(),
            command: bash_command(script.to_string()),
            env: context
                .envs
                .iter()
                .map(|(name, value)| EnvVar {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
            resources: self.resources(),
            volume_mounts: binds
                .iter()
                .enumerate()
                .map(|(i, bind)| VolumeMount {
                    name: volume_name(i),
                    mount_path: bind.target.clone(),
                })
                .collect(),
            working_dir: self.workdir.clone(),
        }
    }
}

fn volume_name(index: usize) -> String {
    format!("mount-{}", index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::BindMount;
    use crate::payload::Payload;
    use crate::runner::{Runner, RunnerKind};
    use std::sync::Arc;

    fn kube_runner(kube: KubeJobRunner) -> Runner {
        Runner::new(RunnerKind::KubeJob(kube)).unwrap()
    }

    #[test]
    fn test_limits_default_to_requests() {
        let resources = KubeJobRunner::new("img").resources();
        assert_eq!(resources.requests["cpu"], "50m");
        assert_eq!(resources.limits["cpu"], "50m");
        assert_eq!(resources.limits["memory"], "50Mi");
        assert!(!resources.requests.contains_key(GPU_RESOURCE));

        let gpu = KubeJobRunner::new("img").with_gpu(2).resources();
        assert_eq!(gpu.requests[GPU_RESOURCE], "2");
        assert_eq!(gpu.limits[GPU_RESOURCE], "2");
    }

    #[test]
    fn test_build_appends_containers_with_unique_names() {
        let mut runner = kube_runner(KubeJobRunner::new("python:3.11").with_name("train"));
        runner.build(&Payload::new("echo")).build(&Payload::new("add"));

        let job = runner.job().unwrap();
        let names: Vec<&str> = job.containers().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["train", "train-1"]);
        assert_eq!(job.containers()[0].command[..2], ["/bin/bash", "-c"]);
        assert!(runner.run_script().is_none());
    }

    #[test]
    fn test_chain_rewrites_last_container() {
        let mut runner = kube_runner(KubeJobRunner::new("python:3.11"));
        runner.build(&Payload::new("echo")).chain(&Payload::new("add"));

        let job = runner.job().unwrap();
        assert_eq!(job.containers().len(), 1);
        let script = &job.containers()[0].command[2];
        assert_eq!(script.matches("remlaunch-entry").count(), 2);
        assert!(script.ends_with("(exit $run_status)"));
    }

    #[test]
    fn test_binds_become_host_path_volumes() {
        let mount = Arc::new(BindMount::new("/data/cache", "/cache").unwrap());
        let mut runner = kube_runner(KubeJobRunner::new("img")).with_mount(mount);
        runner.build(&Payload::new("echo"));

        let job = runner.job().unwrap();
        let pod = &job.spec.template.spec;
        assert_eq!(pod.volumes[0].host_path.path, "/data/cache");
        assert_eq!(pod.containers[0].volume_mounts[0].mount_path, "/cache");
        assert_eq!(pod.volumes[0].name, pod.containers[0].volume_mounts[0].name);
    }

    #[test]
    fn test_yaml_shape() {
        let mut runner = kube_runner(
            KubeJobRunner::new("img")
                .with_name("train")
                .with_gpu_types(vec!["Tesla-T4".to_string()]),
        );
        runner.build(&Payload::new("echo"));
        let yaml = serde_yaml::to_string(runner.job().unwrap()).unwrap();

        assert!(yaml.contains("apiVersion: batch/v1"));
        assert!(yaml.contains("kind: Job"));
        assert!(yaml.contains("backoffLimit: 1"));
        assert!(yaml.contains("ttlSecondsAfterFinished: 3600"));
        assert!(yaml.contains("restartPolicy: Never"));
        assert!(yaml.contains("requiredDuringSchedulingIgnoredDuringExecution"));
        assert!(yaml.contains("nvidia.com/gpu.product"));
    }
}
