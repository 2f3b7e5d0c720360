use std::collections::BTreeMap;

use serde::Deserialize;

use super::ExecutionContext;
use crate::error::ConfigurationError;
use crate::shell::quote;

fn default_shell() -> String {
    "/bin/bash".to_string()
}

fn default_n_cpu() -> Option<u32> {
    Some(4)
}

fn default_true() -> bool {
    true
}

fn default_n_seq_jobs() -> u32 {
    1
}

/// Submits invocations to a Slurm cluster from its login node.
///
/// Interactive runners block on `srun`. Batch runners queue `n_seq_jobs`
/// copies with `sbatch -d singleton`, so they run one after another under
/// the same job name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlurmRunner {
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub time_limit: Option<String>,
    #[serde(default = "default_n_cpu")]
    pub n_cpu: Option<u32>,
    #[serde(default)]
    pub n_gpu: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub label: bool,
    #[serde(default = "default_true")]
    pub interactive: bool,
    #[serde(default = "default_n_seq_jobs")]
    pub n_seq_jobs: u32,
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Bare flags, passed as `--flag`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra `--key=value` options.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl Default for SlurmRunner {
    fn default() -> Self {
        Self {
            partition: None,
            time_limit: None,
            n_cpu: default_n_cpu(),
            n_gpu: None,
            name: None,
            comment: None,
            label: false,
            interactive: true,
            n_seq_jobs: 1,
            shell: default_shell(),
            args: Vec::new(),
            options: BTreeMap::new(),
        }
    }
}

impl SlurmRunner {
    pub fn batch(mut self, n_seq_jobs: u32) -> Self {
        self.interactive = false;
        self.n_seq_jobs = n_seq_jobs;
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub(crate) fn login_announce() -> &'static str {
        r#"echo "Running on login-node $(hostname)""#
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigurationError> {
        if self.n_seq_jobs == 0 {
            return Err(ConfigurationError::Invalid(
                "n_seq_jobs must be at least 1".to_string(),
            ));
        }
        if self.interactive && self.n_seq_jobs > 1 {
            return Err(ConfigurationError::Invalid(
                "interactive scheduler runners only support a single job; set interactive = false for n_seq_jobs > 1"
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn option_string(&self) -> String {
        let mut options = Vec::new();
        if let Some(ref partition) = self.partition {
            options.push(format!("--partition={}", quote(partition)));
        }
        if let Some(ref time_limit) = self.time_limit {
            options.push(format!("--time={}", quote(time_limit)));
        }
        if let Some(n_cpu) = self.n_cpu {
            options.push(format!("--cpus-per-task={}", n_cpu));
        }
        // Some clusters reject --gres=gpu:0.
        if let Some(n_gpu) = self.n_gpu.filter(|n| *n > 0) {
            options.push(format!("--gres=gpu:{}", n_gpu));
        }
        if let Some(ref name) = self.name {
            options.push(format!("--job-name={}", quote(name)));
        }
        if self.label {
            options.push("--label".to_string());
        }
        if let Some(ref comment) = self.comment {
            options.push(format!("--comment={}", quote(comment)));
        }
        options.extend(self.args.iter().map(|arg| format!("--{}", arg)));
        options.extend(
            self.options
                .iter()
                .map(|(key, value)| format!("--{}={}", key.replace('_', "-"), quote(value))),
        );
        options.join(" ")
    }

    pub(crate) fn run_script(&self, main: &str, context: &ExecutionContext) -> String {
        let envs = context.env_prefix();
        let options = self.option_string();

        if self.interactive {
            return format!("{}srun {} {} -c {}", envs, options, self.shell, quote(main));
        }

        let batch_script = format!("#!/bin/bash\n{}", main);
        (0..self.n_seq_jobs)
            .map(|_| {
                format!(
                    "{}sbatch {} -d singleton <<< {}",
                    envs,
                    options,
                    quote(&batch_script)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_srun_line() {
        let runner = SlurmRunner {
            partition: Some("gpu".to_string()),
            time_limit: Some("1:00:00".to_string()),
            n_gpu: Some(1),
            ..SlurmRunner::default()
        };
        let script = runner.run_script("echo hi", &ExecutionContext::new());
        assert_eq!(
            script,
            "srun --partition=gpu --time=1:00:00 --cpus-per-task=4 --gres=gpu:1 /bin/bash -c 'echo hi'"
        );
    }

    #[test]
    fn test_sbatch_sequence() {
        let runner = SlurmRunner::default()
            .batch(3)
            .with_option("mem_per_cpu", "4G");
        let script = runner.run_script("echo hi", &ExecutionContext::new());
        let lines: Vec<&str> = script.lines().filter(|l| l.contains("sbatch")).collect();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("sbatch --cpus-per-task=4 --mem-per-cpu=4G -d singleton <<< '#!/bin/bash"));
    }

    #[test]
    fn test_interactive_sequence_is_rejected() {
        let runner = SlurmRunner {
            n_seq_jobs: 2,
            ..SlurmRunner::default()
        };
        assert!(runner.validate().is_err());
        assert!(SlurmRunner::default().batch(2).validate().is_ok());
        assert!(SlurmRunner::default().batch(0).validate().is_err());
    }
}
