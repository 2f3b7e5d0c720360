use serde::Deserialize;

use super::ExecutionContext;
use crate::shell::quote;

fn default_shell() -> String {
    "bash".to_string()
}

/// Runs invocations with a plain shell on the host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellRunner {
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Keep the workload running after the launching session goes away.
    ///
    /// The workload runs under `screen`; its output is relayed through a
    /// fifo for as long as the session lasts.
    #[serde(default)]
    pub detach: bool,
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            detach: false,
        }
    }
}

impl ShellRunner {
    pub fn detached(mut self) -> Self {
        self.detach = true;
        self
    }

    pub(crate) fn run_script(&self, main: &str, context: &ExecutionContext) -> String {
        let envs = context.env_prefix();
        if !self.detach {
            return format!("{}{} -c {}", envs, self.shell, quote(main));
        }

        // `tee -p` ignores a closed reader, so screen outlives the session.
        let piped = format!("{{\n{}\n}} |& tee -p $pipe", main);
        format!(
            "export pipe=$(mktemp -u)\nmkfifo $pipe\n{}screen -md {} -c {}\ncat $pipe\nrm -f $pipe",
            envs,
            self.shell,
            quote(&piped)
        )
    }
}
