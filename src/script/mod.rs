//! Launch script composition
//!
//! A launch script is assembled from fragments filed under [`Section`]s and
//! rendered in section order, whatever order the fragments were pushed in.
//! Sections after [`Section::Preamble`] run inside one brace group whose
//! stdout and stderr are tee'd into `launch.log` and `launch.err.log`.
//!
//! Unpack and transfer fragments each run in a `set -e` subshell; the first
//! failing one ends the script with its status. The run barrier's status
//! becomes the script's exit status once every later section has run.

pub mod templates;

use std::collections::BTreeMap;

use crate::shell::{wait_all, RUN_STATUS_VAR};

/// Script sections in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Section {
    /// Root configuration, before logging is set up.
    Preamble,
    /// Launch-level setup commands.
    LaunchSetup,
    /// Cloud instance tagging.
    InstanceTag,
    /// Mount unpacking on the host.
    Unpack,
    /// Host-side transfer scripts of mounts.
    Transfer,
    /// Runner setup scripts.
    RunnerSetup,
    /// Runner run scripts, backgrounded and waited on by pid.
    Run,
    /// Runner post scripts.
    Post,
    /// Final output sync of mounts.
    SyncBack,
    /// Instance self-termination.
    Terminate,
}

impl Section {
    pub fn label(self) -> &'static str {
        match self {
            Self::Preamble => "preamble",
            Self::LaunchSetup => "launch-setup",
            Self::InstanceTag => "instance-tag",
            Self::Unpack => "unpack",
            Self::Transfer => "transfer",
            Self::RunnerSetup => "runner-setup",
            Self::Run => "run",
            Self::Post => "post",
            Self::SyncBack => "sync-back",
            Self::Terminate => "terminate",
        }
    }

    /// The comment line that opens this section in a rendered script.
    pub fn marker(self) -> String {
        format!("# [{}]", self.label())
    }
}

/// Name of the stdout log inside the log directory.
pub const LOG_FILE: &str = "launch.log";

/// Name of the stderr log inside the log directory.
pub const ERR_LOG_FILE: &str = "launch.err.log";

/// Ordered-section script builder.
#[derive(Debug, Clone, Default)]
pub struct ScriptBuilder {
    sections: BTreeMap<Section, Vec<String>>,
    log_dir: Option<String>,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dual-log everything after the preamble into `dir`.
    pub fn with_log_dir(mut self, dir: impl Into<String>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// File `fragment` under `section`. Blank fragments are dropped.
    pub fn push(&mut self, section: Section, fragment: impl AsRef<str>) -> &mut Self {
        let fragment = fragment.as_ref().trim_matches('\n').trim_end();
        if !fragment.trim().is_empty() {
            self.sections
                .entry(section)
                .or_default()
                .push(fragment.to_string());
        }
        self
    }

    pub fn extend<I, S>(&mut self, section: Section, fragments: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for fragment in fragments {
            self.push(section, fragment);
        }
        self
    }

    pub fn fragments(&self, section: Section) -> &[String] {
        self.sections.get(&section).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn render(&self) -> String {
        let mut script = String::from("#!/bin/bash\n# allow process substitution\nset +o posix\n");

        for (section, fragments) in &self.sections {
            if *section == Section::Preamble {
                render_section(&mut script, *section, fragments);
            }
        }

        if let Some(ref dir) = self.log_dir {
            script.push_str(&format!("mkdir -p {dir}\n{{\n"));
        }

        for (section, fragments) in &self.sections {
            if *section != Section::Preamble {
                render_section(&mut script, *section, fragments);
            }
        }

        if let Some(ref dir) = self.log_dir {
            script.push_str(&format!(
                "}} > >(tee -a {dir}/{LOG_FILE}) 2> >(tee -a {dir}/{ERR_LOG_FILE} >&2)\n"
            ));
        }

        if self.sections.contains_key(&Section::Run) {
            script.push_str(&format!("exit ${RUN_STATUS_VAR}\n"));
        }

        script
    }
}

fn render_section(script: &mut String, section: Section, fragments: &[String]) {
    script.push_str(&section.marker());
    script.push('\n');
    match section {
        Section::Run => {
            script.push_str(&wait_all(fragments));
            script.push('\n');
        }
        Section::Unpack | Section::Transfer => {
            for fragment in fragments {
                script.push_str(&format!("(\nset -e\n{}\n) || exit $?\n", fragment));
            }
        }
        _ => {
            for fragment in fragments {
                script.push_str(fragment);
                script.push('\n');
            }
        }
    }
}
