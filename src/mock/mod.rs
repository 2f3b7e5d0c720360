//! In-process doubles
//!
//! Stand-ins for the local shell and the cloud API that record what they were
//! asked to do instead of doing it. Used by unit and integration tests, and
//! by dry runs.

use std::sync::Mutex;

use crate::error::TransportError;
use crate::launcher::cloud::{CloudApi, InstanceRequest};
use crate::shell::{CommandOutput, CommandRunner, ShellCommand, ShellError};

/// A [`CommandRunner`] that records every command and answers from canned
/// responses.
///
/// A command matches a response when the response's needle occurs in its
/// script or stdin; the first match wins. Unmatched commands succeed with
/// empty output.
#[derive(Debug, Default)]
pub struct RecordingShell {
    calls: Mutex<Vec<ShellCommand>>,
    responses: Vec<(String, CommandOutput)>,
}

impl RecordingShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `needle` with `output`.
    pub fn respond(mut self, needle: impl Into<String>, output: CommandOutput) -> Self {
        self.responses.push((needle.into(), output));
        self
    }

    /// Fail commands containing `needle` with `status` and `stderr`.
    pub fn fail_on(self, needle: impl Into<String>, status: i32, stderr: impl Into<String>) -> Self {
        self.respond(needle, CommandOutput::failed(status, stderr))
    }

    /// Every command run so far, in order.
    pub fn calls(&self) -> Vec<ShellCommand> {
        self.calls.lock().unwrap().clone()
    }

    /// Scripts of every command run so far.
    pub fn scripts(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.script).collect()
    }

    /// Number of commands whose script or stdin contains `needle`.
    pub fn count_matching(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches(c, needle))
            .count()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

fn matches(command: &ShellCommand, needle: &str) -> bool {
    command.script.contains(needle)
        || command
            .stdin
            .as_deref()
            .map(|stdin| stdin.contains(needle))
            .unwrap_or(false)
}

impl CommandRunner for RecordingShell {
    fn run(&self, command: &ShellCommand) -> Result<CommandOutput, ShellError> {
        self.calls.lock().unwrap().push(command.clone());

        let response = self
            .responses
            .iter()
            .find(|(needle, _)| matches(command, needle))
            .map(|(_, output)| output.clone());

        Ok(match response {
            Some(output) => output,
            None if command.detach => CommandOutput {
                pid: Some(0),
                ..CommandOutput::default()
            },
            None => CommandOutput::ok(""),
        })
    }
}

/// A [`CloudApi`] that records requests and hands out sequential ids.
#[derive(Debug, Default)]
pub struct RecordingCloudApi {
    requests: Mutex<Vec<InstanceRequest>>,
    batches: Mutex<usize>,
}

impl RecordingCloudApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<InstanceRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of `submit` calls.
    pub fn batches(&self) -> usize {
        *self.batches.lock().unwrap()
    }
}

impl CloudApi for RecordingCloudApi {
    fn submit(&self, requests: &[InstanceRequest]) -> Result<Vec<String>, TransportError> {
        let mut recorded = self.requests.lock().unwrap();
        *self.batches.lock().unwrap() += 1;
        let start = recorded.len();
        recorded.extend_from_slice(requests);
        Ok((start..recorded.len())
            .map(|i| format!("mock-instance-{}", i))
            .collect())
    }
}
