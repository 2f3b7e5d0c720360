//! Remote hosts
//!
//! How the submitting machine reaches a host: SSH command lines built for the
//! local shell, or HTTP calls to a `remlaunch-agent`.

pub mod agent;
pub mod ssh;

pub use agent::AgentClient;
pub use ssh::{RemoteExec, SshTarget};
