//! remlaunch: ship code, run registered functions anywhere
//!
//! A caller attaches [`mount`]s (how code and data reach the remote side) and a
//! [`runner`] (how one payload invocation is wrapped for a backend) to a
//! [`launcher`], which composes a backend-correct bootstrap script or job spec
//! and submits it. On the far side, the `remlaunch-entry` binary decodes the
//! [`payload`] from the environment and calls the named function.
//!
//! Supported backends: local shell, SSH host, EC2 and GCE instances, Slurm,
//! Kubernetes Jobs, and hosts running the `remlaunch-agent` exec server.

pub mod config;
pub mod entry;
pub mod error;
pub mod host;
pub mod launcher;
pub mod mock;
pub mod mount;
pub mod payload;
pub mod runner;
pub mod script;
pub mod shell;

pub use error::{ConfigurationError, LaunchError, TransferError, TransportError};
pub use launcher::{Backend, LaunchConfig, LaunchOptions, Launcher, LauncherState, Plan, Submission};
pub use mount::{Mount, MountId, UploadRegistry};
pub use payload::{decode, encode, CallArgs, CallError, DecodeError, FunctionRegistry, Payload};
pub use runner::{ExecutionContext, Runner, RunnerKind};

/// Environment variable carrying the encoded payload to the entry point.
pub const PAYLOAD_ENV: &str = "REMLAUNCH_PAYLOAD";

/// Command that runs the entry point on the worker.
pub const DEFAULT_ENTRY_COMMAND: &str = "remlaunch-entry";
