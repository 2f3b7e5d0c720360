//! remlaunch protocol types
//!
//! JSON bodies exchanged between the exec agent (`remlaunch-agent`) and the
//! submitting side's `AgentClient`.

pub mod exec;
pub mod files;

pub use exec::{ExecReply, ExecRequest, ExecResponse, ExecResult, TimeoutSentinel};
pub use files::{FileAck, WriteQuery};

/// Port the agent listens on when none is configured.
pub const DEFAULT_PORT: u16 = 8092;

/// Route prefix for file uploads; the remainder of the path is the target file.
pub const FILES_ROUTE: &str = "/files";

/// Route for shell command execution.
pub const EXEC_ROUTE: &str = "/exec";
