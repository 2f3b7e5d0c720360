//! Error kinds shared across mounts, runners and launchers.
//!
//! - [`ConfigurationError`]: an invariant was violated before any shell or
//!   network activity.
//! - [`TransferError`]: a local archive or upload step failed; the plan that
//!   needed it is abandoned.
//! - [`TransportError`]: SSH, HTTP or collaborator CLI failure, surfaced as-is.
//!
//! Failures inside the remote workload itself are not errors on this side:
//! they come back as the exit code of the composed script or entry point.

use std::io;
use std::path::PathBuf;

use crate::mount::archive::ArchiveError;
use crate::shell::ShellError;

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("{field} must be an absolute path, got '{value}'")]
    NotAbsolute { field: &'static str, value: String },

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("instance name is {len} characters, the limit is {max}")]
    NameTooLong { len: usize, max: usize },

    #[error("{backend} does not support {feature}")]
    Unsupported {
        backend: &'static str,
        feature: &'static str,
    },

    #[error("{0}")]
    Invalid(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse launch file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("failed to archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: ArchiveError,
    },

    #[error("transfer command failed: {0}")]
    Command(#[from] ShellError),

    #[error("transfer transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("upload of {artifact} could not be verified on the remote host")]
    Unverified { artifact: String },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("agent answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("command failed: {0}")]
    Command(#[from] ShellError),

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("cloud API error: {0}")]
    Cloud(String),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Umbrella error for launcher operations.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to render job manifest: {0}")]
    Manifest(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<ShellError> for LaunchError {
    fn from(err: ShellError) -> Self {
        Self::Transport(TransportError::Command(err))
    }
}
