//! Agent configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;

/// Listener and filesystem settings, parsed from the command line.
#[derive(Debug, Clone, Args)]
pub struct AgentConfig {
    /// Interface to bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, short = 'p', default_value_t = remlaunch_protocol::DEFAULT_PORT)]
    pub port: u16,

    /// Directory that relative upload paths and command working directories
    /// resolve against.
    #[arg(long, default_value = ".")]
    pub file_root: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: remlaunch_protocol::DEFAULT_PORT,
            file_root: PathBuf::from("."),
        }
    }
}

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AgentState {
    file_root: Arc<PathBuf>,
}

impl AgentState {
    pub fn new(file_root: impl Into<PathBuf>) -> Self {
        Self {
            file_root: Arc::new(file_root.into()),
        }
    }

    /// Canonicalizes the configured root so commands see a stable cwd.
    pub fn from_config(config: &AgentConfig) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.file_root)?;
        Ok(Self::new(config.file_root.canonicalize()?))
    }

    pub fn file_root(&self) -> &Path {
        &self.file_root
    }

    /// Resolve a request path: a leading `/` is absolute, anything else is
    /// relative to the file root.
    pub fn resolve(&self, path: &str) -> PathBuf {
        if path.starts_with('/') {
            PathBuf::from(path)
        } else {
            self.file_root.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_and_absolute() {
        let state = AgentState::new("/srv/agent");
        assert_eq!(state.resolve("a.txt"), PathBuf::from("/srv/agent/a.txt"));
        assert_eq!(
            state.resolve("nested/dir/b.tar"),
            PathBuf::from("/srv/agent/nested/dir/b.tar")
        );
        assert_eq!(state.resolve("/tmp/x"), PathBuf::from("/tmp/x"));
    }
}
