//! `PUT|POST /files/*path` query and acknowledgement bodies.

use serde::{Deserialize, Serialize};

/// Query string of `POST /files/*path`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteQuery {
    /// `false` appends to an existing file; absent or `true` replaces it.
    #[serde(default)]
    pub overwrite: Option<bool>,
}

impl WriteQuery {
    pub fn overwrite(&self) -> bool {
        self.overwrite.unwrap_or(true)
    }
}

/// Acknowledgement returned after a file write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAck {
    /// Resolved path on the agent host.
    pub path: String,
    /// Bytes written by this request.
    pub bytes: u64,
}
