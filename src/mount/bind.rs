//! Pre-existing host path bound into the container.

use super::{require_absolute, BindKind, BindSpec, Mount, MountId};
use crate::error::ConfigurationError;

/// Both paths already exist; there is nothing to transfer or unpack.
#[derive(Debug, Clone)]
pub struct BindMount {
    id: MountId,
    host_path: String,
    container_path: String,
    kind: BindKind,
    search_path: bool,
}

impl BindMount {
    pub fn new(host_path: impl Into<String>, container_path: impl Into<String>) -> Result<Self, ConfigurationError> {
        let host_path = host_path.into();
        let container_path = container_path.into();
        require_absolute("host_path", &host_path)?;
        require_absolute("container_path", &container_path)?;
        Ok(Self {
            id: MountId::new(),
            host_path,
            container_path,
            kind: BindKind::Bind,
            search_path: false,
        })
    }

    pub fn with_kind(mut self, kind: BindKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_search_path(mut self, search_path: bool) -> Self {
        self.search_path = search_path;
        self
    }
}

impl Mount for BindMount {
    fn id(&self) -> MountId {
        self.id
    }

    fn host_path(&self) -> String {
        self.host_path.clone()
    }

    fn container_path(&self) -> String {
        self.container_path.clone()
    }

    fn on_search_path(&self) -> bool {
        self.search_path
    }

    fn bind(&self) -> Option<BindSpec> {
        Some(BindSpec {
            source: self.host_path.clone(),
            target: self.container_path.clone(),
            kind: self.kind,
        })
    }
}
