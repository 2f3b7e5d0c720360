//! Exclusion rules for mount archives
//!
//! Version-control metadata and bytecode/editor caches are left out by
//! default. Extra globs come from the launch file or an ignore file with one
//! pattern per line (`#` starts a comment).

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::Path;

/// Version-control metadata.
const VCS_EXCLUDES: &[&str] = &[
    "**/.git",
    "**/.git/**",
    "**/.hg",
    "**/.hg/**",
    "**/.svn",
    "**/.svn/**",
];

/// Caches and editor state that never belong on a worker.
const CACHE_EXCLUDES: &[&str] = &[
    "**/__pycache__",
    "**/__pycache__/**",
    "**/*.pyc",
    "**/.idea",
    "**/.idea/**",
    "**/*.egg-info",
    "**/*.egg-info/**",
    "**/.DS_Store",
];

/// Errors for exclusion rules
#[derive(Debug, thiserror::Error)]
pub enum ExcludeError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Glob pattern error: {0}")]
    GlobError(#[from] globset::Error),
}

/// Exclusion rules for filtering files
#[derive(Debug, Clone)]
pub struct ExcludeRules {
    patterns: Vec<String>,
    glob_set: GlobSet,
}

impl ExcludeRules {
    /// Defaults: VCS metadata and caches.
    pub fn new() -> Result<Self, ExcludeError> {
        let patterns = VCS_EXCLUDES
            .iter()
            .chain(CACHE_EXCLUDES)
            .map(|p| p.to_string())
            .collect();
        Self::from_patterns(patterns)
    }

    /// Exactly `patterns`, no defaults.
    pub fn from_patterns(patterns: Vec<String>) -> Result<Self, ExcludeError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            patterns,
            glob_set: builder.build()?,
        })
    }

    /// Drop the version-control defaults.
    pub fn without_vcs(self) -> Result<Self, ExcludeError> {
        let patterns = self
            .patterns
            .into_iter()
            .filter(|p| !VCS_EXCLUDES.contains(&p.as_str()))
            .collect();
        Self::from_patterns(patterns)
    }

    /// Add patterns from an ignore file
    pub fn with_ignore_file(self, path: &Path) -> Result<Self, ExcludeError> {
        let contents = fs::read_to_string(path)?;
        let patterns: Vec<&str> = contents
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();
        self.with_patterns(&patterns)
    }

    /// Add additional patterns
    pub fn with_patterns(mut self, patterns: &[&str]) -> Result<Self, ExcludeError> {
        self.patterns.extend(
            patterns
                .iter()
                .filter(|p| !p.is_empty())
                .map(|p| p.to_string()),
        );
        Self::from_patterns(self.patterns)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Check if a path (relative to the archive root) should be excluded
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.glob_set.is_match(path)
    }
}
