//! Route handlers.

pub mod exec;
pub mod files;
