//! Shared helpers for binaries.

pub mod bootstrap;
pub mod retry;
