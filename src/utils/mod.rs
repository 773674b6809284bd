//! Shared helpers for binaries and clients.

pub mod bootstrap;
pub mod retry;
