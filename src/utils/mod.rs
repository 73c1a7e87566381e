//! Shared helpers for the binaries and transports.

pub mod bootstrap;
pub mod retry;
