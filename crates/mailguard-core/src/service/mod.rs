//! Event and reconciliation service

pub mod patterns;
pub mod runner;

pub use patterns::{FailureMatch, FailurePatterns};
pub use runner::{NetfilterService, ServiceHandle, ServiceState, SnatTarget, EXIT_FATAL, EXIT_OK};
