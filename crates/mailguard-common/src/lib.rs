//! MailGuard Common - Shared types and utilities
//!
//! This crate provides the configuration, error type and address helpers
//! shared across all MailGuard components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::Family;
