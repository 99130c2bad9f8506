//! Error types for MailGuard

use thiserror::Error;

/// Main error type for MailGuard
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The packet filter rejected or failed a command.
    #[error("Firewall command error: {message} (command: {command})")]
    Firewall { command: String, message: String },

    /// The managed jump rule is missing or no longer evaluated first.
    #[error("Chain order error: {0}")]
    ChainOrder(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Resolve error: {0}")]
    Resolve(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for MailGuard
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true for conditions that only a full re-setup can repair
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::ChainOrder(_))
    }

    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Firewall { .. } => "FIREWALL_ERROR",
            Error::ChainOrder(_) => "CHAIN_ORDER_ERROR",
            Error::Store(_) => "STORE_ERROR",
            Error::Resolve(_) => "RESOLVE_ERROR",
            Error::InvalidAddress(_) => "INVALID_ADDRESS",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}
