//! MailGuard Core - Intrusion prevention engine
//!
//! This crate turns authentication failure log lines into nftables drop
//! rules:
//! - nftables JSON command client and per-family chain tracking
//! - Ban ledger with escalating ban times
//! - Ban coordinator owning the ledger and the kernel firewall state
//! - Log watcher and periodic reconciliation service

pub mod bans;
pub mod netfilter;
pub mod service;

pub use bans::{BanCoordinator, BanOutcome, DnsResolver};
pub use netfilter::{ChainTracker, NftProcess};
pub use service::{NetfilterService, ServiceHandle, ServiceState};
