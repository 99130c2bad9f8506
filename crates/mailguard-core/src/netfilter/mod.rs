//! Packet filter control
//!
//! Talks to the kernel packet filter through the nftables JSON protocol and
//! tracks the managed chain of each address family.

pub mod expr;
#[cfg(test)]
pub mod fake;
pub mod nft;
pub mod tables;

pub use nft::{NftBackend, NftClient, NftOutput, NftProcess, Ruleset};
pub use tables::{ChainTracker, Hook, OrderCheck, SnatOutcome};
