//! Ban bookkeeping and coordination

pub mod coordinator;
pub mod ledger;
pub mod resolve;

pub use coordinator::{BanCoordinator, BanOutcome, Firewall};
pub use ledger::{AttemptOutcome, BanLedger, BanRecord, ListDiff};
pub use resolve::{resolve_entries, AddressResolver, DnsResolver};
