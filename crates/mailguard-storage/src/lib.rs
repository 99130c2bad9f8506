//! MailGuard Storage - Persisted ban state and event bus access
//!
//! This crate provides the key/value store holding the ban mirrors and
//! list sources, and the pub/sub subscriber delivering log lines,
//! backed by redis or by memory.

pub mod events;
pub mod store;

pub use events::{EventSubscriber, MemorySubscriber, RedisSubscriber};
pub use store::{
    KeyValueStore, MemoryStore, RedisStore, ACTIVE_BANS, BLACKLIST, PERM_BANS, QUEUE_UNBAN,
    WHITELIST,
};
