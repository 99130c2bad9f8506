//! Key/value store abstraction for persisted ban state

use async_trait::async_trait;
use mailguard_common::config::RedisConfig;
use mailguard_common::{Error, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::events::MemorySubscriber;

/// Active automatic bans: network -> unix deadline
pub const ACTIVE_BANS: &str = "F2B_ACTIVE_BANS";
/// Operator and blacklist driven bans: network -> unix timestamp
pub const PERM_BANS: &str = "F2B_PERM_BANS";
/// Deny list entries (literal or hostname)
pub const BLACKLIST: &str = "F2B_BLACKLIST";
/// Allow list entries (literal or hostname)
pub const WHITELIST: &str = "F2B_WHITELIST";
/// Networks whose ban should be lifted early
pub const QUEUE_UNBAN: &str = "F2B_QUEUE_UNBAN";

/// Hash-oriented key/value store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Set a field of a hash
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Remove a field from a hash
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    /// Read a whole hash
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Read the field names of a hash
    async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.hgetall(key).await?.into_keys().collect())
    }

    /// Delete a key
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Redis backed store
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    connection: ConnectionManager,
}

impl RedisStore {
    /// Connect to redis from config
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url())
            .map_err(|e| Error::Store(format!("Invalid redis URL: {}", e)))?;
        let connection = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| Error::Store(format!("Failed to connect to redis: {}", e)))?;

        info!(host = %config.host, port = config.port, "Connected to redis");

        Ok(Self { client, connection })
    }

    /// Underlying client, used to open pub/sub connections
    pub fn client(&self) -> &redis::Client {
        &self.client
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut con = self.connection.clone();
        let _: () = con
            .hset(key, field, value)
            .await
            .map_err(|e| Error::Store(format!("HSET {} {} failed: {}", key, field, e)))?;
        debug!(key = %key, field = %field, "Stored hash field");
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut con = self.connection.clone();
        let _: () = con
            .hdel(key, field)
            .await
            .map_err(|e| Error::Store(format!("HDEL {} {} failed: {}", key, field, e)))?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut con = self.connection.clone();
        con.hgetall(key)
            .await
            .map_err(|e| Error::Store(format!("HGETALL {} failed: {}", key, e)))
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        let mut con = self.connection.clone();
        con.hkeys(key)
            .await
            .map_err(|e| Error::Store(format!("HKEYS {} failed: {}", key, e)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut con = self.connection.clone();
        let _: () = con
            .del(key)
            .await
            .map_err(|e| Error::Store(format!("DEL {} failed: {}", key, e)))?;
        Ok(())
    }
}

/// In-memory store with an in-process event bus
pub struct MemoryStore {
    hashes: RwLock<HashMap<String, HashMap<String, String>>>,
    bus: broadcast::Sender<(String, String)>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(1024);
        Self {
            hashes: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Publish a message on a channel, returning the number of receivers
    pub fn publish(&self, channel: &str, message: &str) -> usize {
        self.bus
            .send((channel.to_string(), message.to_string()))
            .unwrap_or(0)
    }

    /// Open a subscriber on this store's event bus
    pub fn subscriber(&self) -> MemorySubscriber {
        MemorySubscriber::new(self.bus.subscribe())
    }

    /// Read a single hash field
    pub async fn hget(&self, key: &str, field: &str) -> Option<String> {
        let hashes = self.hashes.read().await;
        hashes.get(key).and_then(|h| h.get(field)).cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut hashes = self.hashes.write().await;
        hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut hashes = self.hashes.write().await;
        if let Some(hash) = hashes.get_mut(key) {
            hash.remove(field);
            if hash.is_empty() {
                hashes.remove(key);
            }
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let hashes = self.hashes.read().await;
        Ok(hashes.get(key).cloned().unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut hashes = self.hashes.write().await;
        hashes.remove(key);
        Ok(())
    }
}
