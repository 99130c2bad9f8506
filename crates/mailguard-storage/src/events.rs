//! Event bus subscription for log lines

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use mailguard_common::{Error, Result};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Subscriber to a pub/sub channel carrying free-text log lines
#[async_trait]
pub trait EventSubscriber: Send {
    /// Subscribe to a channel
    async fn subscribe(&mut self, channel: &str) -> Result<()>;

    /// Wait for the next message; `None` once the subscription is closed
    async fn next_message(&mut self) -> Result<Option<String>>;

    /// Close the subscription
    async fn unsubscribe(&mut self) -> Result<()>;
}

/// Redis pub/sub subscriber
pub struct RedisSubscriber {
    client: redis::Client,
    messages: Option<BoxStream<'static, redis::Msg>>,
}

impl RedisSubscriber {
    /// Create a subscriber on a redis client
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            messages: None,
        }
    }
}

#[async_trait]
impl EventSubscriber for RedisSubscriber {
    async fn subscribe(&mut self, channel: &str) -> Result<()> {
        let mut pubsub = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| Error::Store(format!("Failed to open pub/sub connection: {}", e)))?
            .into_pubsub();
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| Error::Store(format!("SUBSCRIBE {} failed: {}", channel, e)))?;

        info!(channel = %channel, "Subscribed to redis channel");
        self.messages = Some(pubsub.into_on_message().boxed());
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<String>> {
        let Some(messages) = self.messages.as_mut() else {
            return Ok(None);
        };

        match messages.next().await {
            Some(msg) => {
                let payload: String = msg
                    .get_payload()
                    .map_err(|e| Error::Store(format!("Invalid pub/sub payload: {}", e)))?;
                Ok(Some(payload))
            }
            None => {
                self.messages = None;
                Ok(None)
            }
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        // Dropping the stream closes the dedicated pub/sub connection.
        if self.messages.take().is_some() {
            debug!("Closed redis pub/sub connection");
        }
        Ok(())
    }
}

/// Subscriber on a [`crate::MemoryStore`] event bus
pub struct MemorySubscriber {
    receiver: Option<broadcast::Receiver<(String, String)>>,
    channel: Option<String>,
}

impl MemorySubscriber {
    pub(crate) fn new(receiver: broadcast::Receiver<(String, String)>) -> Self {
        Self {
            receiver: Some(receiver),
            channel: None,
        }
    }
}

#[async_trait]
impl EventSubscriber for MemorySubscriber {
    async fn subscribe(&mut self, channel: &str) -> Result<()> {
        if self.receiver.is_none() {
            return Err(Error::Store("Subscriber already closed".to_string()));
        }
        self.channel = Some(channel.to_string());
        Ok(())
    }

    async fn next_message(&mut self) -> Result<Option<String>> {
        let Some(channel) = self.channel.clone() else {
            return Ok(None);
        };
        let Some(receiver) = self.receiver.as_mut() else {
            return Ok(None);
        };

        loop {
            match receiver.recv().await {
                Ok((published_on, message)) if published_on == channel => {
                    return Ok(Some(message));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.channel = None;
        self.receiver = None;
        Ok(())
    }
}
