use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::stream;
use tokio::sync::broadcast;

use crate::error::HubError;

use super::{pattern_matches, Broker, BrokerMessage, Subscription};

/// Capacity of the pub/sub channel. Subscribers that fall further behind skip
/// messages, the same way a slow Redis subscriber would be cut off.
const PUBSUB_CAPACITY: usize = 1024;

enum Value {
    Text(String),
    Hash(HashMap<String, String>),
}

struct Stored {
    value: Value,
    expires_at: Option<Instant>,
}

impl Stored {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process broker for tests and single-node deployments.
///
/// Clone one instance into several hubs to simulate multiple server processes
/// sharing a backplane. Publishes loop back to every subscriber, including the
/// publisher's own subscription, exactly like Redis.
#[derive(Clone)]
pub struct MemoryBroker {
    data: std::sync::Arc<DashMap<String, Stored>>,
    sender: broadcast::Sender<BrokerMessage>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(PUBSUB_CAPACITY);
        Self {
            data: std::sync::Arc::new(DashMap::new()),
            sender,
        }
    }

    fn live<R>(&self, key: &str, read: impl FnOnce(&Stored) -> R) -> Option<R> {
        let now = Instant::now();
        let expired = match self.data.get(key) {
            Some(stored) if !stored.is_expired(now) => return Some(read(stored.value())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.data.remove_if(key, |_, stored| stored.is_expired(now));
        }
        None
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn expiry(ttl_secs: u64) -> Option<Instant> {
    Some(Instant::now() + Duration::from_secs(ttl_secs))
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn exists(&self, key: &str) -> Result<bool, HubError> {
        Ok(self.live(key, |_| ()).is_some())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, HubError> {
        Ok(self
            .live(key, |stored| match &stored.value {
                Value::Hash(fields) => fields.clone(),
                Value::Text(_) => HashMap::new(),
            })
            .unwrap_or_default())
    }

    async fn hash_create(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl_secs: u64,
    ) -> Result<bool, HubError> {
        let now = Instant::now();
        let stored = Stored {
            value: Value::Hash(
                fields
                    .iter()
                    .map(|(f, v)| (f.to_string(), v.clone()))
                    .collect(),
            ),
            expires_at: expiry(ttl_secs),
        };

        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut existing) => {
                if !existing.get().is_expired(now) {
                    return Ok(false);
                }
                existing.insert(stored);
            }
            Entry::Vacant(slot) => {
                slot.insert(stored);
            }
        }
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, HubError> {
        Ok(self
            .live(key, |stored| match &stored.value {
                Value::Text(text) => Some(text.clone()),
                Value::Hash(_) => None,
            })
            .flatten())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), HubError> {
        self.data.insert(
            key.to_string(),
            Stored {
                value: Value::Text(value.to_string()),
                expires_at: expiry(ttl_secs),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), HubError> {
        self.data.remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), HubError> {
        // No subscribers is not an error, as with Redis.
        let _ = self.sender.send(BrokerMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<Subscription, HubError> {
        let receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let stream = stream::unfold((receiver, pattern), |(mut receiver, pattern)| async move {
            loop {
                match receiver.recv().await {
                    Ok(msg) if pattern_matches(&pattern, &msg.channel) => {
                        return Some((msg, (receiver, pattern)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "memory broker subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
