use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::HubError;

use super::{Broker, BrokerMessage, Subscription};

/// Writes every field and the expiry in one step, or nothing if the key is
/// already taken. `ARGV[1]` is the TTL, the rest are field/value pairs.
const CREATE_RECORD: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV, 2))
redis.call('EXPIRE', KEYS[1], ARGV[1])
return 1
";

/// Redis-backed broker.
///
/// Commands share one multiplexed [`ConnectionManager`]; every pattern
/// subscription opens its own dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Connect to `url` and verify the server answers `PING`.
    pub async fn connect(url: &str) -> Result<Self, HubError> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client.clone()).await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        tracing::info!("redis connection established");

        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn exists(&self, key: &str) -> Result<bool, HubError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, HubError> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hash_create(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl_secs: u64,
    ) -> Result<bool, HubError> {
        if fields.is_empty() {
            return Ok(false);
        }

        let script = redis::Script::new(CREATE_RECORD);
        let mut invocation = script.key(key);
        invocation.arg(ttl_secs);
        for (field, value) in fields {
            invocation.arg(*field).arg(value);
        }

        let mut conn = self.conn.clone();
        let created: bool = invocation.invoke_async(&mut conn).await?;
        Ok(created)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, HubError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), HubError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), HubError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), HubError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<Subscription, HubError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(BrokerMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                }),
                Err(err) => {
                    tracing::warn!(?err, "non-text payload on room channel");
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use chat_common::id::prefixed_ulid;

    use super::*;

    #[tokio::test]
    #[ignore = "needs a Redis server at REDIS_URL"]
    async fn hash_create_writes_fields_and_expiry_together() {
        let url = std::env::var("REDIS_URL").expect("REDIS_URL");
        let broker = RedisBroker::connect(&url).await.unwrap();
        let key = crate::broker::room_key(&prefixed_ulid("test"));

        let fields = [
            ("room_id", "R".to_string()),
            ("created_by", "alice".to_string()),
        ];
        assert!(broker.hash_create(&key, &fields, 60).await.unwrap());

        let record = broker.hash_get_all(&key).await.unwrap();
        assert_eq!(record.get("room_id").map(String::as_str), Some("R"));
        assert_eq!(record.get("created_by").map(String::as_str), Some("alice"));

        let mut conn = broker.conn.clone();
        let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(&mut conn).await.unwrap();
        assert!((1..=60).contains(&ttl), "ttl was {ttl}");

        let late = [("room_id", "R".to_string()), ("created_by", "bob".to_string())];
        assert!(!broker.hash_create(&key, &late, 60).await.unwrap());
        let record = broker.hash_get_all(&key).await.unwrap();
        assert_eq!(record.get("created_by").map(String::as_str), Some("alice"));

        broker.del(&key).await.unwrap();
    }
}
