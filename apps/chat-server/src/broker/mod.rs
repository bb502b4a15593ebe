//! The shared backplane used for cross-process coordination.
//!
//! Any publish/subscribe service with a TTL-capable key-value side works.
//! Redis backs production deployments; [`memory::MemoryBroker`] backs tests and
//! single-process runs.

pub mod memory;
pub mod redis_broker;

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::HubError;

/// Pattern matching every room channel.
pub const ROOM_PATTERN: &str = "chat:room:*";

/// Pub/sub channel carrying a room's traffic.
pub fn room_channel(room_id: &str) -> String {
    format!("chat:room:{room_id}")
}

/// Hash holding a room's creation metadata.
pub fn room_key(room_id: &str) -> String {
    format!("chat:room:{room_id}")
}

/// Time-boxed count of `server_id`'s local members in a room.
pub fn presence_key(room_id: &str, server_id: &str) -> String {
    format!("chat:room:{room_id}:clients:{server_id}")
}

/// A payload received on a subscribed channel.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: String,
}

/// Messages delivered by a pattern subscription. Ends when the subscription
/// connection is lost.
pub type Subscription = BoxStream<'static, BrokerMessage>;

/// Abstraction over the distributed backplane.
///
/// Implementations are shared by every handler and the relay, so they must be
/// safe to call concurrently.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, HubError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, HubError>;

    /// Create a hash with the given fields and TTL unless `key` already exists.
    ///
    /// Returns `false` when another writer got there first.
    async fn hash_create(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl_secs: u64,
    ) -> Result<bool, HubError>;

    async fn get(&self, key: &str) -> Result<Option<String>, HubError>;

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), HubError>;

    async fn del(&self, key: &str) -> Result<(), HubError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), HubError>;

    async fn psubscribe(&self, pattern: &str) -> Result<Subscription, HubError>;
}

/// Glob match supporting `*` wildcards, as used by pattern subscriptions.
pub fn pattern_matches(pattern: &str, channel: &str) -> bool {
    let (p, c) = (pattern.as_bytes(), channel.as_bytes());
    let (mut pi, mut ci) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ci < c.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ci));
            pi += 1;
        } else if pi < p.len() && p[pi] == c[ci] {
            pi += 1;
            ci += 1;
        } else if let Some((sp, sc)) = star {
            pi = sp + 1;
            ci = sc + 1;
            star = Some((sp, sc + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&b| b == b'*')
}
