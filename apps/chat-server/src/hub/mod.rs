//! The connection hub: room registry, event dispatch and distributed fan-out.
//!
//! A [`Hub`] is an explicit, cheaply cloneable handle. Every event handler
//! delivers to local members first and then publishes a [`RelayMessage`] on
//! the room's broker channel, where the relay of every other process picks it
//! up and re-broadcasts it to that process's own members.

pub mod connection;
pub mod handlers;
mod presence;
pub mod reconnect;
mod relay;
pub mod room;
pub mod server;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chat_common::id::{prefix, prefixed_ulid};
use chat_common::{Event, EventType, Message, RelayMessage};
use metrics::{counter, gauge, histogram};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use utoipa::ToSchema;

use crate::broker::{self, Broker};
use crate::error::HubError;
use crate::metrics::{ACTIVE_ROOMS, BROKER_PUBLISH_ERRORS_TOTAL, MESSAGE_LATENCY_SECONDS};

pub use connection::{Connection, ConnectionSettings, ConnectionState};
pub use handlers::EventHandler;
pub use reconnect::{Dialer, ReconnectPolicy, Reconnector};
pub use room::Room;

/// Process-wide hub settings.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Identity stamped on every relayed message. Unique per process.
    pub server_id: String,
    /// Lifetime of the distributed room record.
    pub room_ttl: Duration,
    /// Lifetime of this process's presence counters.
    pub presence_ttl: Duration,
    /// How often presence counters are rewritten.
    pub presence_refresh: Duration,
    /// Upper bound on a single broker round-trip.
    pub broker_timeout: Duration,
    /// How long a room nobody has joined on this process is kept locally.
    pub empty_room_grace: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        let presence_ttl = Duration::from_secs(60 * 60);
        Self {
            server_id: prefixed_ulid(prefix::SERVER),
            room_ttl: Duration::from_secs(24 * 60 * 60),
            presence_ttl,
            presence_refresh: presence_ttl / 2,
            broker_timeout: Duration::from_secs(5),
            empty_room_grace: Duration::from_secs(10 * 60),
        }
    }
}

/// Local snapshot of the rooms hosted by this process.
#[derive(Debug, Serialize, ToSchema)]
pub struct RoomStats {
    pub total_rooms: usize,
    pub server_id: String,
    /// Local member count per room id.
    pub room_clients: BTreeMap<String, usize>,
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    settings: HubSettings,
    broker: Arc<dyn Broker>,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    handlers: RwLock<HashMap<EventType, Arc<dyn EventHandler>>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Hub {
    /// Build a hub with the default handler table. Background tasks are not
    /// running until [`Hub::start`].
    pub fn new(broker: Arc<dyn Broker>, settings: HubSettings) -> Self {
        let hub = Self {
            inner: Arc::new(HubInner {
                settings,
                broker,
                rooms: RwLock::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        };
        handlers::register_defaults(&hub);
        hub
    }

    /// Subscribe to room traffic and spawn the relay and presence refresher.
    ///
    /// The subscription is established before this returns, so anything
    /// published afterwards reaches this process.
    pub async fn start(&self) -> Result<(), HubError> {
        let subscription = self
            .broker_call(self.inner.broker.psubscribe(broker::ROOM_PATTERN))
            .await?;

        self.inner.tasks.spawn(relay::run(self.clone(), subscription));
        self.inner.tasks.spawn(presence::run(self.clone()));

        tracing::info!(server_id = %self.server_id(), "hub started");
        Ok(())
    }

    pub fn server_id(&self) -> &str {
        &self.inner.settings.server_id
    }

    pub fn settings(&self) -> &HubSettings {
        &self.inner.settings
    }

    pub(crate) fn broker(&self) -> &Arc<dyn Broker> {
        &self.inner.broker
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Install `handler` for `kind`, replacing any previous one.
    pub fn register_handler(&self, kind: EventType, handler: impl EventHandler + 'static) {
        self.inner.handlers.write().insert(kind, Arc::new(handler));
    }

    /// Route `event` to its handler on the caller's task.
    pub async fn process_event(&self, event: Event, conn: &Arc<Connection>) -> Result<(), HubError> {
        let handler = self
            .inner
            .handlers
            .read()
            .get(&event.kind)
            .cloned()
            .ok_or_else(|| HubError::HandlerNotFound(event.kind.to_string()))?;

        let kind = event.kind.to_string();
        let started = Instant::now();
        let result = handler.handle(self, event, conn).await;
        histogram!(MESSAGE_LATENCY_SECONDS, "type" => kind).record(started.elapsed().as_secs_f64());
        result
    }

    /// Create `room_id` cluster-wide on behalf of `creator`.
    ///
    /// Fails with [`HubError::RoomAlreadyExists`] if any process already holds
    /// the room record, including when two creators race for the same id.
    pub async fn create_room(&self, room_id: &str, creator: &str) -> Result<(), HubError> {
        if room_id.is_empty() {
            return Err(HubError::MissingRoomId);
        }

        let key = broker::room_key(room_id);
        if self.broker_call(self.inner.broker.exists(&key)).await? {
            return Err(HubError::RoomAlreadyExists(room_id.to_string()));
        }

        self.insert_room(room_id)?;

        let record = self.room_record(room_id, creator);
        let ttl = self.inner.settings.room_ttl.as_secs();
        match self
            .broker_call(self.inner.broker.hash_create(&key, &record, ttl))
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.rollback_room(room_id);
                return Err(HubError::RoomAlreadyExists(room_id.to_string()));
            }
            Err(err) => {
                tracing::error!(room_id, %err, "failed to store room record, rolling back");
                self.rollback_room(room_id);
                return Err(err);
            }
        }

        let created = Event::new(
            EventType::CreateRoom,
            Message::new(creator, format!("{creator} created the room"), room_id),
        );
        self.publish(created).await;

        tracing::info!(room_id, created_by = creator, "room created");
        Ok(())
    }

    pub fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.inner.rooms.read().get(room_id).cloned()
    }

    pub fn room_stats(&self) -> RoomStats {
        let rooms = self.inner.rooms.read();
        RoomStats {
            total_rooms: rooms.len(),
            server_id: self.server_id().to_string(),
            room_clients: rooms
                .iter()
                .map(|(id, room)| (id.clone(), room.member_count()))
                .collect(),
        }
    }

    /// Leave whatever room `conn` is in. Called once its pumps have stopped.
    pub async fn disconnect(&self, conn: &Arc<Connection>) {
        let Some(room_id) = conn.room_id() else {
            return;
        };

        let leave = Event::new(EventType::LeaveRoom, room_only(&room_id));
        match self.process_event(leave, conn).await {
            Ok(()) => {}
            Err(err @ (HubError::NotMember { .. } | HubError::RoomNotFound(_))) => {
                tracing::debug!(conn_id = %conn.id(), room_id = %room_id, %err, "nothing to leave on disconnect");
            }
            Err(err) => {
                tracing::warn!(conn_id = %conn.id(), room_id = %room_id, %err, "leave on disconnect failed");
            }
        }
    }

    /// Re-issue a join for the last room `conn` was in, after a redial.
    pub async fn rejoin(&self, conn: &Arc<Connection>) {
        let Some(room_id) = conn.room_id() else {
            return;
        };

        let join = Event::new(EventType::JoinRoom, room_only(&room_id));
        match self.process_event(join, conn).await {
            Ok(()) | Err(HubError::AlreadyMember { .. }) => {
                tracing::info!(conn_id = %conn.id(), room_id = %room_id, "room membership restored");
            }
            Err(err) => {
                tracing::warn!(conn_id = %conn.id(), room_id = %room_id, %err, "failed to restore room membership");
            }
        }
    }

    /// Stop the relay and presence tasks and drop this process's presence
    /// keys. Member connections are left alone.
    pub async fn cleanup(&self) {
        tracing::info!(server_id = %self.server_id(), "starting hub cleanup");

        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        for room in self.rooms_snapshot() {
            let key = broker::presence_key(room.id(), self.server_id());
            if let Err(err) = self.broker_call(self.inner.broker.del(&key)).await {
                tracing::warn!(room_id = %room.id(), %err, "failed to remove presence key");
            }
        }

        tracing::info!(server_id = %self.server_id(), "hub cleanup completed");
    }

    // -- primitives shared by the handlers, relay and presence tasks --

    pub(crate) fn rooms_snapshot(&self) -> Vec<Arc<Room>> {
        self.inner.rooms.read().values().cloned().collect()
    }

    /// Run a broker call under the configured timeout.
    pub(crate) async fn broker_call<T>(
        &self,
        call: impl Future<Output = Result<T, HubError>>,
    ) -> Result<T, HubError> {
        let limit = self.inner.settings.broker_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_elapsed) => Err(HubError::BrokerUnavailable(format!(
                "broker call timed out after {limit:?}"
            ))),
        }
    }

    /// Publish `event` to its room channel. Failures are logged and counted;
    /// local delivery has already happened by the time this runs.
    pub(crate) async fn publish(&self, event: Event) {
        let channel = broker::room_channel(event.room_id());
        let relay = RelayMessage::new(event, self.server_id());
        let payload = match serde_json::to_string(&relay) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(?err, "failed to encode relay message");
                return;
            }
        };

        if let Err(err) = self
            .broker_call(self.inner.broker.publish(&channel, &payload))
            .await
        {
            counter!(BROKER_PUBLISH_ERRORS_TOTAL).increment(1);
            tracing::error!(
                room_id = %relay.room_id,
                event_type = %relay.event.kind,
                %err,
                "failed to publish to broker"
            );
        }
    }

    /// Record how many members `room_id` has on this process. Zero removes
    /// the counter.
    pub(crate) async fn set_presence(&self, room_id: &str, members: usize) {
        let key = broker::presence_key(room_id, self.server_id());
        let result = if members == 0 {
            self.broker_call(self.inner.broker.del(&key)).await
        } else {
            let ttl = self.inner.settings.presence_ttl.as_secs();
            self.broker_call(self.inner.broker.set_ex(&key, &members.to_string(), ttl))
                .await
        };

        if let Err(err) = result {
            tracing::warn!(room_id, members, %err, "failed to update presence");
        }
    }

    pub(crate) fn room_record(&self, room_id: &str, creator: &str) -> Vec<(&'static str, String)> {
        vec![
            ("room_id", room_id.to_string()),
            ("created_by", creator.to_string()),
            ("server_id", self.server_id().to_string()),
            ("created_at", chrono::Utc::now().timestamp().to_string()),
        ]
    }

    /// Insert a fresh local room, failing if one is already hosted here.
    fn insert_room(&self, room_id: &str) -> Result<Arc<Room>, HubError> {
        let mut rooms = self.inner.rooms.write();
        if rooms.contains_key(room_id) {
            return Err(HubError::RoomAlreadyExists(room_id.to_string()));
        }
        let room = Arc::new(Room::new(room_id));
        rooms.insert(room_id.to_string(), room.clone());
        gauge!(ACTIVE_ROOMS).set(rooms.len() as f64);
        Ok(room)
    }

    /// Undo [`Hub::insert_room`] unless someone joined in the meantime.
    fn rollback_room(&self, room_id: &str) {
        let mut rooms = self.inner.rooms.write();
        if rooms.get(room_id).is_some_and(|room| room.is_empty()) {
            rooms.remove(room_id);
            gauge!(ACTIVE_ROOMS).set(rooms.len() as f64);
        }
    }

    /// Drop local rooms that have had no members for longer than the grace
    /// period. Returns how many were evicted.
    ///
    /// The record on the broker is untouched, so a later join materializes
    /// the room again.
    pub(crate) fn evict_idle_rooms(&self) -> usize {
        let grace = self.inner.settings.empty_room_grace;
        let mut rooms = self.inner.rooms.write();
        let before = rooms.len();
        rooms.retain(|room_id, room| {
            let idle = room.is_empty() && room.age() >= grace;
            if idle {
                tracing::debug!(room_id = %room_id, "evicting idle empty room");
            }
            !idle
        });

        let evicted = before - rooms.len();
        if evicted > 0 {
            gauge!(ACTIVE_ROOMS).set(rooms.len() as f64);
        }
        evicted
    }

    /// Add `conn` to the local room, materializing it if needed.
    ///
    /// The add happens under the registry lock so a concurrent last-leave
    /// cannot evict the room between lookup and insert.
    pub(crate) fn join_local(&self, room_id: &str, conn: &Arc<Connection>) -> Result<Arc<Room>, HubError> {
        {
            let rooms = self.inner.rooms.read();
            if let Some(room) = rooms.get(room_id) {
                room.add(conn)?;
                return Ok(room.clone());
            }
        }

        let mut rooms = self.inner.rooms.write();
        let room = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Room::new(room_id)))
            .clone();
        room.add(conn)?;
        gauge!(ACTIVE_ROOMS).set(rooms.len() as f64);
        Ok(room)
    }

    /// Remove `conn` from the local room, evicting the room once empty.
    /// Returns how many local members remain.
    pub(crate) fn leave_local(&self, room_id: &str, conn: &Connection) -> Result<usize, HubError> {
        let mut rooms = self.inner.rooms.write();
        let room = rooms
            .get(room_id)
            .cloned()
            .ok_or_else(|| HubError::RoomNotFound(room_id.to_string()))?;

        room.remove(conn)?;
        let remaining = room.member_count();
        if remaining == 0 {
            rooms.remove(room_id);
            gauge!(ACTIVE_ROOMS).set(rooms.len() as f64);
            tracing::info!(room_id, "room is empty, evicted locally");
        }
        Ok(remaining)
    }
}

fn room_only(room_id: &str) -> Message {
    Message {
        room_id: room_id.to_string(),
        ..Message::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;

    fn hub() -> (Hub, MemoryBroker) {
        let broker = MemoryBroker::new();
        let settings = HubSettings {
            server_id: "srv_test".to_string(),
            ..HubSettings::default()
        };
        (Hub::new(Arc::new(broker.clone()), settings), broker)
    }

    fn conn(username: &str) -> Arc<Connection> {
        Connection::new(username, ConnectionSettings::default())
    }

    #[test]
    fn default_settings() {
        let settings = HubSettings::default();
        assert!(settings.server_id.starts_with("srv_"));
        assert_eq!(settings.presence_refresh, settings.presence_ttl / 2);
        assert_eq!(settings.room_ttl, Duration::from_secs(86_400));
    }

    #[tokio::test]
    async fn unknown_event_type_has_no_handler() {
        let (hub, _) = hub();
        let event = Event::new(EventType::Unknown("typing".into()), room_only("R"));

        let err = hub.process_event(event, &conn("alice")).await.unwrap_err();
        assert!(matches!(err, HubError::HandlerNotFound(kind) if kind == "typing"));
    }

    #[tokio::test]
    async fn create_room_rejects_duplicates() {
        let (hub, broker) = hub();
        hub.create_room("R", "alice").await.unwrap();

        let record = broker.hash_get_all(&broker::room_key("R")).await.unwrap();
        assert_eq!(record.get("created_by").map(String::as_str), Some("alice"));
        assert_eq!(record.get("server_id").map(String::as_str), Some("srv_test"));

        let err = hub.create_room("R", "bob").await.unwrap_err();
        assert!(matches!(err, HubError::RoomAlreadyExists(_)));
        assert_eq!(hub.room_stats().total_rooms, 1);
    }

    #[tokio::test]
    async fn create_room_requires_id() {
        let (hub, _) = hub();
        assert!(matches!(
            hub.create_room("", "alice").await,
            Err(HubError::MissingRoomId)
        ));
    }

    #[test]
    fn leave_local_evicts_empty_room() {
        let (hub, _) = hub();
        let alice = conn("alice");
        let bob = conn("bob");
        hub.join_local("R", &alice).unwrap();
        hub.join_local("R", &bob).unwrap();

        assert_eq!(hub.leave_local("R", &alice).unwrap(), 1);
        assert!(hub.room("R").is_some());
        assert_eq!(hub.leave_local("R", &bob).unwrap(), 0);
        assert!(hub.room("R").is_none());

        assert!(matches!(
            hub.leave_local("R", &bob),
            Err(HubError::RoomNotFound(_))
        ));
    }

    #[test]
    fn room_stats_lists_local_members() {
        let (hub, _) = hub();
        hub.join_local("A", &conn("alice")).unwrap();
        hub.join_local("A", &conn("bob")).unwrap();
        hub.join_local("B", &conn("carol")).unwrap();

        let stats = hub.room_stats();
        assert_eq!(stats.total_rooms, 2);
        assert_eq!(stats.server_id, "srv_test");
        assert_eq!(stats.room_clients.get("A"), Some(&2));
        assert_eq!(stats.room_clients.get("B"), Some(&1));
    }

    #[tokio::test]
    async fn broker_call_times_out() {
        let broker = MemoryBroker::new();
        let settings = HubSettings {
            broker_timeout: Duration::from_millis(10),
            ..HubSettings::default()
        };
        let hub = Hub::new(Arc::new(broker), settings);

        let result: Result<(), HubError> = hub
            .broker_call(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(HubError::BrokerUnavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_empty_rooms_are_evicted_after_grace() {
        let (hub, broker) = hub();
        hub.create_room("EMPTY", "alice").await.unwrap();
        hub.join_local("BUSY", &conn("bob")).unwrap();

        assert_eq!(hub.evict_idle_rooms(), 0);
        assert_eq!(hub.room_stats().total_rooms, 2);

        tokio::time::advance(hub.settings().empty_room_grace).await;
        assert_eq!(hub.evict_idle_rooms(), 1);
        assert!(hub.room("EMPTY").is_none());
        assert!(hub.room("BUSY").is_some());

        // The record outlives the local copy, so the id stays taken.
        assert!(broker.exists(&broker::room_key("EMPTY")).await.unwrap());
        assert!(matches!(
            hub.create_room("EMPTY", "carol").await,
            Err(HubError::RoomAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn cleanup_removes_presence_keys() {
        let (hub, broker) = hub();
        hub.start().await.unwrap();
        hub.join_local("R", &conn("alice")).unwrap();
        hub.set_presence("R", 1).await;

        let key = broker::presence_key("R", "srv_test");
        assert!(broker.exists(&key).await.unwrap());

        hub.cleanup().await;
        assert!(!broker.exists(&key).await.unwrap());
    }
}
