//! Default handlers for client-originated events.

use std::sync::Arc;

use async_trait::async_trait;
use chat_common::event::SYSTEM_SENDER;
use chat_common::{Event, EventType, Message};
use metrics::counter;

use crate::broker;
use crate::error::HubError;
use crate::metrics::MESSAGES_SENT_TOTAL;

use super::connection::Connection;
use super::Hub;

/// Handles one kind of inbound event on behalf of a connection.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, hub: &Hub, event: Event, conn: &Arc<Connection>) -> Result<(), HubError>;
}

pub(super) fn register_defaults(hub: &Hub) {
    hub.register_handler(EventType::CreateRoom, CreateRoom);
    hub.register_handler(EventType::JoinRoom, JoinRoom);
    hub.register_handler(EventType::LeaveRoom, LeaveRoom);
    hub.register_handler(EventType::SendMessage, SendMessage);
}

fn required_room_id(event: &Event) -> Result<String, HubError> {
    match event.room_id() {
        "" => Err(HubError::MissingRoomId),
        id => Ok(id.to_string()),
    }
}

pub struct CreateRoom;

#[async_trait]
impl EventHandler for CreateRoom {
    async fn handle(&self, hub: &Hub, event: Event, conn: &Arc<Connection>) -> Result<(), HubError> {
        let room_id = required_room_id(&event)?;
        hub.create_room(&room_id, conn.username()).await
    }
}

/// Joins a room, creating it on first use.
///
/// A room unknown locally is looked up on the broker. If another process
/// created it, an empty local copy is materialized. If nobody did, the
/// record is written here; a failed write is logged and the local room kept.
///
/// A connection sits in one room at a time: joining a different room leaves
/// the current one first.
pub struct JoinRoom;

#[async_trait]
impl EventHandler for JoinRoom {
    async fn handle(&self, hub: &Hub, event: Event, conn: &Arc<Connection>) -> Result<(), HubError> {
        let room_id = required_room_id(&event)?;
        let username = conn.username();

        if let Some(previous) = conn.room_id().filter(|current| *current != room_id) {
            if let Err(err) = leave_room(hub, &previous, conn).await {
                tracing::debug!(room_id = %previous, username, %err, "previous room already left");
                conn.clear_room_id(&previous);
            }
        }

        if hub.room(&room_id).is_none() {
            ensure_room_record(hub, &room_id, username).await?;
        }

        let room = hub.join_local(&room_id, conn)?;
        conn.set_room_id(&room_id);
        hub.set_presence(&room_id, room.member_count()).await;

        let joined = Event::new(
            EventType::UserJoined,
            Message::new(username, format!("{username} joined the room"), &room_id),
        );
        room.broadcast(&joined, None);
        hub.publish(joined).await;

        tracing::info!(
            room_id = %room_id,
            username,
            members = room.member_count(),
            "user joined room"
        );
        Ok(())
    }
}

async fn ensure_room_record(hub: &Hub, room_id: &str, creator: &str) -> Result<(), HubError> {
    let key = broker::room_key(room_id);
    let record = hub.broker_call(hub.broker().hash_get_all(&key)).await?;
    if !record.is_empty() {
        tracing::debug!(room_id, "loaded room from broker");
        return Ok(());
    }

    let fields = hub.room_record(room_id, creator);
    let ttl = hub.settings().room_ttl.as_secs();
    match hub
        .broker_call(hub.broker().hash_create(&key, &fields, ttl))
        .await
    {
        Ok(true) => tracing::info!(room_id, created_by = creator, "created room on first join"),
        Ok(false) => tracing::debug!(room_id, "room record written concurrently"),
        Err(err) => tracing::error!(room_id, %err, "failed to store room record, keeping local room"),
    }
    Ok(())
}

pub struct LeaveRoom;

#[async_trait]
impl EventHandler for LeaveRoom {
    async fn handle(&self, hub: &Hub, event: Event, conn: &Arc<Connection>) -> Result<(), HubError> {
        let room_id = required_room_id(&event)?;
        leave_room(hub, &room_id, conn).await
    }
}

async fn leave_room(hub: &Hub, room_id: &str, conn: &Arc<Connection>) -> Result<(), HubError> {
    let remaining = hub.leave_local(room_id, conn)?;
    hub.set_presence(room_id, remaining).await;
    conn.clear_room_id(room_id);

    let left = Event::new(
        EventType::UserLeft,
        Message::new(
            SYSTEM_SENDER,
            format!("{} has left the room", conn.username()),
            room_id,
        ),
    );
    if let Some(room) = hub.room(room_id) {
        room.broadcast(&left, None);
    }
    hub.publish(left).await;

    tracing::info!(room_id, username = conn.username(), remaining, "user left room");
    Ok(())
}

/// Broadcasts a chat line to every member, the sender included.
pub struct SendMessage;

#[async_trait]
impl EventHandler for SendMessage {
    async fn handle(&self, hub: &Hub, event: Event, conn: &Arc<Connection>) -> Result<(), HubError> {
        let room_id = required_room_id(&event)?;
        let room = hub
            .room(&room_id)
            .ok_or_else(|| HubError::RoomNotFound(room_id.clone()))?;
        if !room.contains(conn) {
            return Err(HubError::NotMember {
                username: conn.username().to_string(),
                room_id,
            });
        }

        let received = Event::new(
            EventType::MessageReceived,
            Message::new(conn.username(), event.payload.content, &room_id),
        );
        room.broadcast(&received, None);
        counter!(MESSAGES_SENT_TOTAL).increment(1);
        hub.publish(received).await;
        Ok(())
    }
}
