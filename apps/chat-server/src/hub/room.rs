//! Per-process membership of a single chat room.

use std::collections::HashMap;
use std::sync::Arc;

use chat_common::Event;
use parking_lot::RwLock;
use tokio::time::{Duration, Instant};

use crate::error::HubError;

use super::connection::Connection;

/// Local view of a room: the members connected to this process.
///
/// Members are keyed by username, so one username holds at most one slot per
/// process.
pub struct Room {
    id: String,
    members: RwLock<HashMap<String, Arc<Connection>>>,
    created_at: Instant,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: RwLock::new(HashMap::new()),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn add(&self, conn: &Arc<Connection>) -> Result<(), HubError> {
        let mut members = self.members.write();
        if members.contains_key(conn.username()) {
            return Err(HubError::AlreadyMember {
                username: conn.username().to_string(),
                room_id: self.id.clone(),
            });
        }
        members.insert(conn.username().to_string(), conn.clone());
        Ok(())
    }

    /// Remove `conn`. The slot must be held by this very connection; a second
    /// connection reusing the username cannot evict the first.
    pub fn remove(&self, conn: &Connection) -> Result<(), HubError> {
        let mut members = self.members.write();
        match members.get(conn.username()) {
            Some(member) if member.id() == conn.id() => {
                members.remove(conn.username());
                Ok(())
            }
            _ => Err(HubError::NotMember {
                username: conn.username().to_string(),
                room_id: self.id.clone(),
            }),
        }
    }

    pub fn contains(&self, conn: &Connection) -> bool {
        self.members
            .read()
            .get(conn.username())
            .is_some_and(|member| member.id() == conn.id())
    }

    /// Enqueue `event` for every member except `exclude`.
    ///
    /// The member list is snapshotted and the lock released before any
    /// enqueue. Returns how many members accepted the event.
    pub fn broadcast(&self, event: &Event, exclude: Option<&Connection>) -> usize {
        let targets: Vec<Arc<Connection>> = self.members.read().values().cloned().collect();

        let mut delivered = 0;
        for member in targets {
            if exclude.is_some_and(|skip| skip.id() == member.id()) {
                continue;
            }
            if member.enqueue(event.clone()) {
                delivered += 1;
            } else {
                tracing::debug!(
                    room_id = %self.id,
                    username = %member.username(),
                    "event not delivered to member"
                );
            }
        }
        delivered
    }

    pub fn member_count(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Time since this local copy was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}
